// src/core/watchdog.rs

//! The contract with the external watchdog collaborator. The pool never
//! implements consensus itself; it publishes state to, and takes
//! synchronisation events from, whatever stands behind this trait. The
//! built-in implementation is a watchdog-less single node.

use crate::core::errors::PoolError;
use crate::core::state::{BackendStatus, NodeId};
use async_trait::async_trait;
use serde_json::json;

/// Cluster-wide operations forwarded through the watchdog leader.
#[derive(Debug, Clone)]
pub enum ClusterCommand {
    Shutdown(crate::core::events::ShutdownMode),
    ReloadConfig,
    LockFollowPrimary,
    UnlockFollowPrimary,
}

/// Backend status as published by the watchdog leader.
#[derive(Debug, Clone)]
pub struct LeaderBackendStatus {
    pub node_count: usize,
    pub backend_status: Vec<BackendStatus>,
    pub primary_node_id: NodeId,
    pub node_name: String,
}

#[async_trait]
pub trait Watchdog: Send + Sync {
    /// Whether a real watchdog cluster stands behind this handle.
    fn is_enabled(&self) -> bool;

    /// Forwards a command to every peer via the leader.
    async fn execute_cluster_command(&self, command: ClusterCommand) -> Result<(), PoolError>;

    /// The leader's view of backend statuses, for post-quarantine sync.
    async fn backend_status_from_leader(&self) -> Option<LeaderBackendStatus>;

    /// Serialises follow-primary across peers.
    async fn lock_standby(&self, tag: &str) -> Result<(), PoolError>;
    async fn unlock_standby(&self, tag: &str) -> Result<(), PoolError>;

    /// The JSON payload answered to watchdog-info control requests.
    fn nodes_json(&self, wd_id: Option<u32>) -> serde_json::Value;
}

/// The watchdog-less implementation: cluster commands act locally, locks are
/// no-ops, and the nodes payload describes this single node.
#[derive(Debug)]
pub struct LocalOnlyWatchdog {
    node_name: String,
}

impl LocalOnlyWatchdog {
    pub fn new(node_name: String) -> Self {
        Self { node_name }
    }
}

#[async_trait]
impl Watchdog for LocalOnlyWatchdog {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn execute_cluster_command(&self, _command: ClusterCommand) -> Result<(), PoolError> {
        // No peers; the caller applies the command locally.
        Ok(())
    }

    async fn backend_status_from_leader(&self) -> Option<LeaderBackendStatus> {
        None
    }

    async fn lock_standby(&self, _tag: &str) -> Result<(), PoolError> {
        Ok(())
    }

    async fn unlock_standby(&self, _tag: &str) -> Result<(), PoolError> {
        Ok(())
    }

    fn nodes_json(&self, _wd_id: Option<u32>) -> serde_json::Value {
        json!({
            "WatchdogNodes": [
                {
                    "ID": 0,
                    "NodeName": self.node_name,
                    "State": "MEMBER",
                    "Membership": "LOCAL",
                    "Leader": true,
                }
            ],
            "NodeCount": 1,
            "QuorumStatus": "DISABLED",
        })
    }
}
