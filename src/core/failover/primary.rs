// src/core/failover/primary.rs

//! Primary discovery used by the engine after topology changes. A trait seam
//! so the election logic can be driven in tests with scripted answers.

use crate::config::SharedConfig;
use crate::core::errors::PoolError;
use crate::core::replication::verifier::find_primary_among;
use crate::core::state::{ClusterState, NodeId};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait PrimaryProber: Send + Sync {
    /// Probes the cluster once and reports the primary, or -1.
    async fn find_primary(&self) -> Result<NodeId, PoolError>;
}

/// The production prober: fresh verification connections, the classifier
/// from the replication verifier.
pub struct NetworkPrimaryProber {
    state: Arc<ClusterState>,
    config: SharedConfig,
}

impl NetworkPrimaryProber {
    pub fn new(state: Arc<ClusterState>, config: SharedConfig) -> Self {
        Self { state, config }
    }
}

#[async_trait]
impl PrimaryProber for NetworkPrimaryProber {
    async fn find_primary(&self) -> Result<NodeId, PoolError> {
        find_primary_among(&self.state, &self.config).await
    }
}
