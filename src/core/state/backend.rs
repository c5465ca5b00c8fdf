// src/core/state/backend.rs

//! Backend descriptors and the live per-backend records held in the shared
//! state record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Hard upper bound on the number of backend slots. Configuration validation
/// rejects anything beyond it; iteration always uses the configured count.
pub const MAX_BACKENDS: usize = 128;

/// A backend slot index. `-1` is used in wire payloads and command
/// substitution for "no such node".
pub type NodeId = i32;

/// Sentinel for "no node" in primary/main node bookkeeping.
pub const NO_NODE: NodeId = -1;

/// The liveness status of one backend slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BackendStatus {
    /// Slot exists but carries no configured backend.
    Unused,
    /// Configured and considered usable, but no pooled connection exists yet.
    ConnectWait,
    /// In active use.
    Up,
    /// Detached from the pool.
    Down,
}

impl BackendStatus {
    /// A backend the router may send traffic to.
    pub fn is_valid(self) -> bool {
        matches!(self, BackendStatus::ConnectWait | BackendStatus::Up)
    }

    /// The token written to the persistent status file.
    pub fn as_file_token(self) -> &'static str {
        match self {
            BackendStatus::Unused => "unused",
            BackendStatus::ConnectWait | BackendStatus::Up => "up",
            BackendStatus::Down => "down",
        }
    }
}

/// The replication role of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BackendRole {
    /// Routing main node in raw (non-streaming) mode.
    Main,
    /// Non-main node in raw mode.
    Replica,
    /// Writable streaming-replication primary.
    Primary,
    /// Read-only streaming-replication standby.
    Standby,
}

/// Per-node behaviour flags from the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFlag {
    AllowToFailover,
    DisallowToFailover,
    AlwaysPrimary,
}

/// Static description of a backend, loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDesc {
    pub hostname: String,
    pub port: u16,
    /// Load-balance weight; relative to the other backends.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// The backend's data directory, passed to failover commands.
    #[serde(default)]
    pub data_directory: String,
    #[serde(default)]
    pub flags: Vec<NodeFlag>,
}

fn default_weight() -> f64 {
    1.0
}

impl BackendDesc {
    pub fn disallows_failover(&self) -> bool {
        self.flags.contains(&NodeFlag::DisallowToFailover)
    }

    pub fn always_primary(&self) -> bool {
        self.flags.contains(&NodeFlag::AlwaysPrimary)
    }

    /// Whether the hostname denotes a Unix-domain socket directory.
    pub fn is_unix(&self) -> bool {
        self.hostname.starts_with('/')
    }
}

/// The mutable, shared record for one backend slot. Only the failover engine
/// writes status/role; only the replication verifier writes lag fields.
#[derive(Debug, Clone)]
pub struct BackendRecord {
    pub status: BackendStatus,
    pub role: BackendRole,
    /// Down, but recoverable without operator action.
    pub quarantine: bool,
    /// The role the node held when it was quarantined, so primary identity
    /// survives a quarantine round-trip.
    pub role_before_quarantine: Option<BackendRole>,
    /// Replication lag behind the primary; bytes or microseconds depending on
    /// `delay_by_time`.
    pub standby_delay: u64,
    pub delay_by_time: bool,
    /// `pg_stat_replication.state` for this standby, e.g. "streaming".
    pub replication_state: String,
    /// `pg_stat_replication.sync_state` for this standby, e.g. "async".
    pub replication_sync_state: String,
    pub status_changed_at: DateTime<Utc>,
}

impl BackendRecord {
    pub fn new(status: BackendStatus) -> Self {
        Self {
            status,
            role: BackendRole::Replica,
            quarantine: false,
            role_before_quarantine: None,
            standby_delay: 0,
            delay_by_time: false,
            replication_state: String::new(),
            replication_sync_state: String::new(),
            status_changed_at: Utc::now(),
        }
    }
}

/// A consistent by-value view of one backend, served to any reader.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub node_id: NodeId,
    pub desc: BackendDesc,
    pub record: BackendRecord,
}

impl BackendSnapshot {
    /// True when the router may use this backend.
    pub fn is_valid(&self) -> bool {
        self.record.status.is_valid()
    }
}
