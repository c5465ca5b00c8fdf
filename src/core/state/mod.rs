// src/core/state/mod.rs

//! The shared state record and its satellite types: backend records, the
//! failover request ring, health-check statistics and status persistence.

pub mod backend;
pub mod core;
pub mod persistence;
pub mod request;
pub mod stats;

pub use backend::{
    BackendDesc, BackendRecord, BackendRole, BackendSnapshot, BackendStatus, MAX_BACKENDS, NO_NODE,
    NodeFlag, NodeId,
};
pub use self::core::{ClusterState, LockAcquire};
pub use request::{FailoverRequest, RequestFlags, RequestKind};
pub use stats::HealthCheckStats;
