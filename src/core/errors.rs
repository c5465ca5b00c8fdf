// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the pool.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("unexpected EOF on connection")]
    UnexpectedEof,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Reported to clients with this uniform message; the detail only goes to the log.
    #[error("client authentication failed")]
    AuthFailed { detail: String },

    #[error("authentication method \"{0}\" is not permitted")]
    AuthMethodNotPermitted(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("node id {0} is out of range")]
    NodeIdOutOfRange(i32),

    #[error("failover request queue is full")]
    QueueFull,

    #[error("failover or failback is in progress")]
    Switching,

    #[error("not in streaming replication mode")]
    NotInStreamingReplication,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend check timed out: {0}")]
    BackendTimeout(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for PoolError {
    fn clone(&self) -> Self {
        match self {
            PoolError::Io(e) => PoolError::Io(Arc::clone(e)),
            PoolError::UnexpectedEof => PoolError::UnexpectedEof,
            PoolError::Config(s) => PoolError::Config(s.clone()),
            PoolError::Transport(s) => PoolError::Transport(s.clone()),
            PoolError::AuthFailed { detail } => PoolError::AuthFailed {
                detail: detail.clone(),
            },
            PoolError::AuthMethodNotPermitted(s) => PoolError::AuthMethodNotPermitted(s.clone()),
            PoolError::Protocol(s) => PoolError::Protocol(s.clone()),
            PoolError::InvalidState(s) => PoolError::InvalidState(s.clone()),
            PoolError::NodeIdOutOfRange(id) => PoolError::NodeIdOutOfRange(*id),
            PoolError::QueueFull => PoolError::QueueFull,
            PoolError::Switching => PoolError::Switching,
            PoolError::NotInStreamingReplication => PoolError::NotInStreamingReplication,
            PoolError::Backend(s) => PoolError::Backend(s.clone()),
            PoolError::BackendTimeout(s) => PoolError::BackendTimeout(s.clone()),
            PoolError::Fatal(s) => PoolError::Fatal(s.clone()),
        }
    }
}

impl PartialEq for PoolError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PoolError::Io(e1), PoolError::Io(e2)) => e1.to_string() == e2.to_string(),
            (PoolError::Config(s1), PoolError::Config(s2)) => s1 == s2,
            (PoolError::Transport(s1), PoolError::Transport(s2)) => s1 == s2,
            (PoolError::AuthFailed { detail: d1 }, PoolError::AuthFailed { detail: d2 }) => {
                d1 == d2
            }
            (PoolError::Protocol(s1), PoolError::Protocol(s2)) => s1 == s2,
            (PoolError::InvalidState(s1), PoolError::InvalidState(s2)) => s1 == s2,
            (PoolError::NodeIdOutOfRange(a), PoolError::NodeIdOutOfRange(b)) => a == b,
            (PoolError::Backend(s1), PoolError::Backend(s2)) => s1 == s2,
            (PoolError::BackendTimeout(s1), PoolError::BackendTimeout(s2)) => s1 == s2,
            (PoolError::Fatal(s1), PoolError::Fatal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl PoolError {
    /// Whether this error must take the whole pool down: a fatal from any
    /// supervised worker makes the supervisor initiate fast shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PoolError::Fatal(_))
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for PoolError {
    fn from(e: std::str::Utf8Error) -> Self {
        PoolError::Protocol(format!("invalid UTF-8 in message: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for PoolError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        PoolError::Protocol(format!("invalid UTF-8 in message: {e}"))
    }
}

impl From<ParseIntError> for PoolError {
    fn from(e: ParseIntError) -> Self {
        PoolError::Protocol(format!("invalid integer field: {e}"))
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(e: serde_json::Error) -> Self {
        PoolError::Protocol(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for PoolError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PoolError::BackendTimeout("operation timed out".to_string())
    }
}
