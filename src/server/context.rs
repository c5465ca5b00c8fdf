// src/server/context.rs

//! The bundle of shared handles threaded through server setup.

use crate::config::SharedConfig;
use crate::connection::SessionRegistry;
use crate::core::auth::gate::AuthContext;
use crate::core::events::InterruptBus;
use crate::core::failover::FailoverEngine;
use crate::core::state::ClusterState;
use crate::core::watchdog::Watchdog;
use crate::server::listener::Listeners;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;
use tracing_subscriber::{Registry, filter::EnvFilter, reload};

/// The authentication context, swapped wholesale on reload.
pub type SharedAuth = Arc<RwLock<Arc<AuthContext>>>;

/// Handle for changing the log filter at runtime.
pub type LogReloadHandle = reload::Handle<EnvFilter, Registry>;

pub struct ServerContext {
    pub config: SharedConfig,
    /// Where the configuration was loaded from; reload re-reads it.
    pub config_path: String,
    pub state: Arc<ClusterState>,
    pub sessions: Arc<SessionRegistry>,
    pub auth: SharedAuth,
    pub bus: Arc<InterruptBus>,
    pub engine: Arc<FailoverEngine>,
    pub watchdog: Arc<dyn Watchdog>,
    pub pcp_restart: Arc<Notify>,
    pub listeners: Arc<Listeners>,
    /// Cleared when the pool stops accepting new clients.
    pub accepting: Arc<AtomicBool>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<()>,
    pub log_reload_handle: Arc<LogReloadHandle>,
}
