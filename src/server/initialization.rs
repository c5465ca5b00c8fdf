// src/server/initialization.rs

//! Builds the shared state, loads the authentication inputs and binds the
//! listening sockets.

use super::context::{LogReloadHandle, ServerContext, SharedAuth};
use super::listener::Listeners;
use crate::config::{Config, into_shared};
use crate::connection::SessionRegistry;
use crate::core::auth::gate::AuthContext;
use crate::core::auth::hba::HbaRules;
use crate::core::auth::keyfile;
use crate::core::auth::passwd::PasswordStore;
use crate::core::events::InterruptBus;
use crate::core::failover::{FailoverEngine, NetworkPrimaryProber, ShellCommandRunner};
use crate::core::state::ClusterState;
use crate::core::watchdog::LocalOnlyWatchdog;
use anyhow::{Context as AnyhowContext, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Loads HBA rules, the password store and the pool key into one swap-able
/// authentication context. Startup errors are fatal; the reload path keeps
/// the previous context instead.
pub fn load_auth_context(config: &Config) -> Result<AuthContext> {
    let hba = HbaRules::load(Path::new(&config.auth.hba_file))
        .with_context(|| format!("cannot load HBA rules from {}", config.auth.hba_file))?;
    info!(
        "loaded {} HBA rules from {}",
        hba.len(),
        config.auth.hba_file
    );
    let passwd = PasswordStore::load(Path::new(&config.auth.passwd_file))
        .with_context(|| format!("cannot load password store from {}", config.auth.passwd_file))?;

    let key = match keyfile::locate(config.auth.key_file.as_deref()) {
        Some(path) if path.exists() => match keyfile::read_key(&path) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("pool key file is unusable: {}", e);
                None
            }
        },
        _ => None,
    };

    Ok(AuthContext {
        hba: Arc::new(hba),
        passwd: Arc::new(passwd),
        key,
    })
}

/// Performs all setup: state record, auth inputs, sockets, engine.
pub async fn setup(
    config: Config,
    config_path: String,
    log_reload_handle: Arc<LogReloadHandle>,
) -> Result<ServerContext> {
    let auth_ctx = load_auth_context(&config)?;
    let auth: SharedAuth = Arc::new(RwLock::new(Arc::new(auth_ctx)));

    let state = Arc::new(
        ClusterState::new(
            config.backends.clone(),
            config.streaming_replication,
            PathBuf::from(&config.status_file),
        )
        .context("cannot build cluster state")?,
    );
    info!(
        "cluster state ready: {} backends, streaming={}",
        state.node_count(),
        state.streaming_mode
    );

    let listeners = Arc::new(
        Listeners::bind(
            &config.listen.host,
            config.listen.port,
            config.listen.socket_dir.as_deref(),
            &config.tls,
        )
        .await?,
    );

    // A unique run id distinguishes this instance toward watchdog peers and
    // in the logs.
    let mut runid_bytes = [0u8; 8];
    getrandom::fill(&mut runid_bytes)
        .map_err(|e| anyhow::anyhow!("cannot generate run id: {e}"))?;
    let run_id = hex::encode(runid_bytes);
    info!("pool run id: {}", run_id);

    let config = into_shared(config);
    let sessions = Arc::new(SessionRegistry::new());
    let bus = Arc::new(InterruptBus::new());
    let pcp_restart = Arc::new(Notify::new());
    let watchdog = Arc::new(LocalOnlyWatchdog::new(format!(
        "{}:{run_id}",
        hostname_or_default()
    )));

    let engine = Arc::new(FailoverEngine::new(
        state.clone(),
        config.clone(),
        sessions.clone(),
        watchdog.clone(),
        Arc::new(ShellCommandRunner),
        Arc::new(NetworkPrimaryProber::new(state.clone(), config.clone())),
        bus.clone(),
        pcp_restart.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel(8);

    Ok(ServerContext {
        config,
        config_path,
        state,
        sessions,
        auth,
        bus,
        engine,
        watchdog,
        pcp_restart,
        listeners,
        accepting: Arc::new(AtomicBool::new(true)),
        shutdown_tx,
        background_tasks: JoinSet::new(),
        log_reload_handle,
    })
}

fn hostname_or_default() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}
