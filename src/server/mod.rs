// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;

pub mod context;
pub mod initialization;
pub mod listener;
pub mod spawner;
pub mod stream;

pub use context::{LogReloadHandle, ServerContext, SharedAuth};
pub use stream::AnyStream;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(
    config: Config,
    config_path: String,
    log_reload_handle: Arc<LogReloadHandle>,
) -> Result<()> {
    // 1. Build shared state, load authentication inputs, bind sockets.
    let mut server_context =
        initialization::setup(config, config_path, log_reload_handle).await?;

    // 2. Spawn all worker tasks.
    spawner::spawn_all(&mut server_context);

    // 3. Run the supervisor loop until shutdown.
    crate::core::supervisor::run(server_context).await
}
