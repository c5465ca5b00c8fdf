// src/server/spawner.rs

//! Spawns all of the pool's long-running worker tasks.

use super::context::ServerContext;
use crate::connection::session::{SessionWorkerDeps, spawn_session_worker};
use crate::core::health::HealthCheckWorker;
use crate::core::pcp::PcpServer;
use crate::core::replication::ReplicationVerifier;
use crate::core::failover::ShellCommandRunner;
use crate::core::state::NodeId;
use std::sync::Arc;
use tracing::info;

/// Spawns the failover engine, the per-backend health checkers, the
/// replication verifier, the control protocol worker and the initial
/// complement of session workers.
pub fn spawn_all(ctx: &mut ServerContext) {
    // --- Failover engine: the single consumer of the request queue ---
    let engine = ctx.engine.clone();
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        engine.run(shutdown_rx).await;
    });

    // --- Health checkers: one per configured backend ---
    let node_count = ctx.state.node_count();
    for node_id in 0..node_count {
        let worker = HealthCheckWorker::new(
            node_id as NodeId,
            ctx.state.clone(),
            ctx.config.clone(),
        );
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            worker.run(shutdown_rx).await;
        });
    }
    info!("spawned {} health check workers", node_count);

    // --- Replication verifier ---
    let verifier = ReplicationVerifier::new(ctx.state.clone(), ctx.config.clone());
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        verifier.run(shutdown_rx).await;
    });

    // --- Control protocol worker ---
    let pcp = PcpServer::new(
        ctx.state.clone(),
        ctx.config.clone(),
        ctx.sessions.clone(),
        ctx.watchdog.clone(),
        Arc::new(ShellCommandRunner),
        ctx.bus.clone(),
        ctx.pcp_restart.clone(),
    );
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        pcp.run(shutdown_rx).await;
    });

    // --- Session workers ---
    let deps = session_worker_deps(ctx);
    let num_init_children = ctx.config.read().pool.num_init_children;
    for _ in 0..num_init_children {
        spawn_session_worker(deps.clone());
    }
    info!("spawned {} session workers", num_init_children);
}

pub fn session_worker_deps(ctx: &ServerContext) -> SessionWorkerDeps {
    SessionWorkerDeps {
        state: ctx.state.clone(),
        config: ctx.config.clone(),
        sessions: ctx.sessions.clone(),
        auth: ctx.auth.clone(),
        listeners: ctx.listeners.clone(),
        accepting: ctx.accepting.clone(),
        shutdown_tx: ctx.shutdown_tx.clone(),
    }
}
