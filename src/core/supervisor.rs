// src/core/supervisor.rs

//! The supervisor main loop: translates operator signals onto the interrupt
//! bus, applies reloads, keeps the session worker population sized, and
//! drives the shutdown sequence.

use crate::config::Config;
use crate::connection::SessionStatus;
use crate::connection::session::spawn_session_worker;
use crate::core::events::{Interrupt, ShutdownMode};
use crate::server::context::ServerContext;
use crate::server::{initialization, spawner};
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

/// Cadence of the dynamic spare-worker evaluation.
const SPARE_TICK: Duration = Duration::from_secs(2);

/// Runs until a shutdown interrupt arrives, then tears the pool down in the
/// requested mode.
pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    let mut interrupts = ctx.bus.subscribe();
    let mut spare_tick = tokio::time::interval(SPARE_TICK);
    spare_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut scale_down_cycles: u32 = 0;

    // The double-exit guard; shutdown runs exactly once.
    let exit_guard = Arc::new(AtomicBool::new(false));

    let mode = loop {
        tokio::select! {
            biased;

            _ = sigterm.recv() => break ShutdownMode::Smart,
            _ = sigint.recv() => break ShutdownMode::Fast,
            _ = sigquit.recv() => break ShutdownMode::Immediate,
            _ = sighup.recv() => {
                info!("SIGHUP received; reloading configuration");
                ctx.bus.raise(Interrupt::Reload);
            }
            _ = sigusr1.recv() => {
                // Watchdog-delivered: a failover request is pending.
                ctx.bus.raise(Interrupt::FailoverRequest);
            }
            _ = sigusr2.recv() => {
                ctx.bus.raise(Interrupt::Wake);
            }

            interrupt = interrupts.recv() => {
                match interrupt {
                    Ok(Interrupt::Shutdown(mode)) => break mode,
                    Ok(Interrupt::Reload) => reload(&ctx),
                    Ok(Interrupt::FailoverRequest) => ctx.state.wake_engine(),
                    Ok(Interrupt::SyncRequired) => sync_from_leader(&ctx).await,
                    Ok(Interrupt::QuorumChanged)
                    | Ok(Interrupt::StateChanged)
                    | Ok(Interrupt::InformQuarantine)
                    | Ok(Interrupt::Wake) => {}
                    Err(e) => {
                        warn!("interrupt bus error: {}", e);
                    }
                }
            }

            _ = spare_tick.tick() => {
                manage_spares(&ctx, &mut scale_down_cycles);
            }
        }
    };

    shutdown(&mut ctx, mode, &exit_guard).await;
    Ok(())
}

/// Re-reads the configuration file and the authentication inputs. Errors
/// keep the previously loaded data in place.
fn reload(ctx: &ServerContext) {
    let new = match Config::from_file(&ctx.config_path) {
        Ok(new) => new,
        Err(e) => {
            warn!(
                "configuration reload failed; keeping current settings: {:#}",
                e
            );
            return;
        }
    };
    if new.backends.len() != ctx.state.node_count() {
        warn!("backend list changes require a restart; keeping the current backend set");
    }
    if let Err(e) = ctx
        .log_reload_handle
        .reload(EnvFilter::new(&new.log_level))
    {
        warn!("cannot update log filter: {}", e);
    }
    match initialization::load_auth_context(&new) {
        Ok(auth) => {
            *ctx.auth.write() = Arc::new(auth);
        }
        Err(e) => {
            warn!(
                "keeping previously loaded authentication data after reload error: {:#}",
                e
            );
        }
    }
    *ctx.config.write() = new;
    info!("configuration reloaded");
}

/// Post-quarantine synchronisation with the watchdog leader's view.
async fn sync_from_leader(ctx: &ServerContext) {
    if !ctx.watchdog.is_enabled() {
        return;
    }
    if let Some(leader) = ctx.watchdog.backend_status_from_leader().await {
        info!(
            "synchronising backend status from watchdog leader \"{}\"",
            leader.node_name
        );
        ctx.state.set_primary_node_id(leader.primary_node_id);
    }
}

/// Dynamic spare-worker management. Excess idle workers are retired after a
/// strategy-dependent number of consecutive over-target cycles; a shortage
/// is corrected immediately.
fn manage_spares(ctx: &ServerContext, scale_down_cycles: &mut u32) {
    let (strategy, min_spare, max_spare, num_init_children) = {
        let config = ctx.config.read();
        (
            config.pool.process_management,
            config.pool.min_spare_children,
            config.pool.max_spare_children,
            config.pool.num_init_children,
        )
    };
    let (cycles_before_scale_down, kills_per_pass) = strategy.tuning();
    let idle = ctx.sessions.idle_count();
    let total = ctx.sessions.count();

    if kills_per_pass == 0 {
        // Static sizing: hold the worker count at num_init_children so
        // workers recycled by a failover are replaced.
        if total < num_init_children {
            let deps = spawner::session_worker_deps(ctx);
            for _ in 0..(num_init_children - total) {
                spawn_session_worker(deps.clone());
            }
        }
        return;
    }

    if idle > max_spare {
        *scale_down_cycles += 1;
        if *scale_down_cycles >= cycles_before_scale_down {
            let excess = (idle - max_spare).min(kills_per_pass);
            let retired = ctx.sessions.retire_idle(excess);
            info!("retired {} spare session workers", retired);
            *scale_down_cycles = 0;
        }
    } else {
        *scale_down_cycles = 0;
        if idle < min_spare && total < num_init_children {
            let deficit = (min_spare - idle).min(num_init_children - total);
            let deps = spawner::session_worker_deps(ctx);
            for _ in 0..deficit {
                spawn_session_worker(deps.clone());
            }
            info!("spawned {} spare session workers", deficit);
        }
    }
}

async fn shutdown(ctx: &mut ServerContext, mode: ShutdownMode, exit_guard: &AtomicBool) {
    if exit_guard.swap(true, Ordering::SeqCst) {
        return;
    }
    info!("shutting down ({:?})", mode);
    ctx.accepting.store(false, Ordering::Release);

    // A follow-primary run cannot be cancelled; shutdown waits for it.
    ctx.engine.wait_follow_done().await;

    if mode == ShutdownMode::Smart {
        // Wake workers parked on accept; they observe the cleared flag and
        // exit. Workers with live client sessions finish them first.
        ctx.sessions
            .kill_matching(|s| s.status == SessionStatus::WaitForConnect);
        while ctx.sessions.count() > 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ctx.sessions
                .kill_matching(|s| s.status == SessionStatus::WaitForConnect);
        }
    }

    // The status file is persisted before session tasks are torn down; the
    // ordering is part of the contract, not an accident.
    if let Err(e) = ctx.state.persist_status() {
        error!("cannot persist backend status at shutdown: {}", e);
    }

    if mode != ShutdownMode::Smart {
        ctx.sessions.kill_all();
    }
    let _ = ctx.shutdown_tx.send(());

    match mode {
        ShutdownMode::Immediate => {
            ctx.background_tasks.shutdown().await;
        }
        _ => {
            let drain = async {
                while ctx.background_tasks.join_next().await.is_some() {}
            };
            if tokio::time::timeout(Duration::from_secs(10), drain)
                .await
                .is_err()
            {
                warn!("worker tasks did not stop in time; aborting them");
                ctx.background_tasks.shutdown().await;
            }
        }
    }
    info!("shutdown complete");
}
