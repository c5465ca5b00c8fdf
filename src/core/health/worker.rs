// src/core/health/worker.rs

//! The health-check control loop for a single backend.

use crate::config::SharedConfig;
use crate::core::errors::PoolError;
use crate::core::probe::{ProbeConnection, ProbeCredentials};
use crate::core::state::{
    BackendStatus, ClusterState, FailoverRequest, NodeId, RequestFlags,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Sleep applied when checking is disabled for this node.
const DISABLED_POLL: Duration = Duration::from_secs(30);

/// Outcome of one check session (the initial attempt plus its retries).
enum CheckOutcome {
    Ok(Duration),
    Failed { timed_out: bool },
    Skipped,
}

/// One worker owns exactly one backend slot and issues at most one in-flight
/// verification at a time.
pub struct HealthCheckWorker {
    node_id: NodeId,
    state: Arc<ClusterState>,
    config: SharedConfig,
}

impl HealthCheckWorker {
    pub fn new(node_id: NodeId, state: Arc<ClusterState>, config: SharedConfig) -> Self {
        Self {
            node_id,
            state,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("health check worker for node {} started", self.node_id);
        loop {
            let period = {
                let config = self.config.read();
                config.health_check.period
            };
            if period.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(DISABLED_POLL) => continue,
                    _ = shutdown_rx.recv() => break,
                }
            }

            self.check_once().await;

            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("health check worker for node {} stopped", self.node_id);
    }

    /// Runs one complete check session and feeds the engine as needed.
    pub async fn check_once(&self) {
        let (hc, desc) = {
            let config = self.config.read();
            let desc = config.backends[self.node_id as usize].clone();
            (config.health_check.clone(), desc)
        };

        self.state.with_stats(self.node_id, |s| s.record_start());
        let started = Instant::now();

        let creds = ProbeCredentials {
            user: hc.user.clone(),
            password: hc.password.clone(),
            database: hc.database.clone(),
        };

        let mut retries_used: u32 = 0;
        let outcome = loop {
            if self.fault_injected(&hc.fault_injection_file) {
                break CheckOutcome::Skipped;
            }
            match self.attempt(&desc, &creds, hc.timeout).await {
                Ok(()) => break CheckOutcome::Ok(started.elapsed()),
                Err(e) => {
                    let timed_out = matches!(e, PoolError::BackendTimeout(_));
                    if retries_used < hc.max_retries {
                        retries_used += 1;
                        debug!(
                            "health check retry {}/{} for node {}: {}",
                            retries_used, hc.max_retries, self.node_id, e
                        );
                        tokio::time::sleep(hc.retry_delay).await;
                        continue;
                    }
                    warn!("health check failed for node {}: {}", self.node_id, e);
                    break CheckOutcome::Failed { timed_out };
                }
            }
        };
        if retries_used > 0 {
            self.state
                .with_stats(self.node_id, |s| s.record_retries(retries_used));
        }

        match outcome {
            CheckOutcome::Ok(duration) => {
                self.state.with_stats(self.node_id, |s| {
                    s.record_success(duration.as_millis() as u64)
                });
                self.resurrect_if_quarantined();
            }
            CheckOutcome::Skipped => {
                self.state.with_stats(self.node_id, |s| s.record_skip());
            }
            CheckOutcome::Failed { timed_out } => {
                if desc.disallows_failover() {
                    info!(
                        "node {} is down but carries DISALLOW_TO_FAILOVER; not detaching",
                        self.node_id
                    );
                    return;
                }
                self.state.with_stats(self.node_id, |s| s.record_failure());
                let flags = if timed_out {
                    RequestFlags::empty()
                } else {
                    RequestFlags::SWITCHOVER
                };
                let snapshot = self.state.snapshot(self.node_id);
                let already_down = snapshot
                    .map(|s| s.record.status == BackendStatus::Down)
                    .unwrap_or(false);
                if already_down {
                    return;
                }
                if let Err(e) = self
                    .state
                    .enqueue_request(FailoverRequest::node_down(self.node_id, flags))
                {
                    warn!(
                        "cannot enqueue detach request for node {}: {}",
                        self.node_id, e
                    );
                }
            }
        }
    }

    /// One verification attempt, bounded by the configured timeout.
    async fn attempt(
        &self,
        desc: &crate::core::state::BackendDesc,
        creds: &ProbeCredentials,
        timeout: Duration,
    ) -> Result<(), PoolError> {
        let connect = ProbeConnection::connect(desc, creds);
        let conn = if timeout.is_zero() {
            connect.await?
        } else {
            tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| {
                    PoolError::BackendTimeout(format!(
                        "health check of {}:{} timed out",
                        desc.hostname, desc.port
                    ))
                })??
        };
        conn.close().await;
        Ok(())
    }

    /// A previously quarantined node that answers again is resurrected
    /// through the engine, which restores its pre-quarantine role.
    fn resurrect_if_quarantined(&self) {
        let Some(snapshot) = self.state.snapshot(self.node_id) else {
            return;
        };
        if snapshot.record.status == BackendStatus::Down && snapshot.record.quarantine {
            info!(
                "quarantined node {} is reachable again; requesting failback",
                self.node_id
            );
            let req = FailoverRequest::node_up(
                self.node_id,
                RequestFlags::UPDATE | RequestFlags::WATCHDOG,
            );
            if let Err(e) = self.state.enqueue_request(req) {
                warn!(
                    "cannot enqueue failback request for node {}: {}",
                    self.node_id, e
                );
            }
        }
    }

    /// The test-suite control point: a file naming nodes whose attempts are
    /// to be discarded. Off unless configured.
    fn fault_injected(&self, file: &Option<String>) -> bool {
        let Some(path) = file else { return false };
        let Ok(contents) = std::fs::read_to_string(path) else {
            return false;
        };
        contents
            .lines()
            .filter_map(|l| l.trim().parse::<NodeId>().ok())
            .any(|id| id == self.node_id)
    }
}
