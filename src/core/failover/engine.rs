// src/core/failover/engine.rs

//! The failover engine: the single consumer of the request queue. Requests
//! are processed one at a time, in FIFO order, with `switching` held true
//! until the queue drains.

use super::command::{CommandRunner, SubstitutionContext, expand};
use super::primary::PrimaryProber;
use crate::config::SharedConfig;
use crate::connection::SessionRegistry;
use crate::core::errors::PoolError;
use crate::core::events::{Interrupt, InterruptBus};
use crate::core::state::{
    BackendRole, BackendStatus, ClusterState, FailoverRequest, NO_NODE, NodeId, RequestFlags,
    RequestKind,
};
use crate::core::watchdog::Watchdog;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How session workers are to be recycled after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Kill every session worker.
    Full,
    /// Kill only workers whose load-balance node departed.
    Partial,
    /// Leave session workers alone.
    None,
}

/// Decides the restart scope for one processed request. Rules apply in
/// order; the first one that fits wins.
pub fn decide_restart(
    kind: RequestKind,
    flags: RequestFlags,
    streaming: bool,
    all_down_before: bool,
    returning_is_former_primary: bool,
    down_includes_primary: bool,
) -> RestartDecision {
    match kind {
        RequestKind::NodeUp if flags.contains(RequestFlags::UPDATE) => {
            if all_down_before {
                RestartDecision::Full
            } else {
                RestartDecision::None
            }
        }
        RequestKind::NodeUp => {
            if streaming && !all_down_before && !returning_is_former_primary {
                RestartDecision::None
            } else {
                RestartDecision::Full
            }
        }
        RequestKind::NodeDown | RequestKind::NodeQuarantine => {
            if streaming && flags.contains(RequestFlags::SWITCHOVER) && !down_includes_primary {
                RestartDecision::Partial
            } else {
                RestartDecision::Full
            }
        }
        RequestKind::Promote => RestartDecision::Full,
        RequestKind::CloseIdle => RestartDecision::None,
    }
}

/// Per-request working state.
#[derive(Debug, Default)]
struct FailoverContext {
    down_mask: Vec<NodeId>,
    promote_node: Option<NodeId>,
    /// Failback restored a quarantined primary; commit it without probing.
    restored_primary: Option<NodeId>,
    returning_former_primary: bool,
    search_primary: bool,
    sync_required: bool,
    need_restart_pcp: bool,
}

pub struct FailoverEngine {
    state: Arc<ClusterState>,
    config: SharedConfig,
    sessions: Arc<SessionRegistry>,
    watchdog: Arc<dyn Watchdog>,
    runner: Arc<dyn CommandRunner>,
    prober: Arc<dyn PrimaryProber>,
    bus: Arc<InterruptBus>,
    /// Signals the control protocol worker to drop its connection and start
    /// over after a topology change.
    pcp_restart: Arc<Notify>,
    follow_task: Mutex<Option<JoinHandle<()>>>,
}

impl FailoverEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<ClusterState>,
        config: SharedConfig,
        sessions: Arc<SessionRegistry>,
        watchdog: Arc<dyn Watchdog>,
        runner: Arc<dyn CommandRunner>,
        prober: Arc<dyn PrimaryProber>,
        bus: Arc<InterruptBus>,
        pcp_restart: Arc<Notify>,
    ) -> Self {
        Self {
            state,
            config,
            sessions,
            watchdog,
            runner,
            prober,
            bus,
            pcp_restart,
            follow_task: Mutex::new(None),
        }
    }

    /// The consumer loop: wake on request arrival, drain, repeat.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("failover engine started");
        loop {
            tokio::select! {
                _ = self.state.wait_for_request() => {}
                _ = shutdown_rx.recv() => break,
            }
            self.drain().await;
        }
        self.wait_follow_done().await;
        debug!("failover engine stopped");
    }

    /// Processes queued requests until the queue is observed empty.
    pub async fn drain(&self) {
        while let Some(req) = self.state.dequeue_request() {
            if let Err(e) = self.process(req).await {
                warn!("failover request failed: {}", e);
            }
        }
    }

    /// Waits for a running follow-primary child, if any. Shutdown must not
    /// interrupt it.
    pub async fn wait_follow_done(&self) {
        let handle = self.follow_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn process(&self, req: FailoverRequest) -> Result<(), PoolError> {
        info!(
            "processing request {:?} nodes {:?} flags {:?}",
            req.kind, req.node_ids, req.flags
        );

        if req.kind == RequestKind::CloseIdle {
            self.sessions.request_exit_if_idle_all();
            self.bus.raise(Interrupt::Wake);
            return Ok(());
        }

        let old_primary = self.state.primary_node_id();
        let old_main = self.state.main_node_id();
        let all_down_before = self
            .state
            .statuses()
            .iter()
            .all(|&s| s == BackendStatus::Down);

        let mut ctx = FailoverContext::default();

        match req.kind {
            RequestKind::NodeUp => {
                self.apply_failback(&req, &mut ctx, old_primary)?;
            }
            RequestKind::NodeDown | RequestKind::NodeQuarantine => {
                self.apply_detach(&req, &mut ctx)?;
            }
            RequestKind::Promote => {
                self.apply_promote(&req, &mut ctx)?;
            }
            RequestKind::CloseIdle => unreachable!(),
        }

        // Step 1: elect the new main node.
        let new_main = self.state.recompute_main_node();

        // Step 2: recycle session workers.
        let down_includes_primary = old_primary != NO_NODE && ctx.down_mask.contains(&old_primary);
        let decision = decide_restart(
            req.kind,
            req.flags,
            self.state.streaming_mode,
            all_down_before,
            ctx.returning_former_primary,
            down_includes_primary,
        );
        match decision {
            RestartDecision::Full => {
                let killed = self.sessions.kill_all();
                debug!("full restart: killed {} session workers", killed);
            }
            RestartDecision::Partial => {
                let down = ctx.down_mask.clone();
                let killed = self
                    .sessions
                    .kill_matching(|s| down.contains(&s.load_balance_node));
                debug!("partial restart: killed {} session workers", killed);
            }
            RestartDecision::None => {}
        }

        // Step 3: run the operator's commands for this transition.
        let commands = self.config.read().failover.clone();
        let base = self.substitution_base(new_main, old_main, old_primary);
        match req.kind {
            RequestKind::NodeDown => {
                for &node in &ctx.down_mask {
                    let cmd_ctx = self.for_node(node, &base);
                    self.runner.run(&expand(&commands.failover_command, &cmd_ctx)).await?;
                }
            }
            RequestKind::Promote => {
                if let Some(node) = ctx.promote_node {
                    let cmd_ctx = self.for_node(node, &base);
                    self.runner.run(&expand(&commands.failover_command, &cmd_ctx)).await?;
                }
            }
            RequestKind::NodeUp if !req.flags.contains(RequestFlags::UPDATE) => {
                for &node in &req.node_ids {
                    let cmd_ctx = self.for_node(node, &base);
                    self.runner.run(&expand(&commands.failback_command, &cmd_ctx)).await?;
                }
            }
            _ => {}
        }

        // Step 4: determine the new primary.
        let new_primary = self
            .determine_primary(&req, &ctx, old_primary, down_includes_primary)
            .await;

        // Step 5: follow-primary reconfiguration when the primary moved (or
        // the primary itself was failed back) and a follow command exists.
        let follow_wanted = self.state.streaming_mode
            && !commands.follow_primary_command.is_empty()
            && new_primary != NO_NODE
            && req.kind != RequestKind::NodeQuarantine
            && (new_primary != old_primary
                || (req.kind == RequestKind::NodeUp && req.node_ids.contains(&new_primary)));
        if follow_wanted {
            self.start_follow_primary(new_primary, new_main, old_main, old_primary, &commands.follow_primary_command)?;
        }

        // Step 6: commit primary and roles.
        self.commit_primary(new_primary)?;
        self.state.recompute_main_node();

        // Step 7: survivors exit at their next idle point.
        if self.sessions.count() > 0 && decision != RestartDecision::None {
            self.sessions.mark_need_restart_all();
        }

        // Step 8: wake the worker owner.
        self.bus.raise(Interrupt::Wake);
        if ctx.sync_required {
            self.bus.raise(Interrupt::SyncRequired);
        }

        // Step 9: recycle the control protocol worker when the topology
        // changed under it.
        ctx.need_restart_pcp = new_primary != old_primary;
        if ctx.need_restart_pcp {
            self.pcp_restart.notify_waiters();
        }

        info!(
            "request {:?} done: main={} primary={}",
            req.kind,
            self.state.main_node_id(),
            self.state.primary_node_id()
        );
        Ok(())
    }

    fn apply_failback(
        &self,
        req: &FailoverRequest,
        ctx: &mut FailoverContext,
        old_primary: NodeId,
    ) -> Result<(), PoolError> {
        let node = *req
            .node_ids
            .first()
            .ok_or_else(|| PoolError::InvalidState("failback without a node".into()))?;
        self.state.validate_node_id(node)?;

        if req.flags.contains(RequestFlags::UPDATE) {
            // Quarantine resurrection: no commands, no status file write.
            let role_before = self.state.role_before_quarantine(node);
            self.state.set_quarantine(node, false)?;
            self.state
                .set_backend_status_transient(node, BackendStatus::ConnectWait)?;
            if let Some(role) = role_before {
                self.state.set_role(node, role)?;
            }
            ctx.returning_former_primary = role_before == Some(BackendRole::Primary);
            if ctx.returning_former_primary && old_primary == NO_NODE {
                ctx.restored_primary = Some(node);
            }
            ctx.sync_required = true;
        } else {
            self.state.set_backend_status(node, BackendStatus::ConnectWait)?;
            ctx.returning_former_primary = node == old_primary;
            ctx.search_primary = true;
        }
        Ok(())
    }

    fn apply_detach(
        &self,
        req: &FailoverRequest,
        ctx: &mut FailoverContext,
    ) -> Result<(), PoolError> {
        let quarantine = req.kind == RequestKind::NodeQuarantine;
        for &node in &req.node_ids {
            self.state.validate_node_id(node)?;
            let Some(snapshot) = self.state.snapshot(node) else {
                continue;
            };
            // Only currently reachable nodes transition.
            if snapshot.record.status == BackendStatus::Down {
                debug!("node {} is already down; skipping", node);
                continue;
            }
            if quarantine {
                // Quarantine must not survive a restart: the pre-quarantine
                // role is remembered, the status file stays untouched.
                self.state.set_quarantine(node, true)?;
                self.state
                    .set_backend_status_transient(node, BackendStatus::Down)?;
            } else {
                self.state.set_backend_status(node, BackendStatus::Down)?;
            }
            ctx.down_mask.push(node);
        }
        if ctx.down_mask.is_empty() {
            return Err(PoolError::InvalidState(
                "no reachable node in detach request".into(),
            ));
        }
        Ok(())
    }

    fn apply_promote(
        &self,
        req: &FailoverRequest,
        ctx: &mut FailoverContext,
    ) -> Result<(), PoolError> {
        if !self.state.streaming_mode {
            return Err(PoolError::NotInStreamingReplication);
        }
        let node = *req
            .node_ids
            .first()
            .ok_or_else(|| PoolError::InvalidState("promote without a node".into()))?;
        self.state.validate_node_id(node)?;
        let snapshot = self
            .state
            .snapshot(node)
            .ok_or(PoolError::NodeIdOutOfRange(node))?;
        if !snapshot.is_valid() {
            return Err(PoolError::InvalidState(format!(
                "cannot promote node {node}: not usable"
            )));
        }
        ctx.promote_node = Some(node);
        Ok(())
    }

    async fn determine_primary(
        &self,
        req: &FailoverRequest,
        ctx: &FailoverContext,
        old_primary: NodeId,
        down_includes_primary: bool,
    ) -> NodeId {
        if !self.state.streaming_mode {
            // Raw mode has no primary concept beyond "did it survive".
            return if down_includes_primary { NO_NODE } else { old_primary };
        }
        if let Some(node) = ctx.promote_node {
            return node;
        }
        if let Some(node) = ctx.restored_primary {
            return node;
        }
        match req.kind {
            RequestKind::NodeQuarantine if down_includes_primary => NO_NODE,
            // Quarantine of a standby never disturbs the primary.
            RequestKind::NodeQuarantine => old_primary,
            RequestKind::NodeDown if !down_includes_primary => old_primary,
            RequestKind::NodeUp if !ctx.search_primary => old_primary,
            _ => self.find_primary_node_repeatedly().await,
        }
    }

    /// Loops the primary search until found or the configured timeout runs
    /// out (zero means forever). While a follow-primary run is in flight the
    /// current primary is returned without probing.
    pub async fn find_primary_node_repeatedly(&self) -> NodeId {
        // A node pinned as primary never needs probing.
        if let Some(idx) = self
            .state
            .descs()
            .iter()
            .position(|d| d.always_primary())
        {
            return idx as NodeId;
        }

        let limit = self.config.read().failover.search_primary_node_timeout;
        let deadline = (!limit.is_zero()).then(|| tokio::time::Instant::now() + limit);
        loop {
            if self.state.follow_primary_ongoing() {
                return self.state.primary_node_id();
            }
            self.state.acquire_follow_lock(true, false).await;
            let found = self.prober.find_primary().await;
            self.state.release_follow_lock(false);
            match found {
                Ok(id) if id != NO_NODE => return id,
                Ok(_) => {}
                Err(e) => debug!("primary search attempt failed: {}", e),
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    warn!("primary search timed out; no primary elected");
                    return NO_NODE;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Marks every usable non-primary DOWN and forks the follow child, which
    /// runs the follow command for each of them while holding the
    /// follow-primary lock cluster-wide.
    fn start_follow_primary(
        &self,
        new_primary: NodeId,
        new_main: NodeId,
        old_main: NodeId,
        old_primary: NodeId,
        follow_command: &str,
    ) -> Result<(), PoolError> {
        let mut followers = Vec::new();
        for snapshot in self.state.snapshot_all() {
            if snapshot.node_id != new_primary && snapshot.record.status.is_valid() {
                self.state
                    .set_backend_status(snapshot.node_id, BackendStatus::Down)?;
                followers.push(snapshot.node_id);
            }
        }
        if followers.is_empty() {
            return Ok(());
        }
        info!(
            "primary moved to node {}; following with standbys {:?}",
            new_primary, followers
        );

        let base = self.substitution_base(new_main, old_main, old_primary);
        let contexts: Vec<SubstitutionContext> = followers
            .iter()
            .map(|&node| self.for_node(node, &base))
            .collect();
        let command = follow_command.to_string();
        let state = self.state.clone();
        let watchdog = self.watchdog.clone();
        let runner = self.runner.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = watchdog.lock_standby("follow_primary").await {
                warn!("cannot take cluster-wide follow-primary lock: {}", e);
            }
            state.acquire_follow_lock(true, false).await;
            state.set_follow_primary_ongoing(true);

            for ctx in contexts {
                if let Err(e) = runner.run(&expand(&command, &ctx)).await {
                    warn!("follow-primary command for node {} failed: {}", ctx.node_id, e);
                }
            }

            state.set_follow_primary_ongoing(false);
            state.release_follow_lock(false);
            if let Err(e) = watchdog.unlock_standby("follow_primary").await {
                warn!("cannot release cluster-wide follow-primary lock: {}", e);
            }
        });
        *self.follow_task.lock() = Some(handle);
        Ok(())
    }

    /// Commits the primary pointer and reconciles roles so that at most one
    /// backend carries PRIMARY.
    fn commit_primary(&self, new_primary: NodeId) -> Result<(), PoolError> {
        self.state.set_primary_node_id(new_primary);
        for snapshot in self.state.snapshot_all() {
            if snapshot.node_id == new_primary {
                self.state.set_role(snapshot.node_id, BackendRole::Primary)?;
            } else if snapshot.record.role == BackendRole::Primary {
                self.state.set_role(snapshot.node_id, BackendRole::Standby)?;
            }
        }
        Ok(())
    }

    fn substitution_base(
        &self,
        new_main: NodeId,
        old_main: NodeId,
        old_primary: NodeId,
    ) -> SubstitutionContext {
        let mut base = SubstitutionContext {
            new_main_id: new_main,
            old_main_id: old_main,
            old_primary_id: old_primary,
            ..Default::default()
        };
        if let Some(desc) = self.state.desc(new_main) {
            base.new_main_host = desc.hostname.clone();
            base.new_main_port = desc.port;
            base.new_main_dir = desc.data_directory.clone();
        }
        if let Some(desc) = self.state.desc(old_primary) {
            base.old_primary_host = desc.hostname.clone();
            base.old_primary_port = desc.port;
        }
        base
    }

    fn for_node(&self, node: NodeId, base: &SubstitutionContext) -> SubstitutionContext {
        let mut ctx = base.clone();
        ctx.node_id = node;
        if let Some(desc) = self.state.desc(node) {
            ctx.hostname = desc.hostname.clone();
            ctx.port = desc.port;
            ctx.data_directory = desc.data_directory.clone();
        }
        ctx
    }
}
