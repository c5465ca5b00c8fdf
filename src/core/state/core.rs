// src/core/state/core.rs

//! The shared state record: the authoritative view of every backend and the
//! single serialised failover request queue. One mutex guards everything a
//! multi-field reader could care about; snapshots are served by value.

use super::backend::{
    BackendDesc, BackendRecord, BackendRole, BackendSnapshot, BackendStatus, MAX_BACKENDS, NO_NODE,
    NodeId,
};
use super::persistence;
use super::request::{FailoverRequest, RequestQueue};
use super::stats::HealthCheckStats;
use crate::core::errors::PoolError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Outcome of a follow-primary lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquire {
    Acquired,
    Busy,
}

/// The counted follow-primary lock with remote-hold bookkeeping. A remote
/// holder is a watchdog peer serialising follow-primary across the cluster.
#[derive(Debug, Default)]
struct FollowLock {
    count: u32,
    held_remotely: bool,
    remote_pending: bool,
}

#[derive(Debug)]
struct ClusterInner {
    backends: Vec<BackendRecord>,
    queue: RequestQueue,
    /// True from the moment the engine starts on the first queued request
    /// until the queue is observed empty under the mutex.
    switching: bool,
    primary_node_id: NodeId,
    main_node_id: NodeId,
    follow_lock: FollowLock,
    follow_primary_ongoing: bool,
}

/// The process-wide shared state record.
#[derive(Debug)]
pub struct ClusterState {
    descs: Vec<BackendDesc>,
    inner: Mutex<ClusterInner>,
    stats: Vec<Mutex<HealthCheckStats>>,
    status_file: PathBuf,
    /// Whether the backends form a streaming-replication family.
    pub streaming_mode: bool,
    /// Wakes the failover engine when a request lands in the queue.
    request_notify: Notify,
    /// Signalled whenever the engine observes the queue empty.
    drained_notify: Notify,
    pub started_at: DateTime<Utc>,
}

impl ClusterState {
    /// Builds the record, restoring statuses from the persistent file when
    /// one exists.
    pub fn new(
        descs: Vec<BackendDesc>,
        streaming_mode: bool,
        status_file: PathBuf,
    ) -> Result<Self, PoolError> {
        if descs.is_empty() {
            return Err(PoolError::Config("no backends configured".into()));
        }
        if descs.len() > MAX_BACKENDS {
            return Err(PoolError::Config(format!(
                "{} backends configured, maximum is {MAX_BACKENDS}",
                descs.len()
            )));
        }

        let statuses = match persistence::read_status_file(&status_file, descs.len())? {
            Some(loaded) => {
                info!("restored backend statuses from {:?}", status_file);
                persistence::reconcile(loaded, descs.len())
            }
            None => vec![BackendStatus::ConnectWait; descs.len()],
        };

        let backends: Vec<BackendRecord> = statuses
            .into_iter()
            .map(BackendRecord::new)
            .collect();
        let stats = (0..descs.len())
            .map(|_| Mutex::new(HealthCheckStats::default()))
            .collect();

        let mut inner = ClusterInner {
            backends,
            queue: RequestQueue::new(),
            switching: false,
            primary_node_id: NO_NODE,
            main_node_id: NO_NODE,
            follow_lock: FollowLock::default(),
            follow_primary_ongoing: false,
        };
        inner.main_node_id = first_valid_node(&inner.backends);

        Ok(Self {
            descs,
            inner: Mutex::new(inner),
            stats,
            status_file,
            streaming_mode,
            request_notify: Notify::new(),
            drained_notify: Notify::new(),
            started_at: Utc::now(),
        })
    }

    pub fn node_count(&self) -> usize {
        self.descs.len()
    }

    pub fn desc(&self, node_id: NodeId) -> Option<&BackendDesc> {
        usize::try_from(node_id)
            .ok()
            .and_then(|i| self.descs.get(i))
    }

    pub fn descs(&self) -> &[BackendDesc] {
        &self.descs
    }

    pub fn validate_node_id(&self, node_id: NodeId) -> Result<usize, PoolError> {
        usize::try_from(node_id)
            .ok()
            .filter(|&i| i < self.descs.len())
            .ok_or(PoolError::NodeIdOutOfRange(node_id))
    }

    // --- Request queue ---

    /// Enqueues a failover request, rejecting out-of-range node ids and
    /// reporting `QueueFull` on overflow. Wakes the engine on success.
    pub fn enqueue_request(&self, req: FailoverRequest) -> Result<(), PoolError> {
        for &id in &req.node_ids {
            self.validate_node_id(id)?;
        }
        {
            let mut inner = self.inner.lock();
            if !inner.queue.push(req) {
                return Err(PoolError::QueueFull);
            }
        }
        self.request_notify.notify_one();
        Ok(())
    }

    /// Engine-only: pops the next request. Observing an empty queue clears
    /// the `switching` flag and wakes anyone waiting for the drain.
    pub fn dequeue_request(&self) -> Option<FailoverRequest> {
        let popped = {
            let mut inner = self.inner.lock();
            match inner.queue.pop() {
                Some(req) => {
                    inner.switching = true;
                    Some(req)
                }
                None => {
                    inner.switching = false;
                    None
                }
            }
        };
        if popped.is_none() {
            self.drained_notify.notify_waiters();
        }
        popped
    }

    pub fn is_switching(&self) -> bool {
        self.inner.lock().switching
    }

    /// True while requests are queued or one is being processed.
    pub fn is_busy(&self) -> bool {
        let inner = self.inner.lock();
        inner.switching || !inner.queue.is_empty()
    }

    /// Suspends until the engine signals a request arrival.
    pub async fn wait_for_request(&self) {
        self.request_notify.notified().await;
    }

    /// Wakes the engine so it re-examines the queue; used when a request
    /// arrival is signalled out of band (watchdog interrupt).
    pub fn wake_engine(&self) {
        self.request_notify.notify_one();
    }

    /// Waits until the queue has drained, with an upper bound.
    pub async fn wait_until_drained(&self, limit: Duration) -> Result<(), PoolError> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let drained = self.drained_notify.notified();
            if !self.is_busy() {
                return Ok(());
            }
            tokio::select! {
                _ = drained => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PoolError::Switching);
                }
            }
        }
    }

    // --- Backend records ---

    pub fn snapshot(&self, node_id: NodeId) -> Option<BackendSnapshot> {
        let i = usize::try_from(node_id).ok()?;
        let desc = self.descs.get(i)?.clone();
        let record = self.inner.lock().backends.get(i)?.clone();
        Some(BackendSnapshot {
            node_id,
            desc,
            record,
        })
    }

    pub fn snapshot_all(&self) -> Vec<BackendSnapshot> {
        let inner = self.inner.lock();
        self.descs
            .iter()
            .zip(inner.backends.iter())
            .enumerate()
            .map(|(i, (desc, record))| BackendSnapshot {
                node_id: i as NodeId,
                desc: desc.clone(),
                record: record.clone(),
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.inner.lock().backends.iter().map(|b| b.status).collect()
    }

    /// Engine-only: commits a status transition and persists the status file,
    /// unless the transition would leave every backend DOWN (the last known
    /// good topology must survive a restart).
    pub fn set_backend_status(
        &self,
        node_id: NodeId,
        status: BackendStatus,
    ) -> Result<(), PoolError> {
        let i = self.validate_node_id(node_id)?;
        let statuses = {
            let mut inner = self.inner.lock();
            let record = &mut inner.backends[i];
            record.status = status;
            record.status_changed_at = Utc::now();
            inner.backends.iter().map(|b| b.status).collect::<Vec<_>>()
        };
        if statuses.iter().all(|&s| s == BackendStatus::Down) {
            warn!("all backends down; not writing status file");
            return Ok(());
        }
        persistence::write_status_file(&self.status_file, &statuses)
    }

    /// Like `set_backend_status` but never touches the file; used for
    /// quarantine transitions, which must not survive a restart.
    pub fn set_backend_status_transient(
        &self,
        node_id: NodeId,
        status: BackendStatus,
    ) -> Result<(), PoolError> {
        let i = self.validate_node_id(node_id)?;
        let mut inner = self.inner.lock();
        inner.backends[i].status = status;
        inner.backends[i].status_changed_at = Utc::now();
        Ok(())
    }

    /// Writes the status file from the current records; used once more at
    /// shutdown.
    pub fn persist_status(&self) -> Result<(), PoolError> {
        let statuses = self.statuses();
        if statuses.iter().all(|&s| s == BackendStatus::Down) {
            return Ok(());
        }
        persistence::write_status_file(&self.status_file, &statuses)
    }

    pub fn set_role(&self, node_id: NodeId, role: BackendRole) -> Result<(), PoolError> {
        let i = self.validate_node_id(node_id)?;
        self.inner.lock().backends[i].role = role;
        Ok(())
    }

    pub fn set_quarantine(&self, node_id: NodeId, quarantine: bool) -> Result<(), PoolError> {
        let i = self.validate_node_id(node_id)?;
        let mut inner = self.inner.lock();
        if quarantine {
            let role = inner.backends[i].role;
            inner.backends[i].role_before_quarantine = Some(role);
        } else {
            inner.backends[i].role_before_quarantine = None;
        }
        inner.backends[i].quarantine = quarantine;
        Ok(())
    }

    /// The role a quarantined node held before it was quarantined.
    pub fn role_before_quarantine(&self, node_id: NodeId) -> Option<BackendRole> {
        let i = self.validate_node_id(node_id).ok()?;
        self.inner.lock().backends[i].role_before_quarantine
    }

    /// Verifier-only: refreshes replication progress for one backend.
    pub fn update_replication_info(
        &self,
        node_id: NodeId,
        delay: u64,
        delay_by_time: bool,
        state: &str,
        sync_state: &str,
    ) -> Result<(), PoolError> {
        let i = self.validate_node_id(node_id)?;
        let mut inner = self.inner.lock();
        let record = &mut inner.backends[i];
        record.standby_delay = delay;
        record.delay_by_time = delay_by_time;
        record.replication_state = state.to_string();
        record.replication_sync_state = sync_state.to_string();
        Ok(())
    }

    // --- Primary / main node bookkeeping ---

    pub fn primary_node_id(&self) -> NodeId {
        self.inner.lock().primary_node_id
    }

    pub fn set_primary_node_id(&self, node_id: NodeId) {
        self.inner.lock().primary_node_id = node_id;
    }

    pub fn main_node_id(&self) -> NodeId {
        self.inner.lock().main_node_id
    }

    /// Recomputes and commits the main node: the lowest-numbered usable
    /// backend, or -1 when none remains.
    pub fn recompute_main_node(&self) -> NodeId {
        let mut inner = self.inner.lock();
        let main = first_valid_node(&inner.backends);
        inner.main_node_id = main;
        main
    }

    // --- Health-check statistics ---

    pub fn with_stats<R>(&self, node_id: NodeId, f: impl FnOnce(&mut HealthCheckStats) -> R) -> R {
        let i = node_id as usize;
        f(&mut self.stats[i].lock())
    }

    pub fn stats_snapshot(&self, node_id: NodeId) -> Option<HealthCheckStats> {
        let i = usize::try_from(node_id).ok()?;
        self.stats.get(i).map(|s| s.lock().clone())
    }

    // --- Follow-primary lock ---

    /// Tries to take the follow-primary lock once, applying the remote
    /// hand-off rules.
    pub fn try_acquire_follow_lock(&self, remote: bool) -> LockAcquire {
        let mut inner = self.inner.lock();
        let lock = &mut inner.follow_lock;
        if lock.count == 0 {
            lock.count = 1;
            lock.held_remotely = remote;
            LockAcquire::Acquired
        } else if remote && !lock.held_remotely {
            // Remember the remote request; the local release will hand over.
            lock.remote_pending = true;
            LockAcquire::Busy
        } else {
            LockAcquire::Busy
        }
    }

    /// Acquires the follow-primary lock, sleeping a second between attempts
    /// when asked to block.
    pub async fn acquire_follow_lock(&self, block: bool, remote: bool) -> LockAcquire {
        loop {
            match self.try_acquire_follow_lock(remote) {
                LockAcquire::Acquired => return LockAcquire::Acquired,
                LockAcquire::Busy if block => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                LockAcquire::Busy => return LockAcquire::Busy,
            }
        }
    }

    /// Releases the lock. A remote release only clears a remote hold; a local
    /// release that finds a pending remote request transfers ownership to the
    /// remote side without dropping the count.
    pub fn release_follow_lock(&self, remote: bool) {
        let mut inner = self.inner.lock();
        let lock = &mut inner.follow_lock;
        if lock.count == 0 {
            return;
        }
        if remote {
            if lock.held_remotely {
                lock.count = 0;
                lock.held_remotely = false;
            }
        } else if lock.remote_pending {
            lock.remote_pending = false;
            lock.held_remotely = true;
        } else {
            lock.count = 0;
            lock.held_remotely = false;
        }
    }

    pub fn follow_lock_held(&self) -> bool {
        self.inner.lock().follow_lock.count > 0
    }

    pub fn set_follow_primary_ongoing(&self, ongoing: bool) {
        self.inner.lock().follow_primary_ongoing = ongoing;
    }

    pub fn follow_primary_ongoing(&self) -> bool {
        self.inner.lock().follow_primary_ongoing
    }
}

/// The lowest-numbered backend the router may use, or -1.
fn first_valid_node(backends: &[BackendRecord]) -> NodeId {
    backends
        .iter()
        .position(|b| b.status.is_valid())
        .map(|i| i as NodeId)
        .unwrap_or(NO_NODE)
}
