// src/connection/registry.rs

//! The session slot table. Each session worker owns one slot; the failover
//! engine and supervisor flip the restart/exit flags and the kill switch.

use crate::core::state::{NO_NODE, NodeId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use strum_macros::Display;
use tokio::sync::Notify;

/// What a session worker is doing right now. Display names match the
/// process-title strings reported over the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionStatus {
    #[strum(serialize = "Wait for connection")]
    WaitForConnect,
    #[strum(serialize = "Connecting")]
    Connecting,
    #[strum(serialize = "Idle")]
    Idle,
    #[strum(serialize = "Idle in transaction")]
    IdleInTrans,
    #[strum(serialize = "Execute command")]
    CommandExecute,
}

/// One worker's slot.
#[derive(Debug, Clone)]
pub struct SessionSlot {
    pub worker_id: u64,
    pub started_at: DateTime<Utc>,
    /// Clients served over this worker's lifetime.
    pub client_connection_count: u64,
    /// Pooled backend connections currently held.
    pub pooled_connections: usize,
    pub status: SessionStatus,
    /// The backend this worker's load balancing selected, or -1.
    pub load_balance_node: NodeId,
    /// Exit at the next idle point because cluster topology changed.
    pub need_restart: bool,
    /// Exit once the pooled connections are gone; set by dynamic sizing and
    /// by close-idle requests.
    pub exit_if_idle: bool,
    pub database: String,
    pub user: String,
    pub client_addr: Option<String>,
}

#[derive(Debug)]
struct SessionEntry {
    slot: SessionSlot,
    kill: Arc<Notify>,
}

/// The shared slot table.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionEntry>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a slot for a new worker and hands back its kill switch.
    pub fn register(&self) -> (u64, Arc<Notify>) {
        let worker_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let kill = Arc::new(Notify::new());
        let slot = SessionSlot {
            worker_id,
            started_at: Utc::now(),
            client_connection_count: 0,
            pooled_connections: 0,
            status: SessionStatus::WaitForConnect,
            load_balance_node: NO_NODE,
            need_restart: false,
            exit_if_idle: false,
            database: String::new(),
            user: String::new(),
            client_addr: None,
        };
        self.sessions.insert(
            worker_id,
            SessionEntry {
                slot,
                kill: kill.clone(),
            },
        );
        (worker_id, kill)
    }

    pub fn unregister(&self, worker_id: u64) {
        self.sessions.remove(&worker_id);
    }

    pub fn update(&self, worker_id: u64, f: impl FnOnce(&mut SessionSlot)) {
        if let Some(mut entry) = self.sessions.get_mut(&worker_id) {
            f(&mut entry.slot);
        }
    }

    pub fn get(&self, worker_id: u64) -> Option<SessionSlot> {
        self.sessions.get(&worker_id).map(|e| e.slot.clone())
    }

    pub fn snapshot_all(&self) -> Vec<SessionSlot> {
        let mut slots: Vec<SessionSlot> =
            self.sessions.iter().map(|e| e.slot.clone()).collect();
        slots.sort_by_key(|s| s.worker_id);
        slots
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn idle_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| {
                matches!(
                    e.slot.status,
                    SessionStatus::WaitForConnect | SessionStatus::Idle
                )
            })
            .count()
    }

    /// Fires every kill switch. Slots disappear as their workers exit.
    pub fn kill_all(&self) -> usize {
        let mut killed = 0;
        for entry in self.sessions.iter() {
            entry.kill.notify_one();
            killed += 1;
        }
        killed
    }

    /// Fires the kill switch of every slot the predicate selects.
    pub fn kill_matching(&self, pred: impl Fn(&SessionSlot) -> bool) -> usize {
        let mut killed = 0;
        for entry in self.sessions.iter() {
            if pred(&entry.slot) {
                entry.kill.notify_one();
                killed += 1;
            }
        }
        killed
    }

    /// Flags every surviving worker to exit at its next idle point.
    pub fn mark_need_restart_all(&self) {
        for mut entry in self.sessions.iter_mut() {
            entry.slot.need_restart = true;
        }
    }

    /// Asks every worker to exit once its pool drains.
    pub fn request_exit_if_idle_all(&self) {
        for mut entry in self.sessions.iter_mut() {
            entry.slot.exit_if_idle = true;
        }
    }

    /// Asks up to `quota` idle workers to retire, preferring the ones with
    /// the fewest pooled backend connections.
    pub fn retire_idle(&self, quota: usize) -> usize {
        let mut candidates: Vec<(u64, usize)> = self
            .sessions
            .iter()
            .filter(|e| {
                e.slot.status == SessionStatus::WaitForConnect && !e.slot.exit_if_idle
            })
            .map(|e| (e.slot.worker_id, e.slot.pooled_connections))
            .collect();
        candidates.sort_by_key(|&(_, pooled)| pooled);
        let mut retired = 0;
        for (worker_id, _) in candidates.into_iter().take(quota) {
            if let Some(mut entry) = self.sessions.get_mut(&worker_id) {
                entry.slot.exit_if_idle = true;
                entry.kill.notify_one();
                retired += 1;
            }
        }
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_kill_matching() {
        let registry = SessionRegistry::new();
        let (a, _) = registry.register();
        let (b, _) = registry.register();
        registry.update(a, |s| s.load_balance_node = 1);
        registry.update(b, |s| s.load_balance_node = 2);

        let killed = registry.kill_matching(|s| s.load_balance_node == 1);
        assert_eq!(killed, 1);
        assert_eq!(registry.count(), 2);

        registry.unregister(a);
        registry.unregister(b);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn retire_prefers_fewest_pooled_connections() {
        let registry = SessionRegistry::new();
        let (a, _) = registry.register();
        let (b, _) = registry.register();
        let (c, _) = registry.register();
        registry.update(a, |s| s.pooled_connections = 5);
        registry.update(b, |s| s.pooled_connections = 1);
        registry.update(c, |s| s.pooled_connections = 3);

        let retired = registry.retire_idle(1);
        assert_eq!(retired, 1);
        assert!(registry.get(b).unwrap().exit_if_idle);
        assert!(!registry.get(a).unwrap().exit_if_idle);
    }
}
