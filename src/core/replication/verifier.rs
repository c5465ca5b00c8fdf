// src/core/replication/verifier.rs

//! The periodic replication check and the pure classifier it feeds.

use crate::config::SharedConfig;
use crate::core::errors::PoolError;
use crate::core::probe::{ProbeConnection, ProbeCredentials, parse_conninfo_host_port, parse_lsn};
use crate::core::state::{
    BackendRole, ClusterState, FailoverRequest, LockAcquire, NO_NODE, NodeId, RequestFlags,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Minimum backend version for the standby-vote procedure
/// (`pg_stat_wal_receiver.conninfo` appeared in 9.6).
const WAL_RECEIVER_MIN_VERSION: i64 = 96000;

/// Classification input for one reachable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeClass {
    pub node_id: NodeId,
    pub in_recovery: bool,
}

/// Resolves the true primary from the classification and the standby votes.
/// Returns the elected primary (if any) and the primaries judged invalid.
///
/// A standby "votes" for the primary its WAL receiver streams from. The
/// primary owning every standby wins and disqualifies the rest; without a
/// unanimous winner the lowest-numbered candidate is kept and nothing is
/// invalidated.
pub fn resolve_true_primary(
    classes: &[NodeClass],
    votes: &HashMap<NodeId, HashSet<NodeId>>,
    standby_count: usize,
) -> (Option<NodeId>, Vec<NodeId>) {
    let mut primaries: Vec<NodeId> = classes
        .iter()
        .filter(|c| !c.in_recovery)
        .map(|c| c.node_id)
        .collect();
    primaries.sort_unstable();

    match primaries.as_slice() {
        [] => (None, Vec::new()),
        [only] => (Some(*only), Vec::new()),
        _ if standby_count == 0 => {
            // Multiple primaries, nothing to vouch for any of them: keep the
            // lowest-numbered one and invalidate the rest.
            let keep = primaries[0];
            (Some(keep), primaries[1..].to_vec())
        }
        _ => {
            let winner = primaries
                .iter()
                .copied()
                .find(|p| votes.get(p).map_or(0, |v| v.len()) == standby_count);
            match winner {
                Some(winner) => {
                    let invalid = primaries.iter().copied().filter(|&p| p != winner).collect();
                    (Some(winner), invalid)
                }
                None => (Some(primaries[0]), Vec::new()),
            }
        }
    }
}

/// The periodic worker.
pub struct ReplicationVerifier {
    state: Arc<ClusterState>,
    config: SharedConfig,
}

impl ReplicationVerifier {
    pub fn new(state: Arc<ClusterState>, config: SharedConfig) -> Self {
        Self { state, config }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        if !self.state.streaming_mode {
            info!("replication verifier disabled: not in streaming replication mode");
            return;
        }
        info!("replication verifier started");
        loop {
            let period = self.config.read().sr_check.period;
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown_rx.recv() => break,
            }
            if self.state.is_switching() {
                debug!("skipping replication check: failover in progress");
                continue;
            }
            if let Err(e) = self.check_cycle().await {
                warn!("replication check cycle failed: {}", e);
            }
        }
        debug!("replication verifier stopped");
    }

    /// One verification cycle under the follow-primary lock.
    pub async fn check_cycle(&self) -> Result<(), PoolError> {
        if self.state.acquire_follow_lock(false, false).await == LockAcquire::Busy {
            debug!("skipping replication check: follow-primary lock is held");
            return Ok(());
        }
        let result = self.classify_and_commit().await;
        self.state.release_follow_lock(false);
        result
    }

    async fn classify_and_commit(&self) -> Result<(), PoolError> {
        let sr = self.config.read().sr_check.clone();
        let creds = ProbeCredentials {
            user: sr.user.clone(),
            password: sr.password.clone(),
            database: sr.database.clone(),
        };

        // Open verification connections to every usable backend and classify.
        let mut conns: HashMap<NodeId, ProbeConnection> = HashMap::new();
        let mut classes: Vec<NodeClass> = Vec::new();
        for snapshot in self.state.snapshot_all() {
            if !snapshot.is_valid() {
                continue;
            }
            match ProbeConnection::connect(&snapshot.desc, &creds).await {
                Ok(mut conn) => {
                    match conn.query_one("SELECT pg_is_in_recovery()").await {
                        Ok(Some(value)) => {
                            classes.push(NodeClass {
                                node_id: snapshot.node_id,
                                in_recovery: value == "t",
                            });
                            conns.insert(snapshot.node_id, conn);
                        }
                        Ok(None) => warn!(
                            "node {} returned no recovery status",
                            snapshot.node_id
                        ),
                        Err(e) => warn!(
                            "cannot read recovery status of node {}: {}",
                            snapshot.node_id, e
                        ),
                    }
                }
                Err(e) => {
                    debug!(
                        "cannot open verification connection to node {}: {}",
                        snapshot.node_id, e
                    );
                }
            }
        }

        let standby_ids: Vec<NodeId> = classes
            .iter()
            .filter(|c| c.in_recovery)
            .map(|c| c.node_id)
            .collect();
        let primary_count = classes.len() - standby_ids.len();

        // Standby votes, only worth collecting with several primary
        // candidates, detach_false_primary on, and modern backends.
        let mut votes: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        if primary_count >= 2 && sr.detach_false_primary && !standby_ids.is_empty() {
            votes = self.collect_votes(&mut conns, &classes, &standby_ids).await;
        }

        let (true_primary, invalid) =
            resolve_true_primary(&classes, &votes, standby_ids.len());

        // Commit roles and the primary pointer.
        for class in &classes {
            let role = if Some(class.node_id) == true_primary {
                BackendRole::Primary
            } else {
                BackendRole::Standby
            };
            self.state.set_role(class.node_id, role)?;
        }
        if let Some(primary) = true_primary {
            if self.state.primary_node_id() != primary && !self.state.follow_primary_ongoing() {
                info!("replication check found primary node {}", primary);
                self.state.set_primary_node_id(primary);
            }
            self.sample_lag(&mut conns, primary, &standby_ids, sr.delay_by_time)
                .await;
        } else if primary_count == 0 {
            debug!("no primary candidate found this cycle");
        }

        if sr.detach_false_primary {
            for node_id in invalid {
                warn!("node {} is a false primary; requesting detach", node_id);
                let req = FailoverRequest::node_down(node_id, RequestFlags::SWITCHOVER);
                if let Err(e) = self.state.enqueue_request(req) {
                    warn!("cannot enqueue detach of false primary {}: {}", node_id, e);
                }
            }
        }

        for (_, conn) in conns {
            conn.close().await;
        }
        Ok(())
    }

    /// Asks each standby which primary its WAL receiver streams from.
    async fn collect_votes(
        &self,
        conns: &mut HashMap<NodeId, ProbeConnection>,
        classes: &[NodeClass],
        standby_ids: &[NodeId],
    ) -> HashMap<NodeId, HashSet<NodeId>> {
        let mut votes: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        let primaries: Vec<NodeId> = classes
            .iter()
            .filter(|c| !c.in_recovery)
            .map(|c| c.node_id)
            .collect();

        for &standby in standby_ids {
            let Some(conn) = conns.get_mut(&standby) else {
                continue;
            };
            let version: i64 = match conn.query_one("SHOW server_version_num").await {
                Ok(Some(v)) => v.parse().unwrap_or(0),
                _ => 0,
            };
            if version < WAL_RECEIVER_MIN_VERSION {
                debug!(
                    "standby {} is older than 9.6; skipping WAL receiver vote",
                    standby
                );
                continue;
            }
            let rows = match conn
                .simple_query("SELECT status, conninfo FROM pg_stat_wal_receiver")
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    debug!("cannot read wal receiver of standby {}: {}", standby, e);
                    continue;
                }
            };
            let Some(row) = rows.first() else { continue };
            let status = row.first().cloned().flatten().unwrap_or_default();
            let conninfo = row.get(1).cloned().flatten().unwrap_or_default();
            if status != "streaming" {
                continue;
            }
            let (host, port) = parse_conninfo_host_port(&conninfo);
            for &primary in &primaries {
                if let Some(desc) = self.state.desc(primary) {
                    let host_matches = host.as_deref() == Some(desc.hostname.as_str());
                    let port_matches = port.map(|p| p == desc.port).unwrap_or(true);
                    if host_matches && port_matches {
                        votes.entry(primary).or_default().insert(standby);
                    }
                }
            }
        }
        votes
    }

    /// Reads per-standby replication state and lag from the true primary.
    /// Standbys missing from `pg_stat_replication` still get a byte-mode lag
    /// figure from a direct LSN comparison.
    async fn sample_lag(
        &self,
        conns: &mut HashMap<NodeId, ProbeConnection>,
        primary: NodeId,
        standby_ids: &[NodeId],
        delay_by_time: bool,
    ) {
        let (rows, primary_lsn) = {
            let Some(primary_conn) = conns.get_mut(&primary) else {
                return;
            };
            let rows = match primary_conn
                .simple_query(
                    "SELECT client_addr, application_name, state, sync_state, \
                     pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn), \
                     COALESCE(EXTRACT(EPOCH FROM replay_lag) * 1000000, 0)::bigint \
                     FROM pg_stat_replication",
                )
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    debug!("cannot read pg_stat_replication on node {}: {}", primary, e);
                    return;
                }
            };
            let primary_lsn = if delay_by_time {
                None
            } else {
                match primary_conn.query_one("SELECT pg_current_wal_lsn()").await {
                    Ok(Some(text)) => parse_lsn(&text).ok(),
                    _ => None,
                }
            };
            (rows, primary_lsn)
        };

        let _ = self
            .state
            .update_replication_info(primary, 0, delay_by_time, "", "");

        for &standby in standby_ids {
            let Some(desc) = self.state.desc(standby) else {
                continue;
            };
            let row = rows.iter().find(|r| {
                let client_addr = r.first().cloned().flatten().unwrap_or_default();
                let app_name = r.get(1).cloned().flatten().unwrap_or_default();
                client_addr == desc.hostname || app_name == desc.hostname
            });
            let Some(row) = row else {
                // The primary does not know this standby; in byte mode a
                // direct LSN comparison still yields a lag figure.
                if let (Some(primary_lsn), Some(conn)) = (primary_lsn, conns.get_mut(&standby)) {
                    if let Ok(Some(text)) =
                        conn.query_one("SELECT pg_last_wal_replay_lsn()").await
                    {
                        if let Ok(replay) = parse_lsn(&text) {
                            let delay = primary_lsn.saturating_sub(replay);
                            let _ = self
                                .state
                                .update_replication_info(standby, delay, false, "", "");
                        }
                    }
                }
                continue;
            };
            let state = row.get(2).cloned().flatten().unwrap_or_default();
            let sync_state = row.get(3).cloned().flatten().unwrap_or_default();
            let delay = if delay_by_time {
                row.get(5)
                    .cloned()
                    .flatten()
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0)
                    .max(0) as u64
            } else {
                row.get(4)
                    .cloned()
                    .flatten()
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0)
                    .max(0.0) as u64
            };
            let _ = self
                .state
                .update_replication_info(standby, delay, delay_by_time, &state, &sync_state);
        }
    }
}

/// Probes a set of nodes once and reports which, if any, is primary. Used by
/// the failover engine's primary search while it holds the follow-primary
/// lock.
pub async fn find_primary_among(
    state: &Arc<ClusterState>,
    config: &SharedConfig,
) -> Result<NodeId, PoolError> {
    let sr = config.read().sr_check.clone();
    let creds = ProbeCredentials {
        user: sr.user,
        password: sr.password,
        database: sr.database,
    };
    let mut classes = Vec::new();
    for snapshot in state.snapshot_all() {
        if !snapshot.is_valid() {
            continue;
        }
        if let Ok(mut conn) = ProbeConnection::connect(&snapshot.desc, &creds).await {
            if let Ok(Some(value)) = conn.query_one("SELECT pg_is_in_recovery()").await {
                classes.push(NodeClass {
                    node_id: snapshot.node_id,
                    in_recovery: value == "t",
                });
            }
            conn.close().await;
        }
    }
    let (primary, _) = resolve_true_primary(&classes, &HashMap::new(), 0);
    Ok(primary.unwrap_or(NO_NODE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(node_id: NodeId, in_recovery: bool) -> NodeClass {
        NodeClass {
            node_id,
            in_recovery,
        }
    }

    #[test]
    fn no_primary_candidate_elects_nobody() {
        let classes = vec![class(0, true), class(1, true)];
        let (primary, invalid) = resolve_true_primary(&classes, &HashMap::new(), 2);
        assert_eq!(primary, None);
        assert!(invalid.is_empty());
    }

    #[test]
    fn single_primary_is_kept() {
        let classes = vec![class(0, false), class(1, true), class(2, true)];
        let (primary, invalid) = resolve_true_primary(&classes, &HashMap::new(), 2);
        assert_eq!(primary, Some(0));
        assert!(invalid.is_empty());
    }

    #[test]
    fn two_primaries_without_standbys_keep_lowest() {
        let classes = vec![class(0, false), class(2, false)];
        let (primary, invalid) = resolve_true_primary(&classes, &HashMap::new(), 0);
        assert_eq!(primary, Some(0));
        assert_eq!(invalid, vec![2]);
    }

    #[test]
    fn unanimous_votes_disqualify_false_primary() {
        let classes = vec![class(0, false), class(1, false), class(2, true), class(3, true)];
        let mut votes = HashMap::new();
        votes.insert(1, HashSet::from([2, 3]));
        let (primary, invalid) = resolve_true_primary(&classes, &votes, 2);
        assert_eq!(primary, Some(1));
        assert_eq!(invalid, vec![0]);
    }

    #[test]
    fn split_votes_keep_lowest_and_invalidate_nothing() {
        let classes = vec![class(0, false), class(1, false), class(2, true), class(3, true)];
        let mut votes = HashMap::new();
        votes.insert(0, HashSet::from([2]));
        votes.insert(1, HashSet::from([3]));
        let (primary, invalid) = resolve_true_primary(&classes, &votes, 2);
        assert_eq!(primary, Some(0));
        assert!(invalid.is_empty());
    }
}
