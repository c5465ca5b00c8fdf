use async_trait::async_trait;
use parking_lot::Mutex;
use pgflock::config::{
    AuthConfig, Config, FailoverConfig, HealthCheckConfig, ListenConfig, PcpConfig, PoolConfig,
    SharedConfig, SrCheckConfig, TlsConfig, into_shared,
};
use pgflock::connection::SessionRegistry;
use pgflock::core::errors::PoolError;
use pgflock::core::events::InterruptBus;
use pgflock::core::failover::{
    CommandRunner, FailoverEngine, PrimaryProber, RestartDecision, decide_restart,
};
use pgflock::core::state::{
    BackendDesc, BackendRole, BackendStatus, ClusterState, FailoverRequest, NO_NODE, NodeId,
    RequestFlags, RequestKind,
};
use pgflock::core::watchdog::LocalOnlyWatchdog;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct RecordingRunner {
    commands: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command_line: &str) -> Result<(), PoolError> {
        if !command_line.trim().is_empty() {
            self.commands.lock().push(command_line.to_string());
        }
        Ok(())
    }
}

struct ScriptedProber {
    answers: Mutex<VecDeque<NodeId>>,
}

#[async_trait]
impl PrimaryProber for ScriptedProber {
    async fn find_primary(&self) -> Result<NodeId, PoolError> {
        Ok(self.answers.lock().pop_front().unwrap_or(NO_NODE))
    }
}

struct PanickingProber;

#[async_trait]
impl PrimaryProber for PanickingProber {
    async fn find_primary(&self) -> Result<NodeId, PoolError> {
        panic!("the prober must not run while follow-primary is in flight");
    }
}

fn backend(host: &str, port: u16) -> BackendDesc {
    BackendDesc {
        hostname: host.to_string(),
        port,
        weight: 1.0,
        data_directory: format!("/data/{host}"),
        flags: vec![],
    }
}

fn test_config(status_file: &std::path::Path, backends: Vec<BackendDesc>) -> Config {
    Config {
        listen: ListenConfig::default(),
        log_level: "info".to_string(),
        streaming_replication: true,
        backends,
        pool: PoolConfig::default(),
        health_check: HealthCheckConfig::default(),
        sr_check: SrCheckConfig::default(),
        failover: FailoverConfig {
            failover_command: "failover node=%d host=%h port=%p new_main=%m new_main_host=%H old_main=%M old_primary=%P".to_string(),
            failback_command: "failback node=%d host=%h".to_string(),
            follow_primary_command: String::new(),
            recovery_command: String::new(),
            search_primary_node_timeout: Duration::from_secs(2),
        },
        pcp: PcpConfig::default(),
        auth: AuthConfig::default(),
        tls: TlsConfig::default(),
        status_file: status_file.to_string_lossy().into_owned(),
    }
}

struct Fixture {
    state: Arc<ClusterState>,
    config: SharedConfig,
    engine: Arc<FailoverEngine>,
    runner: Arc<RecordingRunner>,
    sessions: Arc<SessionRegistry>,
    prober: Arc<ScriptedProber>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let status_file = dir.path().join("pgflock_status");
    let backends = vec![
        backend("db0", 5432),
        backend("db1", 5433),
        backend("db2", 5434),
    ];
    let config = into_shared(test_config(&status_file, backends.clone()));
    let state = Arc::new(ClusterState::new(backends, true, status_file).unwrap());

    // Seed: node 0 primary, nodes 1 and 2 standbys, everything up.
    for node in 0..3 {
        state.set_backend_status(node, BackendStatus::Up).unwrap();
    }
    state.set_role(0, BackendRole::Primary).unwrap();
    state.set_role(1, BackendRole::Standby).unwrap();
    state.set_role(2, BackendRole::Standby).unwrap();
    state.set_primary_node_id(0);
    state.recompute_main_node();

    let runner = Arc::new(RecordingRunner {
        commands: Mutex::new(Vec::new()),
    });
    let prober = Arc::new(ScriptedProber {
        answers: Mutex::new(VecDeque::new()),
    });
    let sessions = Arc::new(SessionRegistry::new());
    let engine = Arc::new(FailoverEngine::new(
        state.clone(),
        config.clone(),
        sessions.clone(),
        Arc::new(LocalOnlyWatchdog::new("test".to_string())),
        runner.clone(),
        prober.clone(),
        Arc::new(InterruptBus::new()),
        Arc::new(Notify::new()),
    ));
    Fixture {
        state,
        config,
        engine,
        runner,
        sessions,
        prober,
        _dir: dir,
    }
}

fn status_file_tokens(f: &Fixture) -> String {
    let path = f.config.read().status_file.clone();
    std::fs::read_to_string(path).unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn standby_failover_keeps_primary_and_writes_status_file() {
    // S1: detach standby 1 with switchover.
    let f = fixture();
    f.state
        .enqueue_request(FailoverRequest::node_down(1, RequestFlags::SWITCHOVER))
        .unwrap();
    f.engine.drain().await;

    assert_eq!(f.state.snapshot(1).unwrap().record.status, BackendStatus::Down);
    assert_eq!(f.state.primary_node_id(), 0);
    assert_eq!(f.state.main_node_id(), 0);
    assert_eq!(status_file_tokens(&f), "up\ndown\nup\n");

    let commands = f.runner.commands.lock().clone();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains("node=1"));
    assert!(commands[0].contains("host=db1"));
    assert!(commands[0].contains("old_primary=0"));
}

#[tokio::test(start_paused = true)]
async fn primary_crash_without_candidate_leaves_no_primary() {
    // S2: detach the primary; both survivors report being in recovery, so
    // the scripted prober never finds a primary.
    let f = fixture();
    f.state
        .enqueue_request(FailoverRequest::node_down(0, RequestFlags::SWITCHOVER))
        .unwrap();
    f.engine.drain().await;

    assert_eq!(f.state.snapshot(0).unwrap().record.status, BackendStatus::Down);
    assert_eq!(f.state.primary_node_id(), NO_NODE);
    assert_eq!(f.state.main_node_id(), 1);
}

#[tokio::test(start_paused = true)]
async fn promote_standby_runs_failover_command_and_commits_primary() {
    // S3: promote node 1 while node 0 is still primary.
    let f = fixture();
    f.state
        .enqueue_request(FailoverRequest::promote(
            1,
            RequestFlags::PROMOTE | RequestFlags::SWITCHOVER,
        ))
        .unwrap();
    f.engine.drain().await;

    assert_eq!(f.state.primary_node_id(), 1);
    assert_eq!(f.state.snapshot(1).unwrap().record.role, BackendRole::Primary);
    // Every other backend that carried PRIMARY has been demoted.
    assert_eq!(f.state.snapshot(0).unwrap().record.role, BackendRole::Standby);

    let commands = f.runner.commands.lock().clone();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains("node=1"));
    assert!(commands[0].contains("new_main=0"));
    assert!(commands[0].contains("old_main=0"));
    assert!(commands[0].contains("old_primary=0"));
}

#[tokio::test(start_paused = true)]
async fn failback_of_primary_triggers_follow_primary() {
    // S4: after the promotion, failing the primary back with a follow
    // command configured re-points every other node at it.
    let f = fixture();
    f.state
        .enqueue_request(FailoverRequest::promote(
            1,
            RequestFlags::PROMOTE | RequestFlags::SWITCHOVER,
        ))
        .unwrap();
    f.engine.drain().await;
    f.runner.commands.lock().clear();

    f.config.write().failover.follow_primary_command =
        "follow node=%d new_primary_host=%H".to_string();
    f.prober.answers.lock().push_back(1);

    f.state
        .enqueue_request(FailoverRequest::node_up(1, RequestFlags::empty()))
        .unwrap();
    f.engine.drain().await;
    f.engine.wait_follow_done().await;

    // Only node 1 remains usable; the others were set DOWN for the follow
    // child to reconfigure.
    assert!(f.state.snapshot(1).unwrap().record.status.is_valid());
    assert_eq!(f.state.snapshot(0).unwrap().record.status, BackendStatus::Down);
    assert_eq!(f.state.snapshot(2).unwrap().record.status, BackendStatus::Down);
    assert_eq!(f.state.primary_node_id(), 1);
    assert!(!f.state.follow_primary_ongoing());
    assert!(!f.state.follow_lock_held());

    let commands = f.runner.commands.lock().clone();
    let follows: Vec<&String> = commands.iter().filter(|c| c.starts_with("follow")).collect();
    assert_eq!(follows.len(), 2);
    assert!(follows.iter().all(|c| c.contains("new_primary_host=db1")));
}

#[tokio::test(start_paused = true)]
async fn quarantine_round_trip_restores_primary() {
    // Quarantine the primary, then resurrect it through the health checker
    // path; role and primary pointer must come back.
    let f = fixture();
    let file_before = status_file_tokens(&f);

    f.state
        .enqueue_request(FailoverRequest::new(
            RequestKind::NodeQuarantine,
            vec![0],
            RequestFlags::empty(),
        ))
        .unwrap();
    f.engine.drain().await;

    assert_eq!(f.state.snapshot(0).unwrap().record.status, BackendStatus::Down);
    assert!(f.state.snapshot(0).unwrap().record.quarantine);
    assert_eq!(f.state.primary_node_id(), NO_NODE);
    // Quarantine transitions never touch the status file.
    assert_eq!(status_file_tokens(&f), file_before);

    f.state
        .enqueue_request(FailoverRequest::node_up(
            0,
            RequestFlags::UPDATE | RequestFlags::WATCHDOG,
        ))
        .unwrap();
    f.engine.drain().await;

    let snapshot = f.state.snapshot(0).unwrap();
    assert_eq!(snapshot.record.status, BackendStatus::ConnectWait);
    assert!(!snapshot.record.quarantine);
    assert_eq!(snapshot.record.role, BackendRole::Primary);
    assert_eq!(f.state.primary_node_id(), 0);
    // No failover or failback command runs for a quarantine round trip.
    assert!(f.runner.commands.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn requests_apply_in_fifo_order() {
    let f = fixture();
    f.state
        .enqueue_request(FailoverRequest::node_down(1, RequestFlags::SWITCHOVER))
        .unwrap();
    f.state
        .enqueue_request(FailoverRequest::node_down(2, RequestFlags::SWITCHOVER))
        .unwrap();
    assert!(f.state.is_busy());
    f.engine.drain().await;
    assert!(!f.state.is_busy());

    let commands = f.runner.commands.lock().clone();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].contains("node=1"));
    assert!(commands[1].contains("node=2"));
}

#[tokio::test(start_paused = true)]
async fn find_primary_skips_probing_while_follow_primary_runs() {
    let f = fixture();
    let engine = Arc::new(FailoverEngine::new(
        f.state.clone(),
        f.config.clone(),
        f.sessions.clone(),
        Arc::new(LocalOnlyWatchdog::new("test".to_string())),
        f.runner.clone(),
        Arc::new(PanickingProber),
        Arc::new(InterruptBus::new()),
        Arc::new(Notify::new()),
    ));
    f.state.set_follow_primary_ongoing(true);
    assert_eq!(engine.find_primary_node_repeatedly().await, 0);
    f.state.set_follow_primary_ongoing(false);
}

#[test]
fn restart_decision_table() {
    use RequestKind::*;
    // Failback in streaming mode of a non-primary with survivors: no kills.
    assert_eq!(
        decide_restart(NodeUp, RequestFlags::empty(), true, false, false, false),
        RestartDecision::None
    );
    // Failback of the former primary: full restart.
    assert_eq!(
        decide_restart(NodeUp, RequestFlags::empty(), true, false, true, false),
        RestartDecision::Full
    );
    // Switchover of a standby: partial restart.
    assert_eq!(
        decide_restart(NodeDown, RequestFlags::SWITCHOVER, true, false, false, false),
        RestartDecision::Partial
    );
    // Crash of the primary: full restart.
    assert_eq!(
        decide_restart(NodeDown, RequestFlags::SWITCHOVER, true, false, false, true),
        RestartDecision::Full
    );
    // Quarantine resurrection with survivors: restart suppressed.
    assert_eq!(
        decide_restart(NodeUp, RequestFlags::UPDATE, true, false, true, false),
        RestartDecision::None
    );
    // Quarantine resurrection after a total outage: full restart.
    assert_eq!(
        decide_restart(NodeUp, RequestFlags::UPDATE, true, true, true, false),
        RestartDecision::Full
    );
}

#[tokio::test(start_paused = true)]
async fn promote_rejects_unusable_nodes() {
    let f = fixture();
    f.state.set_backend_status(2, BackendStatus::Down).unwrap();
    f.state
        .enqueue_request(FailoverRequest::promote(2, RequestFlags::PROMOTE))
        .unwrap();
    f.engine.drain().await;
    // The request fails; the primary is untouched.
    assert_eq!(f.state.primary_node_id(), 0);
}
