use pgflock::config::{
    AuthConfig, Config, FailoverConfig, HealthCheckConfig, ListenConfig, PcpConfig, PoolConfig,
    SrCheckConfig, TlsConfig, into_shared,
};
use pgflock::core::health::HealthCheckWorker;
use pgflock::core::state::{
    BackendDesc, BackendStatus, ClusterState, NodeFlag, RequestFlags, RequestKind,
};
use std::sync::Arc;
use std::time::Duration;

fn unreachable_backend(flags: Vec<NodeFlag>) -> BackendDesc {
    // Port 1 on localhost refuses connections immediately.
    BackendDesc {
        hostname: "127.0.0.1".to_string(),
        port: 1,
        weight: 1.0,
        data_directory: String::new(),
        flags,
    }
}

fn config_for(backends: Vec<BackendDesc>, fault_file: Option<String>) -> Config {
    Config {
        listen: ListenConfig::default(),
        log_level: "info".to_string(),
        streaming_replication: true,
        backends,
        pool: PoolConfig::default(),
        health_check: HealthCheckConfig {
            period: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            user: "postgres".to_string(),
            password: None,
            database: "postgres".to_string(),
            fault_injection_file: fault_file,
        },
        sr_check: SrCheckConfig::default(),
        failover: FailoverConfig::default(),
        pcp: PcpConfig::default(),
        auth: AuthConfig::default(),
        tls: TlsConfig::default(),
        status_file: "unused".to_string(),
    }
}

fn state_for(backends: Vec<BackendDesc>) -> (Arc<ClusterState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(
        ClusterState::new(backends, true, dir.path().join("status")).unwrap(),
    );
    state.set_backend_status(0, BackendStatus::Up).unwrap();
    (state, dir)
}

#[tokio::test]
async fn unreachable_backend_is_reported_down_with_switchover() {
    let backends = vec![unreachable_backend(vec![])];
    let (state, _dir) = state_for(backends.clone());
    let config = into_shared(config_for(backends, None));

    let worker = HealthCheckWorker::new(0, state.clone(), config);
    worker.check_once().await;

    let stats = state.stats_snapshot(0).unwrap();
    assert_eq!(stats.total_count, 1);
    assert_eq!(stats.fail_count, 1);
    assert_eq!(stats.retry_count, 2);
    assert_eq!(stats.max_retry_count, 2);
    assert!(stats.total_count >= stats.success_count + stats.fail_count + stats.skip_count);

    // A connection refusal is not a timeout, so the request carries the
    // switchover flag.
    let request = state.dequeue_request().expect("detach request queued");
    assert_eq!(request.kind, RequestKind::NodeDown);
    assert_eq!(request.node_ids, vec![0]);
    assert!(request.flags.contains(RequestFlags::SWITCHOVER));
}

#[tokio::test]
async fn disallow_failover_flag_suppresses_the_request() {
    let backends = vec![unreachable_backend(vec![NodeFlag::DisallowToFailover])];
    let (state, _dir) = state_for(backends.clone());
    let config = into_shared(config_for(backends, None));

    let worker = HealthCheckWorker::new(0, state.clone(), config);
    worker.check_once().await;

    assert!(state.dequeue_request().is_none());
    // The failure itself is not even counted against the node.
    let stats = state.stats_snapshot(0).unwrap();
    assert_eq!(stats.fail_count, 0);
}

#[tokio::test]
async fn fault_injection_discards_the_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let fault_file = dir.path().join("faults");
    std::fs::write(&fault_file, "0\n").unwrap();

    let backends = vec![unreachable_backend(vec![])];
    let (state, _state_dir) = state_for(backends.clone());
    let config = into_shared(config_for(
        backends,
        Some(fault_file.to_string_lossy().into_owned()),
    ));

    let worker = HealthCheckWorker::new(0, state.clone(), config);
    worker.check_once().await;

    let stats = state.stats_snapshot(0).unwrap();
    assert_eq!(stats.skip_count, 1);
    assert_eq!(stats.fail_count, 0);
    assert!(state.dequeue_request().is_none());
}

#[tokio::test]
async fn counters_are_monotonic_across_checks() {
    let backends = vec![unreachable_backend(vec![])];
    let (state, _dir) = state_for(backends.clone());
    let config = into_shared(config_for(backends, None));
    let worker = HealthCheckWorker::new(0, state.clone(), config);

    let mut last_total = 0;
    let mut last_fail = 0;
    for _ in 0..3 {
        worker.check_once().await;
        let stats = state.stats_snapshot(0).unwrap();
        assert!(stats.total_count > last_total);
        assert!(stats.fail_count >= last_fail);
        last_total = stats.total_count;
        last_fail = stats.fail_count;
        // Drain whatever the worker enqueued so the queue cannot overflow.
        while state.dequeue_request().is_some() {}
    }
}
