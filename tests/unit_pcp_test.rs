use async_trait::async_trait;
use pgflock::config::{
    AuthConfig, Config, FailoverConfig, HealthCheckConfig, ListenConfig, PcpConfig, PoolConfig,
    SrCheckConfig, TlsConfig, into_shared,
};
use pgflock::connection::SessionRegistry;
use pgflock::core::errors::PoolError;
use pgflock::core::events::InterruptBus;
use pgflock::core::failover::{CommandRunner, FailoverEngine, PrimaryProber};
use pgflock::core::state::{BackendDesc, BackendRole, BackendStatus, ClusterState, NO_NODE, NodeId};
use pgflock::core::watchdog::LocalOnlyWatchdog;
use pgflock::pcp::{PcpClient, PcpServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct QuietRunner;

#[async_trait]
impl CommandRunner for QuietRunner {
    async fn run(&self, _command_line: &str) -> Result<(), PoolError> {
        Ok(())
    }
}

struct NoPrimaryProber;

#[async_trait]
impl PrimaryProber for NoPrimaryProber {
    async fn find_primary(&self) -> Result<NodeId, PoolError> {
        Ok(NO_NODE)
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct Harness {
    client: PcpClient,
    state: Arc<ClusterState>,
    port: u16,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let user_file = dir.path().join("pcp.conf");
    std::fs::write(&user_file, "admin:adminpw\n").unwrap();
    let port = free_port();

    let backends = vec![
        BackendDesc {
            hostname: "db0".to_string(),
            port: 5432,
            weight: 1.0,
            data_directory: String::new(),
            flags: vec![],
        },
        BackendDesc {
            hostname: "db1".to_string(),
            port: 5433,
            weight: 1.0,
            data_directory: String::new(),
            flags: vec![],
        },
    ];
    let config = Config {
        listen: ListenConfig::default(),
        log_level: "info".to_string(),
        streaming_replication: true,
        backends: backends.clone(),
        pool: PoolConfig::default(),
        health_check: HealthCheckConfig::default(),
        sr_check: SrCheckConfig::default(),
        failover: FailoverConfig {
            search_primary_node_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        pcp: PcpConfig {
            host: "127.0.0.1".to_string(),
            port,
            socket_dir: None,
            user_file: user_file.to_string_lossy().into_owned(),
        },
        auth: AuthConfig::default(),
        tls: TlsConfig::default(),
        status_file: dir.path().join("status").to_string_lossy().into_owned(),
    };
    let config = into_shared(config);

    let state = Arc::new(
        ClusterState::new(backends, true, dir.path().join("status")).unwrap(),
    );
    state.set_backend_status(0, BackendStatus::Up).unwrap();
    state.set_backend_status(1, BackendStatus::Up).unwrap();
    state.set_role(0, BackendRole::Primary).unwrap();
    state.set_role(1, BackendRole::Standby).unwrap();
    state.set_primary_node_id(0);
    state.recompute_main_node();

    let sessions = Arc::new(SessionRegistry::new());
    let watchdog = Arc::new(LocalOnlyWatchdog::new("pcp-test".to_string()));
    let bus = Arc::new(InterruptBus::new());
    let restart = Arc::new(Notify::new());
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    // The engine must run for mutating requests to complete.
    let engine = Arc::new(FailoverEngine::new(
        state.clone(),
        config.clone(),
        sessions.clone(),
        watchdog.clone(),
        Arc::new(QuietRunner),
        Arc::new(NoPrimaryProber),
        bus.clone(),
        restart.clone(),
    ));
    tokio::spawn(engine.run(shutdown_tx.subscribe()));

    let server = PcpServer::new(
        state.clone(),
        config.clone(),
        sessions.clone(),
        watchdog,
        Arc::new(QuietRunner),
        bus,
        restart,
    );
    tokio::spawn(server.run(shutdown_tx.subscribe()));
    // Leak the sender so the workers stay alive for the test duration.
    std::mem::forget(shutdown_tx);

    // Give the server a moment to bind.
    let mut client = None;
    for _ in 0..50 {
        match PcpClient::connect("127.0.0.1", port).await {
            Ok(c) => {
                client = Some(c);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let mut client = client.expect("PCP server did not come up");
    client.authenticate("admin", "adminpw").await.unwrap();

    Harness {
        client,
        state,
        port,
        _dir: dir,
    }
}

#[tokio::test]
async fn informational_replies_round_trip() {
    let mut h = harness().await;

    assert_eq!(h.client.node_count().await.unwrap(), 2);

    // The decoded node record equals what the server read from the shared
    // state in the same call.
    let info = h.client.node_info(0).await.unwrap();
    let snapshot = h.state.snapshot(0).unwrap();
    assert_eq!(info.hostname, "db0");
    assert_eq!(info.port, "5432");
    assert_eq!(info.status, "2");
    assert_eq!(info.status_name, "Connection in use");
    assert_eq!(info.weight, "1.000000");
    assert_eq!(info.role_name, "primary");
    assert_eq!(info.standby_delay, "0");
    assert_eq!(info.standby_delay_by_time, "0");
    assert_eq!(info.replication_state, "");
    assert_eq!(info.replication_sync_state, "");
    assert_eq!(
        info.last_status_change,
        pgflock::pcp::report::format_ctime(snapshot.record.status_changed_at)
    );

    let stats = h.client.health_check_stats(1).await.unwrap();
    assert_eq!(stats.node_id, "1");
    assert_eq!(stats.total_count, "0");

    assert!(h.client.proc_count().await.unwrap().is_empty());
    assert!(!h.client.pool_status().await.unwrap().is_empty());

    let wd = h.client.watchdog_info(None).await.unwrap();
    assert_eq!(wd["NodeCount"], 1);

    // Runtime parameter changes are visible in the next pool-status read.
    h.client
        .set_parameter("sr_check_period", "42s")
        .await
        .unwrap();
    let status = h.client.pool_status().await.unwrap();
    let sr_period = status
        .iter()
        .find(|(name, _, _)| name == "sr_check_period")
        .map(|(_, value, _)| value.clone());
    assert_eq!(sr_period.as_deref(), Some("42"));
    // Unknown parameters are a state error, not a dropped connection.
    assert!(h.client.set_parameter("listen_port", "1").await.is_err());
    assert_eq!(h.client.node_count().await.unwrap(), 2);

    h.client.close().await;
}

#[tokio::test]
async fn detach_and_attach_apply_through_the_engine() {
    let mut h = harness().await;

    h.client.detach_node(1, true).await.unwrap();
    assert_eq!(
        h.state.snapshot(1).unwrap().record.status,
        BackendStatus::Down
    );

    h.client.attach_node(1).await.unwrap();
    assert_eq!(
        h.state.snapshot(1).unwrap().record.status,
        BackendStatus::ConnectWait
    );

    h.client.close().await;
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let h = harness().await;
    // The server handles one connection at a time; release ours first.
    let port = h.port;
    h.client.close().await;

    let mut other = PcpClient::connect("127.0.0.1", port).await.unwrap();
    let err = other.authenticate("admin", "wrong").await.unwrap_err();
    assert!(err.to_string().contains("authentication failed"));
}
