use pgflock::config::{
    AuthConfig, Config, FailoverConfig, HealthCheckConfig, ListenConfig, PcpConfig, PoolConfig,
    SrCheckConfig, TlsConfig, into_shared,
};
use pgflock::core::replication::ReplicationVerifier;
use pgflock::core::state::{BackendDesc, ClusterState, LockAcquire};
use std::sync::Arc;

fn backends(n: usize) -> Vec<BackendDesc> {
    (0..n)
        .map(|i| BackendDesc {
            hostname: format!("db{i}"),
            port: 5432,
            weight: 1.0,
            data_directory: String::new(),
            flags: vec![],
        })
        .collect()
}

fn state() -> (Arc<ClusterState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(
        ClusterState::new(backends(2), true, dir.path().join("status")).unwrap(),
    );
    (state, dir)
}

#[tokio::test]
async fn local_acquire_and_release() {
    let (state, _dir) = state();
    assert!(!state.follow_lock_held());
    assert_eq!(state.try_acquire_follow_lock(false), LockAcquire::Acquired);
    assert!(state.follow_lock_held());

    // A second local acquire is busy, not a deadlock.
    assert_eq!(state.try_acquire_follow_lock(false), LockAcquire::Busy);

    state.release_follow_lock(false);
    assert!(!state.follow_lock_held());
}

#[tokio::test]
async fn remote_request_during_local_hold_is_handed_over_on_release() {
    let (state, _dir) = state();
    assert_eq!(state.try_acquire_follow_lock(false), LockAcquire::Acquired);

    // A remote request arrives while a local holder owns the lock: busy,
    // but the request is remembered.
    assert_eq!(state.try_acquire_follow_lock(true), LockAcquire::Busy);

    // The local release transfers ownership to the remote side without
    // clearing the count.
    state.release_follow_lock(false);
    assert!(state.follow_lock_held());

    // A remote release now frees the lock; a local release would not have.
    state.release_follow_lock(true);
    assert!(!state.follow_lock_held());
}

#[tokio::test]
async fn remote_release_only_releases_remote_holds() {
    let (state, _dir) = state();
    assert_eq!(state.try_acquire_follow_lock(false), LockAcquire::Acquired);

    // A stray remote release must not free a locally held lock.
    state.release_follow_lock(true);
    assert!(state.follow_lock_held());

    state.release_follow_lock(false);
    assert!(!state.follow_lock_held());
}

#[tokio::test]
async fn remote_hold_blocks_local_acquire() {
    let (state, _dir) = state();
    assert_eq!(state.try_acquire_follow_lock(true), LockAcquire::Acquired);
    assert_eq!(state.try_acquire_follow_lock(false), LockAcquire::Busy);
    state.release_follow_lock(true);
    assert_eq!(state.try_acquire_follow_lock(false), LockAcquire::Acquired);
    state.release_follow_lock(false);
}

#[tokio::test(start_paused = true)]
async fn blocking_acquire_waits_for_the_holder() {
    let (state, _dir) = state();
    assert_eq!(state.try_acquire_follow_lock(false), LockAcquire::Acquired);

    let waiter = {
        let state = state.clone();
        tokio::spawn(async move {
            state.acquire_follow_lock(true, false).await
        })
    };
    // Let the waiter hit its retry sleep, then release.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    state.release_follow_lock(false);

    assert_eq!(waiter.await.unwrap(), LockAcquire::Acquired);
    state.release_follow_lock(false);
}

#[tokio::test]
async fn verifier_skips_cycle_while_lock_is_held() {
    // The replication check must not run concurrently with follow-primary;
    // a held lock makes the whole cycle a no-op.
    let (state, _dir) = state();
    let config = into_shared(Config {
        listen: ListenConfig::default(),
        log_level: "info".to_string(),
        streaming_replication: true,
        backends: backends(2),
        pool: PoolConfig::default(),
        health_check: HealthCheckConfig::default(),
        sr_check: SrCheckConfig::default(),
        failover: FailoverConfig::default(),
        pcp: PcpConfig::default(),
        auth: AuthConfig::default(),
        tls: TlsConfig::default(),
        status_file: "unused".to_string(),
    });

    assert_eq!(state.try_acquire_follow_lock(true), LockAcquire::Acquired);
    let verifier = ReplicationVerifier::new(state.clone(), config);
    // With the lock held remotely the cycle returns without probing any
    // backend (the configured hosts do not even exist).
    verifier.check_cycle().await.unwrap();
    assert!(state.follow_lock_held());
    state.release_follow_lock(true);
}

#[tokio::test]
async fn follow_primary_ongoing_flag_round_trips() {
    let (state, _dir) = state();
    assert!(!state.follow_primary_ongoing());
    state.set_follow_primary_ongoing(true);
    assert!(state.follow_primary_ongoing());
    state.set_follow_primary_ongoing(false);
    assert!(!state.follow_primary_ongoing());
}
