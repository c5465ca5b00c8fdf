use pgflock::core::state::persistence::{read_status_file, reconcile, write_status_file};
use pgflock::core::state::{BackendDesc, BackendStatus, ClusterState};
use std::sync::Arc;

fn backends(n: usize) -> Vec<BackendDesc> {
    (0..n)
        .map(|i| BackendDesc {
            hostname: format!("db{i}"),
            port: 5432 + i as u16,
            weight: 1.0,
            data_directory: String::new(),
            flags: vec![],
        })
        .collect()
}

#[test]
fn ascii_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status");
    let statuses = vec![
        BackendStatus::Up,
        BackendStatus::Down,
        BackendStatus::Unused,
    ];
    write_status_file(&path, &statuses).unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "up\ndown\nunused\n"
    );
    let loaded = read_status_file(&path, 3).unwrap().unwrap();
    assert_eq!(
        loaded,
        vec![BackendStatus::Up, BackendStatus::Down, BackendStatus::Unused]
    );
}

#[test]
fn legacy_binary_is_accepted_on_read_but_never_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status");
    // One status byte per backend, zero padding after.
    std::fs::write(&path, [2u8, 3, 1, 0, 0]).unwrap();
    let loaded = read_status_file(&path, 3).unwrap().unwrap();
    assert_eq!(
        loaded,
        vec![
            BackendStatus::Up,
            BackendStatus::Down,
            BackendStatus::ConnectWait
        ]
    );

    // A rewrite comes out in the ASCII form.
    write_status_file(&path, &loaded).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text, "up\ndown\nup\n");
}

#[test]
fn missing_file_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nonexistent");
    assert!(read_status_file(&path, 3).unwrap().is_none());
}

#[test]
fn reconcile_pads_and_truncates() {
    let padded = reconcile(vec![BackendStatus::Up], 3);
    assert_eq!(
        padded,
        vec![
            BackendStatus::Up,
            BackendStatus::ConnectWait,
            BackendStatus::ConnectWait
        ]
    );
    let truncated = reconcile(vec![BackendStatus::Up, BackendStatus::Down], 1);
    assert_eq!(truncated, vec![BackendStatus::Up]);
}

#[test]
fn restart_reproduces_last_written_statuses() {
    // A sequence of transitions that does not end all-DOWN survives a
    // process restart through the status file.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status");

    {
        let state = Arc::new(ClusterState::new(backends(3), true, path.clone()).unwrap());
        state.set_backend_status(0, BackendStatus::Up).unwrap();
        state.set_backend_status(1, BackendStatus::Down).unwrap();
        state.set_backend_status(2, BackendStatus::Up).unwrap();
    }

    let restarted = ClusterState::new(backends(3), true, path).unwrap();
    let statuses = restarted.statuses();
    assert_eq!(
        statuses,
        vec![BackendStatus::Up, BackendStatus::Down, BackendStatus::Up]
    );
}

#[test]
fn all_down_transition_preserves_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status");
    let state = Arc::new(ClusterState::new(backends(2), true, path.clone()).unwrap());
    state.set_backend_status(0, BackendStatus::Up).unwrap();
    state.set_backend_status(1, BackendStatus::Up).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "up\nup\n");

    // Taking the last node down would leave everything DOWN; the file must
    // keep the last known good topology.
    state.set_backend_status(0, BackendStatus::Down).unwrap();
    state.set_backend_status(1, BackendStatus::Down).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text, "down\nup\n");
}
