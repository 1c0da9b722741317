//! Integration tests for broker process supervision

use pyengine::client::{ServerSupervisor, SupervisorEvent};
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::timeout;

/// Write a stand-in broker executable that just stays alive.
fn write_sleeper(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("pyengine-test-broker");
    std::fs::write(&path, "#!/bin/sh\nsleep 60\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[tokio::test]
async fn start_missing_executable_fails() {
    let dir = tempdir().unwrap();
    let (supervisor, _events) = ServerSupervisor::new(
        dir.path().join("does-not-exist"),
        dir.path().join("broker.sock"),
    );

    assert!(supervisor.start_server().await.is_err());
    assert!(!supervisor.is_running().await);
}

#[tokio::test]
async fn stop_without_start_is_a_noop() {
    let dir = tempdir().unwrap();
    let (supervisor, mut events) = ServerSupervisor::new(
        dir.path().join("pyengine-server"),
        dir.path().join("broker.sock"),
    );

    supervisor.stop_server().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn supervisor_starts_and_stops_a_child() {
    let dir = tempdir().unwrap();
    let executable = write_sleeper(dir.path());
    let (supervisor, mut events) =
        ServerSupervisor::new(executable, dir.path().join("broker.sock"));

    // The stand-in never opens the endpoint, so start_server spends its
    // readiness window and returns without a ServerStarted event.
    supervisor.start_server().await.expect("spawn failed");
    assert!(supervisor.is_running().await);

    supervisor.stop_server().await;
    assert!(!supervisor.is_running().await);

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no supervisor event")
        .expect("event stream closed");
    assert_eq!(event, SupervisorEvent::ServerStopped);
}
