//! Integration tests for the client library against a live broker

use pyengine::client::{script_result_from, ClientEvent, PackageResult, PythonClient};
use pyengine::protocol::Response;
use pyengine::python::PythonEnv;
use pyengine::server::BrokerServer;
use serde_json::json;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn can_create_unix_socket() -> bool {
    let dir = std::env::temp_dir();
    let path = dir.join("pyengine_client_test_perm.sock");
    match StdUnixListener::bind(&path) {
        Ok(listener) => {
            drop(listener);
            let _ = std::fs::remove_file(&path);
            true
        }
        Err(_) => false,
    }
}

fn system_python() -> Option<PathBuf> {
    for candidate in ["python3", "python"] {
        let works = std::process::Command::new(candidate)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if works {
            return Some(PathBuf::from(candidate));
        }
    }
    None
}

struct TestBroker {
    socket_path: PathBuf,
    shutdown_tx: mpsc::Sender<()>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    dir: TempDir,
}

fn start_broker_in(dir: TempDir, python: PathBuf) -> TestBroker {
    let socket_path = dir.path().join("broker.sock");
    let env = PythonEnv::with_interpreter(dir.path().join("python"), python);
    std::fs::create_dir_all(env.site_packages()).unwrap();

    let server = BrokerServer::new(socket_path.clone(), Arc::new(env));
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let handle = tokio::spawn(async move { server.run(shutdown_rx).await });

    TestBroker {
        socket_path,
        shutdown_tx,
        handle,
        dir,
    }
}

/// Drain events until one matches, with a deadline.
async fn expect_event<F>(
    events: &mut mpsc::Receiver<ClientEvent>,
    deadline: Duration,
    mut matches: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(deadline, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive in time")
}

#[test]
fn package_result_conversion_covers_payloads() {
    let mut response = Response::success("E9");
    response.stdout = Some("out".to_string());
    response.stderr = Some("err".to_string());
    response.execution_time = Some(12);
    response.installed_packages = Some(vec!["requests".to_string()]);
    response.installed = Some(true);
    response.version = Some("2.31.0".to_string());

    let result = PackageResult::from_response(&response);
    assert!(result.success);
    assert!(!result.cancelled);
    assert_eq!(result.execution_id, "E9");
    assert_eq!(result.stdout, "out");
    assert_eq!(result.stderr, "err");
    assert_eq!(result.execution_time_ms, 12);
    assert_eq!(result.installed_packages, Some(vec!["requests".to_string()]));
    assert_eq!(result.installed, Some(true));
    assert_eq!(result.version.as_deref(), Some("2.31.0"));
}

#[test]
fn script_result_conversion_maps_statuses() {
    let mut response = Response {
        status: "cancelled".to_string(),
        ..Default::default()
    };
    response.execution_id = Some("E1".to_string());
    response.stderr = Some("Execution canceled by user.".to_string());

    let result = script_result_from(&response);
    assert!(result.cancelled);
    assert!(!result.success);
    assert_eq!(result.execution_id, "E1");

    let response = Response {
        status: "error".to_string(),
        ..Default::default()
    };
    let result = script_result_from(&response);
    assert!(!result.success);
    assert!(!result.cancelled);
}

#[tokio::test]
async fn client_runs_a_script_through_the_broker() {
    if !can_create_unix_socket() {
        eprintln!("Skipping client_runs_a_script_through_the_broker: unix sockets not permitted");
        return;
    }
    let Some(python) = system_python() else {
        eprintln!("Skipping client_runs_a_script_through_the_broker: no python interpreter");
        return;
    };

    let broker = start_broker_in(tempdir().unwrap(), python);
    let (client, mut events) = PythonClient::new(broker.socket_path.clone());

    assert!(client.wait_for_server_ready().await);
    expect_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, ClientEvent::ConnectedToServer)
    })
    .await;

    assert!(client.run_script(
        "E1",
        "result = 10 + 20\nprint(result)",
        vec![json!(0)],
        5000,
    ));

    let event = expect_event(&mut events, Duration::from_secs(10), |event| {
        matches!(
            event,
            ClientEvent::ScriptExecutionFinished(result) if result.execution_id == "E1"
        )
    })
    .await;

    let ClientEvent::ScriptExecutionFinished(result) = event else {
        unreachable!();
    };
    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.stdout.trim(), "30");

    client.shutdown();
    let _ = broker.shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), broker.handle).await;
}

#[tokio::test]
async fn client_sees_package_progress_and_terminal() {
    if !can_create_unix_socket() {
        eprintln!("Skipping client_sees_package_progress_and_terminal: unix sockets not permitted");
        return;
    }

    let broker = start_broker_in(tempdir().unwrap(), PathBuf::from("python3"));

    // Fake an installed package so uninstall has something to remove.
    let site = broker.dir.path().join("python").join("Lib").join("site-packages");
    std::fs::create_dir_all(site.join("requests-2.31.0.dist-info")).unwrap();

    let (client, mut events) = PythonClient::new(broker.socket_path.clone());
    assert!(client.wait_for_server_ready().await);

    assert!(client.uninstall_package("U1", "requests"));

    let progress = expect_event(&mut events, Duration::from_secs(5), |event| {
        matches!(
            event,
            ClientEvent::PackageOperationProgress { execution_id, .. } if execution_id == "U1"
        )
    })
    .await;
    let ClientEvent::PackageOperationProgress { operation, .. } = progress else {
        unreachable!();
    };
    assert_eq!(operation, pyengine::protocol::OperationKind::Uninstall);

    let event = expect_event(&mut events, Duration::from_secs(5), |event| {
        matches!(
            event,
            ClientEvent::PackageOperationFinished(result) if result.execution_id == "U1"
        )
    })
    .await;
    let ClientEvent::PackageOperationFinished(result) = event else {
        unreachable!();
    };
    assert!(result.success, "stderr: {}", result.stderr);
    assert!(result.stdout.contains("Uninstalled package: requests"));

    client.shutdown();
    let _ = broker.shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), broker.handle).await;
}

#[tokio::test]
async fn client_reconnects_after_broker_restart() {
    if !can_create_unix_socket() {
        eprintln!("Skipping client_reconnects_after_broker_restart: unix sockets not permitted");
        return;
    }

    let first = start_broker_in(tempdir().unwrap(), PathBuf::from("python3"));
    let socket_path = first.socket_path.clone();

    let (client, mut events) = PythonClient::new(socket_path.clone());
    assert!(client.wait_for_server_ready().await);
    expect_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, ClientEvent::ConnectedToServer)
    })
    .await;

    // Stop the broker; the client must notice.
    let _ = first.shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), first.handle).await;
    expect_event(&mut events, Duration::from_secs(10), |event| {
        matches!(event, ClientEvent::DisconnectedFromServer)
    })
    .await;

    // Restart on the same endpoint; the reconnect timer takes it from here.
    let second = start_broker_in(first.dir, PathBuf::from("python3"));
    expect_event(&mut events, Duration::from_secs(15), |event| {
        matches!(event, ClientEvent::ConnectedToServer)
    })
    .await;

    assert!(client.is_connected());
    let execution_id = client.list_installed_packages().expect("not accepted");
    let event = expect_event(&mut events, Duration::from_secs(5), |event| {
        matches!(
            event,
            ClientEvent::PackageOperationFinished(result) if result.execution_id == execution_id
        )
    })
    .await;
    let ClientEvent::PackageOperationFinished(result) = event else {
        unreachable!();
    };
    assert!(result.success);

    client.shutdown();
    let _ = second.shutdown_tx.send(()).await;
    let _ = timeout(Duration::from_secs(2), second.handle).await;
}
