//! Client library - connector, demultiplexer, and broker supervision
//!
//! Host applications construct a [`PythonClient`], submit commands keyed by
//! their own execution ids, and consume [`ClientEvent`]s from the returned
//! stream: zero or more progress notifications and exactly one completion
//! per id, plus connectivity changes. The connection task keeps
//! reconnecting on a 5 second timer until [`PythonClient::shutdown`].

mod supervisor;

pub use supervisor::{ServerSupervisor, SupervisorEvent};

use crate::protocol::{
    self, crypto::SecretKey, Command, Decoded, FrameDecoder, OperationKind, Response,
};
use crate::python::PythonResult;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

/// Deadline for one connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between reconnection attempts after a disconnect.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
/// Total time [`PythonClient::wait_for_server_ready`] keeps polling.
const READY_TIMEOUT: Duration = Duration::from_secs(20);

/// Notifications surfaced to the host application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectedToServer,
    DisconnectedFromServer,
    /// Terminal result of a script execution or syntax check
    ScriptExecutionFinished(PythonResult),
    /// Terminal result of a package operation
    PackageOperationFinished(PackageResult),
    /// Streamed stage description for a running package operation
    PackageOperationProgress {
        operation: OperationKind,
        stage: String,
        execution_id: String,
    },
}

/// Terminal fields of a package operation response.
#[derive(Debug, Clone, Default)]
pub struct PackageResult {
    pub execution_id: String,
    pub success: bool,
    pub cancelled: bool,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: i64,
    pub error_code: Option<i64>,
    pub message: Option<String>,
    pub installed_packages: Option<Vec<String>>,
    pub package_info: Option<serde_json::Map<String, Value>>,
    pub results: Option<Vec<String>>,
    pub installed: Option<bool>,
    pub version: Option<String>,
}

impl PackageResult {
    pub fn from_response(response: &Response) -> Self {
        Self {
            execution_id: response.execution_id.clone().unwrap_or_default(),
            success: response.status == "success",
            cancelled: response.status == "cancelled",
            stdout: response.stdout.clone().unwrap_or_default(),
            stderr: response.stderr.clone().unwrap_or_default(),
            execution_time_ms: response.execution_time.unwrap_or(0),
            error_code: response.error_code,
            message: response.message.clone(),
            installed_packages: response.installed_packages.clone(),
            package_info: response.package_info.clone(),
            results: response.results.clone(),
            installed: response.installed,
            version: response.version.clone(),
        }
    }
}

/// Build the script-completion payload from a terminal response.
pub fn script_result_from(response: &Response) -> PythonResult {
    PythonResult {
        execution_id: response.execution_id.clone().unwrap_or_default(),
        success: response.status == "success",
        cancelled: response.status == "cancelled",
        stdout: response.stdout.clone().unwrap_or_default(),
        stderr: response.stderr.clone().unwrap_or_default(),
        execution_time_ms: response.execution_time.unwrap_or(0),
        error_code: response.error_code,
        message: response.message.clone(),
        results: None,
    }
}

/// Asynchronous client for the broker endpoint.
///
/// Submission methods are non-blocking and return whether the command was
/// accepted for sending; results arrive on the event stream.
pub struct PythonClient {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
    connected: Arc<AtomicBool>,
}

impl PythonClient {
    /// Create the client and its event stream. The connection task starts
    /// immediately and keeps reconnecting until [`PythonClient::shutdown`].
    pub fn new(socket_path: PathBuf) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(connection_task(
            socket_path,
            command_rx,
            event_tx,
            Arc::clone(&connected),
            shutdown_rx,
        ));

        (
            Self {
                command_tx,
                shutdown_tx,
                connected,
            },
            event_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Poll for a live connection for up to ~20 seconds.
    pub async fn wait_for_server_ready(&self) -> bool {
        tracing::debug!("Waiting for server to be ready ({:?})", READY_TIMEOUT);
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            sleep(Duration::from_millis(500)).await;
        }
        tracing::warn!("Server is not ready after {:?}", READY_TIMEOUT);
        self.is_connected()
    }

    /// Stop reconnecting and close the connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    /// Submit a script for execution. Arguments become `sys.argv[1..]` of
    /// the script, each scalar rendered as its JSON text. A non-positive
    /// timeout disables the deadline.
    pub fn run_script(
        &self,
        execution_id: &str,
        script: &str,
        arguments: Vec<Value>,
        timeout_ms: i64,
    ) -> bool {
        self.submit(Command::Execute {
            execution_id: execution_id.to_string(),
            script: script.to_string(),
            arguments,
            timeout: timeout_ms,
        })
    }

    pub fn check_syntax(&self, execution_id: &str, script: &str) -> bool {
        self.submit(Command::CheckSyntax {
            execution_id: execution_id.to_string(),
            script: script.to_string(),
        })
    }

    pub fn cancel(&self, execution_id: &str) -> bool {
        self.submit(Command::Cancel {
            execution_id: execution_id.to_string(),
        })
    }

    pub fn install_package(&self, execution_id: &str, package: &str) -> bool {
        self.submit(Command::InstallPackage {
            execution_id: execution_id.to_string(),
            package: package.to_string(),
        })
    }

    pub fn install_local_package(&self, execution_id: &str, package_path: &str) -> bool {
        self.submit(Command::InstallLocalPackage {
            execution_id: execution_id.to_string(),
            package_path: package_path.to_string(),
        })
    }

    pub fn reinstall_package(&self, execution_id: &str, package: &str) -> bool {
        self.submit(Command::ReinstallPackage {
            execution_id: execution_id.to_string(),
            package: package.to_string(),
        })
    }

    pub fn update_package(&self, execution_id: &str, package: &str) -> bool {
        self.submit(Command::UpdatePackage {
            execution_id: execution_id.to_string(),
            package: package.to_string(),
        })
    }

    pub fn update_local_package(&self, execution_id: &str, package_path: &str) -> bool {
        self.submit(Command::UpdateLocalPackage {
            execution_id: execution_id.to_string(),
            package_path: package_path.to_string(),
        })
    }

    pub fn uninstall_package(&self, execution_id: &str, package: &str) -> bool {
        self.submit(Command::UninstallPackage {
            execution_id: execution_id.to_string(),
            package: package.to_string(),
        })
    }

    pub fn is_package_installed(&self, execution_id: &str, package: &str) -> bool {
        self.submit(Command::IsPackageInstalled {
            execution_id: execution_id.to_string(),
            package: package.to_string(),
        })
    }

    /// Upgrade every installed package. Returns the generated execution id
    /// when the command was accepted.
    pub fn upgrade_all_packages(&self) -> Option<String> {
        let execution_id = Uuid::new_v4().to_string();
        self.submit(Command::UpgradeAllPackages {
            execution_id: execution_id.clone(),
        })
        .then_some(execution_id)
    }

    /// Search the package index. Returns the generated execution id when
    /// the command was accepted.
    pub fn search_package(&self, query: &str) -> Option<String> {
        let execution_id = Uuid::new_v4().to_string();
        self.submit(Command::SearchPackage {
            execution_id: execution_id.clone(),
            query: query.to_string(),
        })
        .then_some(execution_id)
    }

    pub fn get_package_info(&self, package: &str) -> Option<String> {
        let execution_id = Uuid::new_v4().to_string();
        self.submit(Command::GetPackageInfo {
            execution_id: execution_id.clone(),
            package: package.to_string(),
        })
        .then_some(execution_id)
    }

    pub fn get_package_version(&self, package: &str) -> Option<String> {
        let execution_id = Uuid::new_v4().to_string();
        self.submit(Command::GetPackageVersion {
            execution_id: execution_id.clone(),
            package: package.to_string(),
        })
        .then_some(execution_id)
    }

    pub fn list_installed_packages(&self) -> Option<String> {
        let execution_id = Uuid::new_v4().to_string();
        self.submit(Command::ListInstalledPackages {
            execution_id: execution_id.clone(),
        })
        .then_some(execution_id)
    }

    fn submit(&self, command: Command) -> bool {
        if !self.is_connected() {
            tracing::warn!("Not connected to the server; command not sent");
            return false;
        }
        self.command_tx.try_send(command).is_ok()
    }
}

/// Owns the socket: connect with a deadline, run the framed read/write
/// loop, reconnect after disconnects on a fixed interval.
async fn connection_task(
    socket_path: PathBuf,
    mut command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<ClientEvent>,
    connected: Arc<AtomicBool>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let key = SecretKey::derive();

    loop {
        let stream = tokio::select! {
            _ = shutdown_rx.recv() => return,
            res = timeout(CONNECT_TIMEOUT, UnixStream::connect(&socket_path)) => match res {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    tracing::debug!("Connect to {:?} failed: {}", socket_path, e);
                    None
                }
                Err(_) => {
                    tracing::warn!("Failed to connect to server within timeout");
                    None
                }
            },
        };

        let Some(stream) = stream else {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = sleep(RECONNECT_INTERVAL) => continue,
            }
        };

        tracing::info!("Connected to server");
        connected.store(true, Ordering::SeqCst);
        let _ = event_tx.send(ClientEvent::ConnectedToServer).await;

        let shutdown = run_connection(
            stream,
            &key,
            &mut command_rx,
            &event_tx,
            &mut shutdown_rx,
        )
        .await;

        connected.store(false, Ordering::SeqCst);
        tracing::warn!("Disconnected from server");
        let _ = event_tx.send(ClientEvent::DisconnectedFromServer).await;

        if shutdown {
            return;
        }

        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = sleep(RECONNECT_INTERVAL) => {}
        }
    }
}

/// Serve one live connection. Returns true when the client is shutting
/// down, false on connection loss (the caller reconnects).
async fn run_connection(
    stream: UnixStream,
    key: &SecretKey,
    command_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<ClientEvent>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> bool {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();
    let mut read_buf = [0u8; 8192];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return true,

            command = command_rx.recv() => {
                let Some(command) = command else {
                    // Client handle dropped; nothing more to send.
                    return true;
                };
                match protocol::seal(&command, key) {
                    Ok(frame) => {
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            tracing::error!("Failed to send command: {}", e);
                            return false;
                        }
                    }
                    Err(e) => tracing::error!("Failed to seal command: {}", e),
                }
            }

            res = reader.read(&mut read_buf) => {
                let n = match res {
                    Ok(0) => return false,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!("Connection error: {}", e);
                        return false;
                    }
                };
                decoder.extend(&read_buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Decoded::NeedMore => break,
                        Decoded::Fatal(reason) => {
                            tracing::warn!("Dropping connection: {}", reason);
                            return false;
                        }
                        Decoded::Frame(body) => {
                            demux_frame(&body, key, event_tx).await;
                        }
                    }
                }
            }
        }
    }
}

async fn write_frame(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    frame: &[u8],
) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Decrypt, parse, and demultiplex one response frame into a client event.
async fn demux_frame(body: &[u8], key: &SecretKey, event_tx: &mpsc::Sender<ClientEvent>) {
    let response: Response = match protocol::open(body, key) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Discarding undecodable response: {}", e);
            return;
        }
    };

    if response.update_event {
        let event = ClientEvent::PackageOperationProgress {
            operation: OperationKind::from_status(&response.status),
            stage: response.stage.clone().unwrap_or_default(),
            execution_id: response.execution_id.clone().unwrap_or_default(),
        };
        let _ = event_tx.send(event).await;
        return;
    }

    if response.is_script {
        let _ = event_tx
            .send(ClientEvent::ScriptExecutionFinished(script_result_from(
                &response,
            )))
            .await;
        return;
    }

    if response.is_terminal() {
        let _ = event_tx
            .send(ClientEvent::PackageOperationFinished(
                PackageResult::from_response(&response),
            ))
            .await;
        return;
    }

    tracing::debug!("Received intermediate status: {}", response.status);
}
