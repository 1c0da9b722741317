//! Broker server - endpoint ownership, connection management, event fan-out

pub mod connection;
mod dispatcher;
pub mod registry;

pub use connection::ClientConnection;
pub use registry::{ExecutionRecord, ExecutionRegistry};

use crate::protocol::{self, crypto, crypto::SecretKey, Decoded, FrameDecoder, Response};
use crate::python::{EngineEvent, PackageManager, PythonEnv, ScriptRunner};
use anyhow::{anyhow, Context, Result};
use connection::{client_writer_task, SEND_QUEUE_DEPTH};
use dispatcher::Dispatcher;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub(crate) type SharedState = Arc<RwLock<ServerState>>;

/// Server state shared across connections
pub(crate) struct ServerState {
    pub(crate) clients: HashMap<Uuid, ClientConnection>,
    pub(crate) registry: ExecutionRegistry,
}

impl ServerState {
    /// Deliver a response to one client; a failed send closes it.
    pub(crate) async fn send_to(state: &SharedState, client_id: Uuid, response: Response) {
        let failed = {
            let guard = state.read().await;
            match guard.clients.get(&client_id) {
                Some(client) => client.send(response).is_err(),
                None => {
                    tracing::debug!("Dropping response for departed client {client_id}");
                    false
                }
            }
        };
        if failed {
            tracing::warn!("Client {client_id} is not keeping up, disconnecting it");
            state.write().await.clients.remove(&client_id);
        }
    }

    /// Deliver a response to every connected client; failed sends close
    /// the affected connections.
    pub(crate) async fn broadcast(state: &SharedState, response: Response) {
        let mut dead = Vec::new();
        {
            let guard = state.read().await;
            for client in guard.clients.values() {
                if client.send(response.clone()).is_err() {
                    dead.push(client.id());
                }
            }
        }
        if !dead.is_empty() {
            let mut guard = state.write().await;
            for client_id in dead {
                tracing::warn!("Client {client_id} is not keeping up, disconnecting it");
                guard.clients.remove(&client_id);
            }
        }
    }
}

/// The broker's listening endpoint and serve loop.
pub struct BrokerServer {
    socket_path: PathBuf,
    env: Arc<PythonEnv>,
}

impl BrokerServer {
    pub fn new(socket_path: PathBuf, env: Arc<PythonEnv>) -> Self {
        Self { socket_path, env }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run the broker until the shutdown channel fires.
    ///
    /// A stale socket left by a dead broker is removed; a live broker on the
    /// same endpoint makes startup fail fast.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.socket_path.exists() {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => {
                    return Err(anyhow!(
                        "A broker is already listening on {:?}",
                        self.socket_path
                    ));
                }
                Err(_) => {
                    tracing::info!("Removing stale socket: {:?}", self.socket_path);
                    std::fs::remove_file(&self.socket_path)?;
                }
            }
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Unable to listen on {:?}", self.socket_path))?;
        tracing::info!("Broker listening on {:?}", self.socket_path);

        let key = SecretKey::derive();
        tracing::debug!("Endpoint name: {}", crypto::endpoint_name());

        let (event_tx, mut event_rx) = mpsc::channel::<EngineEvent>(256);

        let state: SharedState = Arc::new(RwLock::new(ServerState {
            clients: HashMap::new(),
            registry: ExecutionRegistry::new(),
        }));

        let runner = Arc::new(ScriptRunner::new(Arc::clone(&self.env)));
        let packages = Arc::new(PackageManager::new(Arc::clone(&self.env), event_tx.clone()));
        let dispatcher = Dispatcher::new(
            Arc::clone(&state),
            runner,
            packages,
            Arc::clone(&self.env),
            event_tx,
        );

        // Supervisor events (progress, terminals) fan out from here.
        let event_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                handle_engine_event(event, &event_state).await;
            }
            tracing::debug!("Engine event loop finished");
        });

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&state);
                            let dispatcher = dispatcher.clone();
                            let key = key.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, state, dispatcher, key).await {
                                    tracing::error!("Client error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        self.cleanup(&state).await;
        Ok(())
    }

    async fn cleanup(&self, state: &SharedState) {
        tracing::info!("Cleaning up broker resources");

        // Dropping the senders ends each client's writer task.
        state.write().await.clients.clear();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::error!("Failed to remove socket file: {}", e);
            }
        }
    }
}

/// Handle a single client connection: framed reads feed the dispatcher,
/// a writer task drains the outbound queue.
async fn handle_client(
    stream: UnixStream,
    state: SharedState,
    dispatcher: Dispatcher,
    key: SecretKey,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();

    let (tx, rx) = mpsc::channel::<Response>(SEND_QUEUE_DEPTH);
    let client = ClientConnection::new(tx);
    let client_id = client.id();

    tracing::info!("Client connected: {}", client_id);
    state.write().await.clients.insert(client_id, client);

    let writer_handle = tokio::spawn(client_writer_task(writer, rx, key.clone()));

    let mut decoder = FrameDecoder::new();
    let mut read_buf = [0u8; 8192];

    'read: loop {
        let n = match reader.read(&mut read_buf).await {
            Ok(0) => {
                tracing::info!("Client disconnected: {}", client_id);
                break 'read;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Error reading from client {}: {}", client_id, e);
                break 'read;
            }
        };

        decoder.extend(&read_buf[..n]);

        loop {
            match decoder.next_frame() {
                Decoded::NeedMore => break,
                Decoded::Fatal(reason) => {
                    tracing::warn!("Disconnecting client {}: {}", client_id, reason);
                    break 'read;
                }
                Decoded::Frame(body) => {
                    handle_frame(&body, &key, client_id, &state, &dispatcher).await;
                }
            }
        }
    }

    // Cleanup: drop the connection record; its buffer dies with the decoder.
    state.write().await.clients.remove(&client_id);
    writer_handle.abort();

    tracing::debug!("Client handler finished: {}", client_id);
    Ok(())
}

/// Decrypt and parse one frame body, then dispatch it. Recoverable frame
/// errors answer the sender and processing continues.
async fn handle_frame(
    body: &[u8],
    key: &SecretKey,
    client_id: Uuid,
    state: &SharedState,
    dispatcher: &Dispatcher,
) {
    use crate::protocol::ProtocolError;

    match protocol::open_value(body, key) {
        Ok(value) => dispatcher.dispatch(value, client_id).await,
        Err(ProtocolError::TruncatedCiphertext) => {
            ServerState::send_to(
                state,
                client_id,
                Response::error("Encrypted data is too short.", None),
            )
            .await;
        }
        Err(ProtocolError::DecryptFailed) => {
            ServerState::send_to(state, client_id, Response::error("Decryption failed.", None))
                .await;
        }
        Err(err) => {
            ServerState::send_to(
                state,
                client_id,
                Response::error(format!("JSON parse error: {err}"), None),
            )
            .await;
        }
    }
}

/// Translate supervisor events into wire responses.
///
/// Progress is broadcast to every client (each one filters by the ids it
/// owns); script terminals go to the owning connection; package terminals
/// are broadcast like the progress stream that preceded them.
async fn handle_engine_event(event: EngineEvent, state: &SharedState) {
    match event {
        EngineEvent::Progress {
            execution_id,
            kind,
            stage,
        } => {
            let response = Response::progress(&execution_id, kind, stage);
            ServerState::broadcast(state, response).await;
        }

        EngineEvent::ScriptFinished {
            execution_id,
            result,
        } => {
            let record = state.write().await.registry.remove(&execution_id);

            let mut response = Response {
                status: result.status().to_string(),
                execution_id: Some(execution_id.clone()),
                is_script: true,
                stdout: Some(result.stdout),
                stderr: Some(result.stderr),
                execution_time: Some(result.execution_time_ms),
                error_code: result.error_code,
                ..Default::default()
            };
            response.message = result.message;

            match record {
                Some(record) => {
                    ServerState::send_to(state, record.client_id(), response).await;
                }
                None => {
                    tracing::debug!(
                        "No record for finished script {execution_id}; dropping terminal"
                    );
                }
            }
        }

        EngineEvent::PackageFinished {
            execution_id,
            kind,
            result,
        } => {
            state.write().await.registry.remove(&execution_id);
            tracing::debug!(
                "Package operation {:?} for {} finished: {}",
                kind,
                execution_id,
                result.status()
            );

            let response = Response {
                status: result.status().to_string(),
                execution_id: Some(execution_id),
                stdout: Some(result.stdout),
                stderr: Some(result.stderr),
                execution_time: Some(result.execution_time_ms),
                error_code: result.error_code,
                message: result.message,
                results: result.results,
                ..Default::default()
            };
            ServerState::broadcast(state, response).await;
        }
    }
}
