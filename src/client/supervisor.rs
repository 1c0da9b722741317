//! Broker process supervision - launch, verify, restart

use crate::protocol::crypto;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};

/// Expected SHA-256 of the broker executable (hex). Empty disables the
/// integrity check; debug builds skip it regardless.
const EXPECTED_SERVER_HASH: &str = "";

/// How long to wait for the endpoint to answer after a spawn.
const START_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace given to graceful termination, then again to the forced kill.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay before restarting a crashed broker.
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Out-of-band notifications about the broker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    ServerStarted,
    ServerStopped,
    ServerCrashed,
    HashMismatch,
}

/// Launches the broker executable and keeps it alive.
///
/// Cloneable; all clones share the same child handle and state.
#[derive(Clone)]
pub struct ServerSupervisor {
    executable: PathBuf,
    socket_path: PathBuf,
    events: mpsc::Sender<SupervisorEvent>,
    child: Arc<Mutex<Option<Child>>>,
    stopping: Arc<AtomicBool>,
}

impl ServerSupervisor {
    /// Create a supervisor for the broker at `executable`, listening on
    /// `socket_path`. Events arrive on the returned stream.
    pub fn new(
        executable: PathBuf,
        socket_path: PathBuf,
    ) -> (Self, mpsc::Receiver<SupervisorEvent>) {
        if !executable.exists() {
            tracing::error!("Broker executable not found at: {:?}", executable);
        }

        let (events, event_rx) = mpsc::channel(16);
        (
            Self {
                executable,
                socket_path,
                events,
                child: Arc::new(Mutex::new(None)),
                stopping: Arc::new(AtomicBool::new(false)),
            },
            event_rx,
        )
    }

    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Start the broker process. A no-op when it is already running; a hash
    /// mismatch emits `HashMismatch` and does not start anything.
    ///
    /// Written as a boxed future (rather than `async fn`) because it is
    /// mutually recursive with `monitor`; an opaque `impl Future` here
    /// would make the pair's `Send`-ness unresolvable at compile time.
    pub fn start_server(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.is_running().await {
                tracing::debug!("Server is already running");
                return Ok(());
            }

            if !verify_hash(&self.executable).await? {
                tracing::error!("Broker executable hash mismatch");
                let _ = self.events.send(SupervisorEvent::HashMismatch).await;
                return Ok(());
            }

            self.kill_stale_servers().await;
            self.stopping.store(false, Ordering::SeqCst);

            let child = Command::new(&self.executable)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .context("Failed to start the server process")?;

            *self.child.lock().await = Some(child);

            if wait_for_endpoint(&self.socket_path, START_TIMEOUT).await {
                tracing::info!("Server started successfully");
                let _ = self.events.send(SupervisorEvent::ServerStarted).await;
            } else {
                tracing::warn!("Server did not open its endpoint within {:?}", START_TIMEOUT);
            }

            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.monitor().await });
            Ok(())
        })
    }

    /// Gracefully stop the broker, escalating to a forced kill.
    pub async fn stop_server(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        let Some(mut child) = self.child.lock().await.take() else {
            tracing::debug!("Server process is not running");
            return;
        };

        tracing::debug!("Stopping the server process");
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on the child's pid.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        if timeout(STOP_TIMEOUT, child.wait()).await.is_err() {
            tracing::warn!("Terminate failed, killing the server process");
            let _ = child.start_kill();
            if timeout(STOP_TIMEOUT, child.wait()).await.is_err() {
                tracing::error!("Failed to kill the server process. It may still be running.");
                return;
            }
        }

        tracing::debug!("Server process stopped");
        let _ = self.events.send(SupervisorEvent::ServerStopped).await;
    }

    /// Watch for child exit; an unexpected exit emits `ServerCrashed` and
    /// arms the one-shot restart.
    async fn monitor(self) {
        loop {
            sleep(Duration::from_millis(500)).await;

            let exited = {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    // stop_server took the child; nothing left to watch.
                    None => return,
                    Some(child) => match child.try_wait() {
                        Ok(None) => false,
                        Ok(Some(_)) | Err(_) => {
                            guard.take();
                            true
                        }
                    },
                }
            };

            if exited {
                if self.stopping.load(Ordering::SeqCst) {
                    return;
                }
                tracing::warn!("Server process crashed or stopped unexpectedly");
                let _ = self.events.send(SupervisorEvent::ServerCrashed).await;

                sleep(RESTART_DELAY).await;
                tracing::info!("Restarting the server process");
                if let Err(e) = self.start_server().await {
                    tracing::error!("Restart failed: {}", e);
                }
                // start_server spawned a fresh monitor.
                return;
            }
        }
    }

    /// Terminate leftover broker processes from a previous host run. The
    /// match is on the full executable path to avoid collateral kills.
    async fn kill_stale_servers(&self) {
        let pattern = self.executable.to_string_lossy().into_owned();
        let output = Command::new("pgrep")
            .arg("-f")
            .arg(&pattern)
            .output()
            .await;

        let Ok(output) = output else {
            tracing::debug!("pgrep unavailable; skipping stale-server cleanup");
            return;
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Ok(pid) = line.trim().parse::<i32>() {
                tracing::info!("Killing stale server process {}", pid);
                // SAFETY: plain kill(2) on a pid read from pgrep.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
    }
}

/// Compare the executable's SHA-256 to the compiled-in hash. Skipped in
/// debug builds and when no hash was compiled in; hashing runs off the
/// event loop.
async fn verify_hash(path: &Path) -> Result<bool> {
    if cfg!(debug_assertions) || EXPECTED_SERVER_HASH.is_empty() {
        return Ok(true);
    }

    let path = path.to_path_buf();
    let computed = tokio::task::spawn_blocking(move || crypto::sha256_file(&path))
        .await
        .context("Hash task failed")?
        .context("Failed to open file for hash verification")?;

    tracing::debug!("Computed broker hash: {}", computed);
    Ok(computed == EXPECTED_SERVER_HASH)
}

/// Poll until the endpoint accepts a connection or the deadline passes.
async fn wait_for_endpoint(socket_path: &Path, deadline: Duration) -> bool {
    let until = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < until {
        if tokio::net::UnixStream::connect(socket_path).await.is_ok() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}
