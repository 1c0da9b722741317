//! Package operations - pip children, progress inference, direct uninstall

use super::{EngineEvent, PythonEnv, PythonResult};
use crate::protocol::OperationKind;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const KILL_GRACE: Duration = Duration::from_secs(1);

/// Drives pip children for package operations and streams their output as
/// progress events.
pub struct PackageManager {
    env: Arc<PythonEnv>,
    events: mpsc::Sender<EngineEvent>,
    /// Package-mutating operations are serialized against the site directory
    site_lock: Mutex<()>,
}

impl PackageManager {
    pub fn new(env: Arc<PythonEnv>, events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            env,
            events,
            site_lock: Mutex::new(()),
        }
    }

    /// Run one package operation to completion and emit its terminal event.
    /// Exactly one `PackageFinished` follows any number of progress events.
    pub async fn run_operation(
        &self,
        execution_id: &str,
        kind: OperationKind,
        identifier: &str,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let result = match kind {
            OperationKind::Install => self.install(execution_id, identifier, &mut cancel).await,
            OperationKind::Reinstall => self.reinstall(execution_id, identifier, &mut cancel).await,
            OperationKind::Update => self.update(execution_id, identifier, &mut cancel).await,
            OperationKind::InstallLocal => {
                self.install_local(execution_id, identifier, false, &mut cancel).await
            }
            OperationKind::UpdateLocal => {
                self.install_local(execution_id, identifier, true, &mut cancel).await
            }
            OperationKind::Uninstall => self.uninstall(execution_id, identifier).await,
            OperationKind::UpgradeAll => self.upgrade_all(execution_id, &mut cancel).await,
            OperationKind::Search => self.search(execution_id, identifier, &mut cancel).await,
            OperationKind::Script | OperationKind::SyntaxCheck => PythonResult {
                execution_id: execution_id.to_string(),
                stderr: "Not a package operation.".to_string(),
                ..Default::default()
            },
        };

        let _ = self
            .events
            .send(EngineEvent::PackageFinished {
                execution_id: execution_id.to_string(),
                kind,
                result,
            })
            .await;
    }

    async fn install(
        &self,
        execution_id: &str,
        package: &str,
        cancel: &mut oneshot::Receiver<()>,
    ) -> PythonResult {
        let _guard = self.site_lock.lock().await;
        if let Err(err) = self.env.verify_executable().await {
            return self.failure(execution_id, err);
        }

        if self.env.is_package_installed(package) {
            tracing::info!("Package '{package}' is already installed");
            let note = format!("Package '{package}' is already installed.");
            return PythonResult {
                execution_id: execution_id.to_string(),
                success: true,
                stdout: note.clone(),
                message: Some(note),
                ..Default::default()
            };
        }

        let args = self.pip_install_args(package, &[]);
        self.run_pip(execution_id, OperationKind::Install, args, cancel)
            .await
    }

    async fn reinstall(
        &self,
        execution_id: &str,
        package: &str,
        cancel: &mut oneshot::Receiver<()>,
    ) -> PythonResult {
        let _guard = self.site_lock.lock().await;
        if let Err(err) = self.env.verify_executable().await {
            return self.failure(execution_id, err);
        }

        let args = self.pip_install_args(package, &["--force-reinstall"]);
        self.run_pip(execution_id, OperationKind::Reinstall, args, cancel)
            .await
    }

    async fn update(
        &self,
        execution_id: &str,
        package: &str,
        cancel: &mut oneshot::Receiver<()>,
    ) -> PythonResult {
        let _guard = self.site_lock.lock().await;
        if let Err(err) = self.env.verify_executable().await {
            return self.failure(execution_id, err);
        }

        if !self.env.is_package_installed(package) {
            let note = format!("Package '{package}' is not installed; cannot update.");
            return PythonResult {
                execution_id: execution_id.to_string(),
                stderr: note.clone(),
                message: Some(note),
                ..Default::default()
            };
        }

        let args = self.pip_install_args(package, &["--upgrade"]);
        self.run_pip(execution_id, OperationKind::Update, args, cancel)
            .await
    }

    /// Install or upgrade a package from a local directory.
    async fn install_local(
        &self,
        execution_id: &str,
        package_path: &str,
        upgrade: bool,
        cancel: &mut oneshot::Receiver<()>,
    ) -> PythonResult {
        let kind = if upgrade {
            OperationKind::UpdateLocal
        } else {
            OperationKind::InstallLocal
        };

        if !Path::new(package_path).is_dir() {
            let note =
                format!("Package path does not exist or is not a directory: {package_path}");
            return PythonResult {
                execution_id: execution_id.to_string(),
                stderr: note.clone(),
                message: Some(note),
                ..Default::default()
            };
        }

        let _guard = self.site_lock.lock().await;
        if let Err(err) = self.env.verify_executable().await {
            return self.failure(execution_id, err);
        }

        let extra: &[&str] = if upgrade { &["--upgrade"] } else { &[] };
        let args = self.pip_install_args(package_path, extra);
        self.run_pip(execution_id, kind, args, cancel).await
    }

    /// Uninstall is implemented directly on the filesystem: remove the
    /// package directory and its metadata under the site directory. Success
    /// means the package is absent afterwards, whether or not anything was
    /// deleted.
    async fn uninstall(&self, execution_id: &str, package: &str) -> PythonResult {
        let started = Instant::now();
        let _guard = self.site_lock.lock().await;

        self.send_progress(
            execution_id,
            OperationKind::Uninstall,
            format!("Removing files for '{package}'..."),
        )
        .await;

        let mut result = PythonResult {
            execution_id: execution_id.to_string(),
            ..Default::default()
        };

        match self.env.remove_package(package) {
            Ok(removed) => {
                for path in &removed {
                    tracing::debug!("Removed {:?}", path);
                }
                if self.env.is_package_installed(package) {
                    result.stderr =
                        format!("Package '{package}' is still present after uninstall.");
                } else {
                    result.success = true;
                    result.stdout = format!("Uninstalled package: {package}\n");
                }
            }
            Err(err) => {
                result.stderr = format!("Failed to uninstall '{package}': {err}");
            }
        }

        result.execution_time_ms = started.elapsed().as_millis() as i64;
        result
    }

    /// Upgrade every installed package, one pip run per entry, under a
    /// single hold of the site lock. The aggregate terminal reports success
    /// only when every entry succeeded and nothing was cancelled.
    async fn upgrade_all(
        &self,
        execution_id: &str,
        cancel: &mut oneshot::Receiver<()>,
    ) -> PythonResult {
        let started = Instant::now();
        let _guard = self.site_lock.lock().await;
        if let Err(err) = self.env.verify_executable().await {
            return self.failure(execution_id, err);
        }

        let packages = self.env.list_installed_packages();
        let total = packages.len();
        let mut processed = 0usize;
        let mut had_error = false;

        let mut aggregate = PythonResult {
            execution_id: execution_id.to_string(),
            ..Default::default()
        };

        for (index, package) in packages.iter().enumerate() {
            self.send_progress(
                execution_id,
                OperationKind::UpgradeAll,
                format!("Upgrading '{}' ({}/{})...", package, index + 1, total),
            )
            .await;

            let args = self.pip_install_args(package, &["--upgrade"]);
            let result = self
                .run_pip(execution_id, OperationKind::UpgradeAll, args, cancel)
                .await;

            aggregate.stdout.push_str(&result.stdout);
            aggregate.stderr.push_str(&result.stderr);
            processed += 1;

            if result.cancelled {
                aggregate.cancelled = true;
                break;
            }
            if !result.success {
                had_error = true;
            }
        }

        aggregate.success = !had_error && !aggregate.cancelled;
        aggregate.message = Some(format!("Processed {processed}/{total} packages."));
        aggregate.execution_time_ms = started.elapsed().as_millis() as i64;
        aggregate
    }

    /// Best-effort `pip search`; the public index has rejected the command
    /// for years, so a failing child simply yields a terminal error.
    async fn search(
        &self,
        execution_id: &str,
        query: &str,
        cancel: &mut oneshot::Receiver<()>,
    ) -> PythonResult {
        let args = vec![
            "-m".to_string(),
            "pip".to_string(),
            "search".to_string(),
            query.to_string(),
        ];
        let mut result = self
            .run_pip(execution_id, OperationKind::Search, args, cancel)
            .await;

        if result.success {
            result.results = Some(parse_search_results(&result.stdout));
        }
        result
    }

    /// `-m pip install [extra..] <target> --no-cache-dir --target <site>`
    fn pip_install_args(&self, target: &str, extra: &[&str]) -> Vec<String> {
        let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
        args.extend(extra.iter().map(|flag| flag.to_string()));
        args.push(target.to_string());
        args.push("--no-cache-dir".to_string());
        args.push("--target".to_string());
        args.push(self.env.site_packages().to_string_lossy().into_owned());
        args
    }

    /// Spawn a pip child, stream its output as progress, and harvest the
    /// terminal result. Cancellation kills the child and waits up to one
    /// second for the reap.
    async fn run_pip(
        &self,
        execution_id: &str,
        kind: OperationKind,
        args: Vec<String>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> PythonResult {
        let started = Instant::now();

        let mut cmd = self.env.command();
        cmd.args(&args).stdout(Stdio::piped()).stderr(Stdio::piped());
        tracing::debug!("Running pip with {:?}", args);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!("Failed to spawn pip for {execution_id}: {err}");
                return PythonResult {
                    execution_id: execution_id.to_string(),
                    stderr: format!("{err} Process error occurred."),
                    execution_time_ms: started.elapsed().as_millis() as i64,
                    ..Default::default()
                };
            }
        };

        let stdout_task =
            self.stream_output(child.stdout.take(), execution_id, kind, false);
        let stderr_task =
            self.stream_output(child.stderr.take(), execution_id, kind, true);

        let wait_result = tokio::select! {
            res = child.wait() => Some(res),
            _ = &mut *cancel => None,
        };

        if wait_result.is_none() {
            let _ = child.start_kill();
            let _ = timeout(KILL_GRACE, child.wait()).await;
        }

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let mut result = PythonResult {
            execution_id: execution_id.to_string(),
            stdout,
            stderr,
            ..Default::default()
        };

        match wait_result {
            Some(Ok(status)) => {
                result.success = status.success();
                result.error_code = status.code().filter(|code| *code != 0).map(i64::from);
            }
            Some(Err(err)) => {
                result.stderr.push_str(&format!("{err} Process error occurred."));
            }
            None => {
                tracing::info!("Package operation {execution_id} cancelled");
                result.cancelled = true;
                result.stderr.push_str("Execution canceled by user.");
            }
        }

        result.execution_time_ms = started.elapsed().as_millis() as i64;
        result
    }

    /// Accumulate one child pipe while forwarding classified lines as
    /// progress events. Stderr lines are forwarded verbatim.
    fn stream_output<R>(
        &self,
        pipe: Option<R>,
        execution_id: &str,
        kind: OperationKind,
        from_stderr: bool,
    ) -> tokio::task::JoinHandle<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        let execution_id = execution_id.to_string();

        tokio::spawn(async move {
            let Some(pipe) = pipe else {
                return String::new();
            };
            let mut collected = String::new();
            let mut lines = BufReader::new(pipe).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');

                let stage = if from_stderr {
                    let trimmed = line.trim();
                    (!trimmed.is_empty()).then(|| trimmed.to_string())
                } else {
                    classify_stdout_line(&line)
                };

                if let Some(stage) = stage {
                    let _ = events
                        .send(EngineEvent::Progress {
                            execution_id: execution_id.clone(),
                            kind,
                            stage,
                        })
                        .await;
                }
            }
            collected
        })
    }

    async fn send_progress(&self, execution_id: &str, kind: OperationKind, stage: String) {
        let _ = self
            .events
            .send(EngineEvent::Progress {
                execution_id: execution_id.to_string(),
                kind,
                stage,
            })
            .await;
    }

    fn failure(&self, execution_id: &str, err: anyhow::Error) -> PythonResult {
        tracing::warn!("Package operation {execution_id} failed: {err:#}");
        PythonResult {
            execution_id: execution_id.to_string(),
            stderr: format!("{err:#}"),
            ..Default::default()
        }
    }
}

/// Map a pip stdout line to its progress stage by leading token;
/// unrecognized non-empty lines are forwarded verbatim.
fn classify_stdout_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("Collecting") {
        return Some("Collecting package information...".to_string());
    }
    if trimmed.starts_with("Downloading") {
        return Some("Downloading package...".to_string());
    }
    if trimmed.starts_with("Installing") {
        return Some("Installing package...".to_string());
    }
    Some(trimmed.to_string())
}

/// Extract package names from `pip search` output; result lines look like
/// `name (version) - description`, continuations are indented.
fn parse_search_results(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter_map(|line| {
            let token = line.split_whitespace().next()?;
            let name = token.split('(').next().unwrap_or(token);
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}
