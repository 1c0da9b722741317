//! Command validation and routing

use super::{ServerState, SharedState};
use crate::protocol::{Command, OperationKind, Response, COMMAND_NAMES};
use crate::python::{EngineEvent, PackageManager, PythonEnv, ScriptRunner};
use crate::server::registry::ExecutionRecord;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Routes decoded command objects to their handlers.
///
/// Validation failures answer immediately and never create registry
/// entries; accepted long-running commands answer `started` and hand the
/// work to the python supervision layer.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    state: SharedState,
    runner: Arc<ScriptRunner>,
    packages: Arc<PackageManager>,
    env: Arc<PythonEnv>,
    events: mpsc::Sender<EngineEvent>,
}

impl Dispatcher {
    pub(crate) fn new(
        state: SharedState,
        runner: Arc<ScriptRunner>,
        packages: Arc<PackageManager>,
        env: Arc<PythonEnv>,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            state,
            runner,
            packages,
            env,
            events,
        }
    }

    /// Validate and route one decrypted command object.
    pub(crate) async fn dispatch(&self, value: Value, client_id: Uuid) {
        if !value.is_object() {
            self.send_error(client_id, "Received JSON is not an object.", None)
                .await;
            return;
        }

        let command_name = value
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if command_name.is_empty() {
            self.send_error(client_id, "Command is missing.", None).await;
            return;
        }

        if !COMMAND_NAMES.contains(&command_name.as_str()) {
            self.send_error(client_id, "Unknown command.", None).await;
            return;
        }

        let command: Command = match serde_json::from_value(value) {
            Ok(command) => command,
            Err(err) => {
                self.send_error(
                    client_id,
                    format!("Malformed '{command_name}' command: {err}"),
                    None,
                )
                .await;
                return;
            }
        };

        match command {
            Command::Execute {
                execution_id,
                script,
                arguments,
                timeout,
            } => {
                self.handle_execute(client_id, execution_id, script, arguments, timeout)
                    .await
            }
            Command::CheckSyntax {
                execution_id,
                script,
            } => self.handle_check_syntax(client_id, execution_id, script).await,
            Command::Cancel { execution_id } => {
                self.handle_cancel(client_id, execution_id).await
            }
            Command::InstallPackage {
                execution_id,
                package,
            } => {
                self.handle_package_op(
                    client_id,
                    execution_id,
                    OperationKind::Install,
                    package,
                    "Package name is empty.",
                    |p| format!("Installation of package '{p}' started."),
                )
                .await
            }
            Command::ReinstallPackage {
                execution_id,
                package,
            } => {
                self.handle_package_op(
                    client_id,
                    execution_id,
                    OperationKind::Reinstall,
                    package,
                    "Package name is empty.",
                    |p| format!("Reinstallation of package '{p}' started."),
                )
                .await
            }
            Command::UpdatePackage {
                execution_id,
                package,
            } => {
                self.handle_package_op(
                    client_id,
                    execution_id,
                    OperationKind::Update,
                    package,
                    "Package name is empty.",
                    |p| format!("Update of package '{p}' started."),
                )
                .await
            }
            Command::InstallLocalPackage {
                execution_id,
                package_path,
            } => {
                self.handle_package_op(
                    client_id,
                    execution_id,
                    OperationKind::InstallLocal,
                    package_path,
                    "Package path is empty.",
                    |p| format!("Installation of local package from '{p}' started."),
                )
                .await
            }
            Command::UpdateLocalPackage {
                execution_id,
                package_path,
            } => {
                self.handle_package_op(
                    client_id,
                    execution_id,
                    OperationKind::UpdateLocal,
                    package_path,
                    "Package path is empty.",
                    |p| format!("Update of local package '{p}' started."),
                )
                .await
            }
            Command::UninstallPackage {
                execution_id,
                package,
            } => {
                self.handle_package_op(
                    client_id,
                    execution_id,
                    OperationKind::Uninstall,
                    package,
                    "Package name is empty.",
                    |p| format!("Uninstallation of package '{p}' started."),
                )
                .await
            }
            Command::UpgradeAllPackages { execution_id } => {
                self.handle_package_op(
                    client_id,
                    execution_id,
                    OperationKind::UpgradeAll,
                    String::new(),
                    "",
                    |_| "Upgrade of all packages started.".to_string(),
                )
                .await
            }
            Command::SearchPackage {
                execution_id,
                query,
            } => {
                self.handle_package_op(
                    client_id,
                    execution_id,
                    OperationKind::Search,
                    query,
                    "Search query is empty.",
                    |q| format!("Search for '{q}' started."),
                )
                .await
            }
            Command::GetPackageInfo {
                execution_id,
                package,
            } => self.handle_package_info(client_id, execution_id, package).await,
            Command::ListInstalledPackages { execution_id } => {
                self.handle_list_installed(client_id, execution_id).await
            }
            Command::IsPackageInstalled {
                execution_id,
                package,
            } => self.handle_is_installed(client_id, execution_id, package).await,
            Command::GetPackageVersion {
                execution_id,
                package,
            } => self.handle_get_version(client_id, execution_id, package).await,
        }
    }

    async fn handle_execute(
        &self,
        client_id: Uuid,
        execution_id: String,
        script: String,
        arguments: Vec<Value>,
        timeout: i64,
    ) {
        if script.is_empty() {
            self.send_error(client_id, "Script is empty.", non_empty(&execution_id))
                .await;
            return;
        }
        let Some((execution_id, cancel_rx)) = self
            .register(client_id, execution_id, OperationKind::Script)
            .await
        else {
            return;
        };

        self.send(
            client_id,
            Response::started(&execution_id, "Script execution started."),
        )
        .await;

        let runner = Arc::clone(&self.runner);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = runner
                .run_script(&execution_id, &script, &arguments, timeout, cancel_rx)
                .await;
            let _ = events
                .send(EngineEvent::ScriptFinished {
                    execution_id,
                    result,
                })
                .await;
        });
    }

    async fn handle_check_syntax(&self, client_id: Uuid, execution_id: String, script: String) {
        if script.is_empty() {
            self.send_error(client_id, "Script is empty.", non_empty(&execution_id))
                .await;
            return;
        }
        let Some((execution_id, cancel_rx)) = self
            .register(client_id, execution_id, OperationKind::SyntaxCheck)
            .await
        else {
            return;
        };

        self.send(
            client_id,
            Response::started(&execution_id, "Syntax check started."),
        )
        .await;

        let runner = Arc::clone(&self.runner);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = runner.check_syntax(&execution_id, &script, cancel_rx).await;
            let _ = events
                .send(EngineEvent::ScriptFinished {
                    execution_id,
                    result,
                })
                .await;
        });
    }

    async fn handle_cancel(&self, client_id: Uuid, execution_id: String) {
        if execution_id.is_empty() {
            self.send_error(client_id, "Execution ID is empty.", None).await;
            return;
        }

        let found = {
            let mut state = self.state.write().await;
            state.registry.cancel(&execution_id)
        };

        if !found {
            self.send_error(
                client_id,
                format!("No running execution with ID '{execution_id}'."),
                Some(execution_id),
            )
            .await;
        }
        // The supervised task emits the single cancelled terminal event.
    }

    /// Shared accept path for every asynchronous package operation.
    async fn handle_package_op(
        &self,
        client_id: Uuid,
        execution_id: String,
        kind: OperationKind,
        identifier: String,
        empty_identifier_error: &str,
        started_message: impl Fn(&str) -> String,
    ) {
        // UpgradeAll is the one package command without an identifier.
        if identifier.is_empty() && kind != OperationKind::UpgradeAll {
            self.send_error(client_id, empty_identifier_error, non_empty(&execution_id))
                .await;
            return;
        }
        let Some((execution_id, cancel_rx)) =
            self.register(client_id, execution_id, kind).await
        else {
            return;
        };

        self.send(
            client_id,
            Response::started(&execution_id, started_message(&identifier)),
        )
        .await;

        let packages = Arc::clone(&self.packages);
        tokio::spawn(async move {
            packages
                .run_operation(&execution_id, kind, &identifier, cancel_rx)
                .await;
        });
    }

    async fn handle_list_installed(&self, client_id: Uuid, execution_id: String) {
        if execution_id.is_empty() {
            self.send_error(client_id, "Execution ID is empty.", None).await;
            return;
        }

        let mut response = Response::success(&execution_id);
        response.installed_packages = Some(self.env.list_installed_packages());
        self.send(client_id, response).await;
    }

    async fn handle_package_info(&self, client_id: Uuid, execution_id: String, package: String) {
        if package.is_empty() {
            self.send_error(client_id, "Package name is empty.", non_empty(&execution_id))
                .await;
            return;
        }
        if execution_id.is_empty() {
            self.send_error(client_id, "Execution ID is empty.", None).await;
            return;
        }

        // The lookup runs a pip child; resolve it off the read loop so other
        // commands on this connection are not stalled behind it.
        let env = Arc::clone(&self.env);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let response = match env.package_info(&package).await {
                Ok(info) => {
                    let mut response = Response::success(&execution_id);
                    response.package_info = Some(info);
                    response
                }
                Err(err) => {
                    tracing::debug!("pip show for '{package}' failed: {err:#}");
                    Response::error(
                        format!("Failed to retrieve information for package '{package}'."),
                        Some(execution_id),
                    )
                }
            };
            ServerState::send_to(&state, client_id, response).await;
        });
    }

    async fn handle_is_installed(&self, client_id: Uuid, execution_id: String, package: String) {
        if package.is_empty() {
            self.send_error(client_id, "Package name is empty.", non_empty(&execution_id))
                .await;
            return;
        }
        if execution_id.is_empty() {
            self.send_error(client_id, "Execution ID is empty.", None).await;
            return;
        }

        let installed = self.env.is_package_installed(&package);
        let mut response = Response::success(&execution_id);
        response.installed = Some(installed);
        response.message = Some(if installed {
            format!("Package '{package}' is installed.")
        } else {
            format!("Package '{package}' is not installed.")
        });
        self.send(client_id, response).await;
    }

    async fn handle_get_version(&self, client_id: Uuid, execution_id: String, package: String) {
        if package.is_empty() {
            self.send_error(client_id, "Package name is empty.", non_empty(&execution_id))
                .await;
            return;
        }
        if execution_id.is_empty() {
            self.send_error(client_id, "Execution ID is empty.", None).await;
            return;
        }

        match self.env.package_version(&package) {
            Some(version) => {
                let mut response = Response::success(&execution_id);
                response.version = Some(version);
                self.send(client_id, response).await;
            }
            None => {
                self.send_error(
                    client_id,
                    format!("Package '{package}' is not installed."),
                    Some(execution_id),
                )
                .await;
            }
        }
    }

    /// Validate the execution id, claim it in the registry, and return the
    /// cancellation receiver for the supervising task. Answers the client
    /// and returns `None` when the id is empty or already live.
    async fn register(
        &self,
        client_id: Uuid,
        execution_id: String,
        kind: OperationKind,
    ) -> Option<(String, oneshot::Receiver<()>)> {
        if execution_id.is_empty() {
            self.send_error(client_id, "Execution ID is empty.", None).await;
            return None;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let accepted = {
            let mut state = self.state.write().await;
            state
                .registry
                .insert(&execution_id, ExecutionRecord::new(client_id, kind, cancel_tx))
        };

        if !accepted {
            self.send_error(
                client_id,
                format!("Execution ID '{execution_id}' is already in use."),
                Some(execution_id),
            )
            .await;
            return None;
        }
        Some((execution_id, cancel_rx))
    }

    async fn send(&self, client_id: Uuid, response: Response) {
        ServerState::send_to(&self.state, client_id, response).await;
    }

    async fn send_error(
        &self,
        client_id: Uuid,
        message: impl Into<String>,
        execution_id: Option<String>,
    ) {
        self.send(client_id, Response::error(message, execution_id))
            .await;
    }
}

fn non_empty(execution_id: &str) -> Option<String> {
    (!execution_id.is_empty()).then(|| execution_id.to_string())
}
