//! Message types for the broker wire protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands sent from client to broker.
///
/// The `command` field carries the variant name; command-specific fields sit
/// beside it in the same JSON object. `executionId` and payload fields
/// default to empty so that the dispatcher can answer omissions with the
/// protocol's specific validation errors instead of a generic parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    /// Execute a script with positional arguments and an optional timeout
    #[serde(rename_all = "camelCase")]
    Execute {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        script: String,
        #[serde(default)]
        arguments: Vec<Value>,
        /// Timeout in milliseconds; zero or negative means none
        #[serde(default)]
        timeout: i64,
    },

    /// Compile-check a script without running it
    #[serde(rename_all = "camelCase")]
    CheckSyntax {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        script: String,
    },

    /// Cancel a running execution
    #[serde(rename_all = "camelCase")]
    Cancel {
        #[serde(default)]
        execution_id: String,
    },

    #[serde(rename_all = "camelCase")]
    InstallPackage {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        package: String,
    },

    #[serde(rename_all = "camelCase")]
    InstallLocalPackage {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        package_path: String,
    },

    #[serde(rename_all = "camelCase")]
    ReinstallPackage {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        package: String,
    },

    #[serde(rename_all = "camelCase")]
    UpdatePackage {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        package: String,
    },

    #[serde(rename_all = "camelCase")]
    UpdateLocalPackage {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        package_path: String,
    },

    #[serde(rename_all = "camelCase")]
    UninstallPackage {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        package: String,
    },

    #[serde(rename_all = "camelCase")]
    UpgradeAllPackages {
        #[serde(default)]
        execution_id: String,
    },

    #[serde(rename_all = "camelCase")]
    SearchPackage {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        query: String,
    },

    #[serde(rename_all = "camelCase")]
    GetPackageInfo {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        package: String,
    },

    #[serde(rename_all = "camelCase")]
    ListInstalledPackages {
        #[serde(default)]
        execution_id: String,
    },

    #[serde(rename_all = "camelCase")]
    IsPackageInstalled {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        package: String,
    },

    #[serde(rename_all = "camelCase")]
    GetPackageVersion {
        #[serde(default)]
        execution_id: String,
        #[serde(default)]
        package: String,
    },
}

/// Every wire command name, in handler-table order.
pub const COMMAND_NAMES: [&str; 15] = [
    "execute",
    "checkSyntax",
    "cancel",
    "installPackage",
    "installLocalPackage",
    "reinstallPackage",
    "updatePackage",
    "updateLocalPackage",
    "uninstallPackage",
    "upgradeAllPackages",
    "searchPackage",
    "getPackageInfo",
    "listInstalledPackages",
    "isPackageInstalled",
    "getPackageVersion",
];

impl Command {
    /// The caller-chosen correlation id carried by every command.
    pub fn execution_id(&self) -> &str {
        match self {
            Command::Execute { execution_id, .. }
            | Command::CheckSyntax { execution_id, .. }
            | Command::Cancel { execution_id }
            | Command::InstallPackage { execution_id, .. }
            | Command::InstallLocalPackage { execution_id, .. }
            | Command::ReinstallPackage { execution_id, .. }
            | Command::UpdatePackage { execution_id, .. }
            | Command::UpdateLocalPackage { execution_id, .. }
            | Command::UninstallPackage { execution_id, .. }
            | Command::UpgradeAllPackages { execution_id }
            | Command::SearchPackage { execution_id, .. }
            | Command::GetPackageInfo { execution_id, .. }
            | Command::ListInstalledPackages { execution_id }
            | Command::IsPackageInstalled { execution_id, .. }
            | Command::GetPackageVersion { execution_id, .. } => execution_id,
        }
    }
}

/// Operation kinds tracked by the execution registry and reported on
/// progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Script,
    SyntaxCheck,
    Install,
    Reinstall,
    Update,
    InstallLocal,
    UpdateLocal,
    Uninstall,
    UpgradeAll,
    Search,
}

impl OperationKind {
    /// Status string carried on progress events for this kind.
    pub fn progress_status(&self) -> &'static str {
        match self {
            OperationKind::Install => "installing",
            OperationKind::Reinstall => "reinstalling",
            OperationKind::Update => "updating",
            OperationKind::InstallLocal => "installingLocal",
            OperationKind::UpdateLocal => "updatingLocal",
            OperationKind::Uninstall => "uninstalling",
            OperationKind::UpgradeAll => "upgradingAll",
            OperationKind::Search => "searching",
            OperationKind::Script | OperationKind::SyntaxCheck => "processing",
        }
    }

    /// Map a progress status string back to a kind. Unknown strings default
    /// to `Search`, matching the client-side contract.
    pub fn from_status(status: &str) -> Self {
        match status {
            "installing" => OperationKind::Install,
            "reinstalling" => OperationKind::Reinstall,
            "updating" => OperationKind::Update,
            "installingLocal" => OperationKind::InstallLocal,
            "updatingLocal" => OperationKind::UpdateLocal,
            "uninstalling" => OperationKind::Uninstall,
            "upgradingAll" => OperationKind::UpgradeAll,
            "searching" => OperationKind::Search,
            _ => OperationKind::Search,
        }
    }
}

/// Response sent from broker to clients.
///
/// `status` is always present. `isScript` and `updateEvent` are always
/// serialized (clients default them to false); everything else is
/// operation-specific and omitted from the wire when unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Response {
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,

    pub is_script: bool,
    pub update_event: bool,

    /// Human-readable stage, present on progress events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    /// Elapsed milliseconds, present on terminal responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_packages: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_info: Option<serde_json::Map<String, Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Response {
    /// An immediate validation or protocol error. The message doubles as
    /// `stdout` for compatibility with hosts that only surface stdout.
    pub fn error(message: impl Into<String>, execution_id: Option<String>) -> Self {
        let message = message.into();
        Response {
            status: "error".to_string(),
            execution_id,
            stdout: Some(message.clone()),
            message: Some(message),
            ..Default::default()
        }
    }

    /// Acknowledgement that a long-running command was accepted.
    pub fn started(execution_id: &str, message: impl Into<String>) -> Self {
        Response {
            status: "started".to_string(),
            execution_id: Some(execution_id.to_string()),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// A broadcast progress event carrying a human-readable stage.
    pub fn progress(execution_id: &str, kind: OperationKind, stage: impl Into<String>) -> Self {
        Response {
            status: kind.progress_status().to_string(),
            execution_id: Some(execution_id.to_string()),
            update_event: true,
            stage: Some(stage.into()),
            ..Default::default()
        }
    }

    /// A plain success response for synchronous queries.
    pub fn success(execution_id: &str) -> Self {
        Response {
            status: "success".to_string(),
            execution_id: Some(execution_id.to_string()),
            ..Default::default()
        }
    }

    /// Whether this response ends an execution's lifecycle.
    pub fn is_terminal(&self) -> bool {
        !self.update_event
            && matches!(self.status.as_str(), "success" | "error" | "cancelled")
    }
}
