//! pyengine - command-line client for the local Python execution broker

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use pyengine::client::{ClientEvent, PackageResult, PythonClient, ServerSupervisor};
use pyengine::config::Config;
use pyengine::python::PythonResult;
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pyengine")]
#[command(about = "Run Python scripts and manage packages through the local broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path override (defaults to the derived per-host endpoint)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Start the broker at this path if the endpoint is not reachable
    #[arg(long)]
    server: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script file; extra arguments become sys.argv[1..]
    Run {
        script: PathBuf,
        /// Script arguments (numbers and booleans are passed typed)
        args: Vec<String>,
        /// Timeout in milliseconds, 0 for none
        #[arg(long, default_value_t = 0)]
        timeout: i64,
    },
    /// Compile-check a script file without running it
    Check { script: PathBuf },
    /// Install a package from the index
    Install { package: String },
    /// Reinstall a package
    Reinstall { package: String },
    /// Upgrade a package
    Update { package: String },
    /// Remove a package from the site directory
    Uninstall { package: String },
    /// Install a package from a local directory
    InstallLocal { path: PathBuf },
    /// Upgrade a package from a local directory
    UpdateLocal { path: PathBuf },
    /// Upgrade every installed package
    UpgradeAll,
    /// Search the package index
    Search { query: String },
    /// Show package metadata
    Info { package: String },
    /// List installed packages
    List,
    /// Show the installed version of a package
    Version { package: String },
    /// Check whether a package is installed
    Installed { package: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    let socket_path = cli.socket.clone().unwrap_or_else(|| config.socket_path());

    if let Some(server_path) = &cli.server {
        let (supervisor, _events) = ServerSupervisor::new(server_path.clone(), socket_path.clone());
        supervisor.start_server().await?;
    }

    let (client, mut events) = PythonClient::new(socket_path);
    if !client.wait_for_server_ready().await {
        bail!("Broker is not reachable; is pyengine-server running?");
    }

    match cli.command {
        Commands::Run {
            script,
            args,
            timeout,
        } => {
            let source = std::fs::read_to_string(&script)
                .with_context(|| format!("Failed to read {:?}", script))?;
            let arguments = args.iter().map(|raw| parse_scalar(raw)).collect();

            let execution_id = Uuid::new_v4().to_string();
            if !client.run_script(&execution_id, &source, arguments, timeout) {
                bail!("Command was not accepted");
            }

            // Ctrl-C cancels the running execution instead of abandoning it.
            let cancel_client_id = execution_id.clone();
            let canceller = client;
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Cancelling execution...");
                    canceller.cancel(&cancel_client_id);
                }
            });

            let result = wait_for_script(&mut events, &execution_id).await?;
            print_script_result(&result)
        }

        Commands::Check { script } => {
            let source = std::fs::read_to_string(&script)
                .with_context(|| format!("Failed to read {:?}", script))?;
            let execution_id = Uuid::new_v4().to_string();
            if !client.check_syntax(&execution_id, &source) {
                bail!("Command was not accepted");
            }
            let result = wait_for_script(&mut events, &execution_id).await?;
            if result.success {
                println!("Syntax is valid.");
                Ok(())
            } else {
                bail!("{}", result.stderr.trim());
            }
        }

        Commands::Install { package } => {
            let execution_id = Uuid::new_v4().to_string();
            submit(client.install_package(&execution_id, &package))?;
            finish_package(&mut events, &execution_id).await
        }
        Commands::Reinstall { package } => {
            let execution_id = Uuid::new_v4().to_string();
            submit(client.reinstall_package(&execution_id, &package))?;
            finish_package(&mut events, &execution_id).await
        }
        Commands::Update { package } => {
            let execution_id = Uuid::new_v4().to_string();
            submit(client.update_package(&execution_id, &package))?;
            finish_package(&mut events, &execution_id).await
        }
        Commands::Uninstall { package } => {
            let execution_id = Uuid::new_v4().to_string();
            submit(client.uninstall_package(&execution_id, &package))?;
            finish_package(&mut events, &execution_id).await
        }
        Commands::InstallLocal { path } => {
            let execution_id = Uuid::new_v4().to_string();
            submit(client.install_local_package(&execution_id, &path.to_string_lossy()))?;
            finish_package(&mut events, &execution_id).await
        }
        Commands::UpdateLocal { path } => {
            let execution_id = Uuid::new_v4().to_string();
            submit(client.update_local_package(&execution_id, &path.to_string_lossy()))?;
            finish_package(&mut events, &execution_id).await
        }
        Commands::UpgradeAll => {
            let execution_id = client
                .upgrade_all_packages()
                .ok_or_else(|| anyhow!("Command was not accepted"))?;
            finish_package(&mut events, &execution_id).await
        }
        Commands::Search { query } => {
            let execution_id = client
                .search_package(&query)
                .ok_or_else(|| anyhow!("Command was not accepted"))?;
            let result = wait_for_package(&mut events, &execution_id).await?;
            expect_success(&result)?;
            for name in result.results.unwrap_or_default() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Info { package } => {
            let execution_id = client
                .get_package_info(&package)
                .ok_or_else(|| anyhow!("Command was not accepted"))?;
            let result = wait_for_package(&mut events, &execution_id).await?;
            expect_success(&result)?;
            for (key, value) in result.package_info.unwrap_or_default() {
                println!("{}: {}", key, value.as_str().unwrap_or_default());
            }
            Ok(())
        }
        Commands::List => {
            let execution_id = client
                .list_installed_packages()
                .ok_or_else(|| anyhow!("Command was not accepted"))?;
            let result = wait_for_package(&mut events, &execution_id).await?;
            expect_success(&result)?;
            for name in result.installed_packages.unwrap_or_default() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Version { package } => {
            let execution_id = client
                .get_package_version(&package)
                .ok_or_else(|| anyhow!("Command was not accepted"))?;
            let result = wait_for_package(&mut events, &execution_id).await?;
            expect_success(&result)?;
            println!("{}", result.version.unwrap_or_default());
            Ok(())
        }
        Commands::Installed { package } => {
            let execution_id = Uuid::new_v4().to_string();
            submit(client.is_package_installed(&execution_id, &package))?;
            let result = wait_for_package(&mut events, &execution_id).await?;
            expect_success(&result)?;
            println!(
                "{}",
                if result.installed.unwrap_or(false) {
                    "installed"
                } else {
                    "not installed"
                }
            );
            Ok(())
        }
    }
}

fn submit(accepted: bool) -> Result<()> {
    if accepted {
        Ok(())
    } else {
        Err(anyhow!("Command was not accepted"))
    }
}

/// Interpret one raw CLI argument as a typed scalar.
fn parse_scalar(raw: &str) -> Value {
    if let Ok(number) = raw.parse::<i64>() {
        return Value::from(number);
    }
    if let Ok(number) = raw.parse::<f64>() {
        return Value::from(number);
    }
    if let Ok(flag) = raw.parse::<bool>() {
        return Value::from(flag);
    }
    Value::from(raw)
}

/// Drain events until the script terminal for `execution_id` arrives.
async fn wait_for_script(
    events: &mut mpsc::Receiver<ClientEvent>,
    execution_id: &str,
) -> Result<PythonResult> {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::ScriptExecutionFinished(result)
                if result.execution_id == execution_id =>
            {
                return Ok(result)
            }
            // Validation failures come back as package-side errors.
            ClientEvent::PackageOperationFinished(result)
                if result.execution_id == execution_id =>
            {
                bail!("{}", result.stderr.trim());
            }
            ClientEvent::DisconnectedFromServer => bail!("Disconnected from server"),
            _ => {}
        }
    }
    bail!("Event stream closed")
}

/// Drain events until the package terminal for `execution_id` arrives,
/// echoing its progress stages.
async fn wait_for_package(
    events: &mut mpsc::Receiver<ClientEvent>,
    execution_id: &str,
) -> Result<PackageResult> {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::PackageOperationProgress {
                stage,
                execution_id: id,
                ..
            } if id == execution_id => eprintln!("{stage}"),
            ClientEvent::PackageOperationFinished(result)
                if result.execution_id == execution_id =>
            {
                return Ok(result)
            }
            ClientEvent::DisconnectedFromServer => bail!("Disconnected from server"),
            _ => {}
        }
    }
    bail!("Event stream closed")
}

async fn finish_package(
    events: &mut mpsc::Receiver<ClientEvent>,
    execution_id: &str,
) -> Result<()> {
    let result = wait_for_package(events, execution_id).await?;
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if let Some(message) = &result.message {
        println!("{message}");
    }
    if result.cancelled {
        bail!("Operation cancelled");
    }
    if !result.success {
        bail!("{}", result.stderr.trim());
    }
    Ok(())
}

fn expect_success(result: &PackageResult) -> Result<()> {
    if result.success {
        Ok(())
    } else {
        Err(anyhow!("{}", result.stderr.trim()))
    }
}

fn print_script_result(result: &PythonResult) -> Result<()> {
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
    eprintln!("({} ms)", result.execution_time_ms);

    if result.cancelled {
        bail!("Execution cancelled");
    }
    if !result.success {
        bail!("Execution failed");
    }
    Ok(())
}
