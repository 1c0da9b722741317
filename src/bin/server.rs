//! pyengine-server - broker daemon for local Python execution

use anyhow::{Context, Result};
use clap::Parser;
use pyengine::config::Config;
use pyengine::python::PythonEnv;
use pyengine::server::BrokerServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "pyengine-server")]
#[command(about = "Local Python execution broker")]
#[command(version)]
struct Cli {
    /// Socket path override (defaults to the derived per-host endpoint)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Python tree override
    #[arg(long)]
    python_home: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));
    let _log_guard = pyengine::logging::init(&exe_dir)?;

    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(home) = cli.python_home {
        config.general.python_home = Some(home);
    }

    let socket_path = cli.socket.unwrap_or_else(|| config.socket_path());
    let env = PythonEnv::discover(&config)?;

    tracing::info!(
        "Starting broker; interpreter {:?}, site {:?}",
        env.python_executable(),
        env.site_packages()
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_termination().await;
        let _ = shutdown_tx.send(()).await;
    });

    let server = BrokerServer::new(socket_path, Arc::new(env));
    server.run(shutdown_rx).await
}

/// Resolve on Ctrl-C or SIGTERM, whichever comes first.
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
    }
}
