use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tunnel_core::config::ConfigStore;
use tunnel_core::control::ControlInterface;
use tunnel_core::logger;
use tunnel_core::runtime::Runtime;

/// SSH session pool and multi-mode port forwarding daemon.
#[derive(Parser, Debug)]
#[command(name = "tunneld")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the INI configuration file
    #[arg(short, long, default_value = "tunnel.ini")]
    config: PathBuf,

    /// Raise the daemon's own log target to debug level
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print configured servers and their connection status, then exit
    Status,
    /// List configured forwards and their state, then exit
    ListForwards,
    /// List configured servers, then exit
    ListServers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigStore::load(&cli.config)?;
    logger::init(cli.debug || config.debug);

    tracing::info!("loaded {} server(s), {} forward(s)", config.servers.len(), config.forwards.len());

    let runtime = Arc::new(Runtime::new(config));

    match cli.command {
        Some(Commands::Status) => {
            runtime.start_all().await;
            let snapshot = runtime.snapshot().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            runtime.stop().await?;
        }
        Some(Commands::ListServers) => {
            runtime.start_all().await;
            for server in runtime.list_servers().await {
                println!(
                    "{} - {}",
                    server.name,
                    if server.connected { "connected" } else { "disconnected" }
                );
            }
            runtime.stop().await?;
        }
        Some(Commands::ListForwards) => {
            runtime.start_all().await;
            for forward in runtime.list_forwards().await {
                println!(
                    "{} ({}) on {} [{}] - {}",
                    forward.name, forward.direction, forward.server, forward.endpoints, forward.state
                );
            }
            runtime.stop().await?;
        }
        None => {
            runtime.start_all().await;
            wait_for_shutdown_signal().await;
            tracing::info!("shutting down");
            runtime.stop().await?;
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
