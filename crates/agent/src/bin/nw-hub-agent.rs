//! Hub agent daemon: terminates the control plane's command channel
//! and applies peer mutations to the hub tunnel interface.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use nw_agent::executor::{InMemoryTunnel, TunnelExecutor};
use nw_agent::hub::channel::HubAgent;
use nw_agent::hub::executor::CommandExecutor;
use nw_agent::hub::peers::PeerManager;

#[derive(Parser)]
#[command(name = "nw-hub-agent", version, about = "NetWarden hub agent")]
struct Cli {
    /// Control plane base URL.
    #[arg(long, default_value = "http://localhost:8001")]
    control_plane: String,

    /// Shared API key; falls back to the HUB_AGENT_API_KEY env var.
    #[arg(long)]
    api_key: Option<String>,

    /// Tunnel interface name.
    #[arg(long, default_value = "wg0")]
    interface: String,

    /// State directory (keypair persistence).
    #[arg(long, default_value = "/var/lib/nw-hub-agent")]
    state_dir: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let api_key = cli
        .api_key
        .or_else(|| std::env::var("HUB_AGENT_API_KEY").ok())
        .ok_or_else(|| anyhow::anyhow!("api key required (--api-key or HUB_AGENT_API_KEY)"))?;

    tracing::info!(
        control_plane = %cli.control_plane,
        interface = %cli.interface,
        "NetWarden hub agent starting"
    );

    let tunnel: Arc<dyn TunnelExecutor> = Arc::new(
        InMemoryTunnel::new(cli.interface.clone()).with_keypair_file(&cli.state_dir),
    );
    tunnel.ensure_keypair().await?;

    let peers = Arc::new(PeerManager::new(tunnel.clone()));
    let executor = Arc::new(CommandExecutor::new(peers, tunnel.clone()));
    let agent = HubAgent::new(&cli.control_plane, &api_key, executor, tunnel);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    agent.run(shutdown).await;
    tracing::info!("hub agent stopped");
    Ok(())
}
