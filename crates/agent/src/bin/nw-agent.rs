//! Node agent daemon: registers with the control plane, waits for
//! approval, then keeps the local tunnel and firewall converged with
//! the compiled config.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use nw_agent::client::ControlPlaneClient;
use nw_agent::executor::{InMemoryFirewall, InMemoryTunnel, TunnelExecutor};
use nw_agent::integrity::IntegrityCollector;
use nw_agent::push::PushChannelClient;
use nw_agent::reconciler::{Reconciler, ReconcilerConfig};
use nw_domain::model::NodeRole;

#[derive(Parser)]
#[command(name = "nw-agent", version, about = "NetWarden node agent")]
struct Cli {
    /// Node hostname (the registry identity).
    #[arg(long)]
    hostname: String,

    /// Node role: app, db, ops, monitor or hub.
    #[arg(long)]
    role: String,

    /// Control plane base URL.
    #[arg(long, default_value = "http://localhost:8001")]
    control_plane: String,

    /// State directory (keypair persistence).
    #[arg(long, default_value = "/var/lib/nw-agent")]
    state_dir: std::path::PathBuf,

    /// Config polling interval in seconds (fallback when the push
    /// channel is down).
    #[arg(long, default_value_t = 60)]
    sync_interval: u64,

    /// Push-channel keepalive interval in seconds.
    #[arg(long, default_value_t = 30)]
    ping_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let role = NodeRole::parse(&cli.role)
        .ok_or_else(|| anyhow::anyhow!("unknown role: {}", cli.role))?;

    tracing::info!(
        hostname = %cli.hostname,
        role = %role,
        control_plane = %cli.control_plane,
        "NetWarden node agent starting"
    );

    // Tunnel and firewall backends. The in-memory executors track the
    // would-be state without touching the kernel; production builds
    // swap kernel-backed implementations in here.
    let tunnel = Arc::new(InMemoryTunnel::new("wg0").with_keypair_file(&cli.state_dir));
    let firewall = Arc::new(InMemoryFirewall::new());

    let collector = match IntegrityCollector::for_current_exe() {
        Ok(collector) => Some(collector),
        Err(e) => {
            tracing::warn!(error = %e, "integrity self-reporting disabled");
            None
        }
    };

    let mut config = ReconcilerConfig::new(cli.hostname.clone(), role);
    config.sync_interval = std::time::Duration::from_secs(cli.sync_interval);

    let client = ControlPlaneClient::new(&cli.control_plane)?;
    let reconciler = Arc::new(Reconciler::new(
        client,
        tunnel.clone(),
        firewall,
        collector,
        config,
    ));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    // The push channel needs the tunnel identity; make sure it exists
    // before connecting.
    let public_key = tunnel.ensure_keypair().await?;
    let push = PushChannelClient::new(
        &cli.control_plane,
        &cli.hostname,
        &public_key,
        std::time::Duration::from_secs(cli.ping_interval),
    );

    let (events_tx, events_rx) = mpsc::channel(16);
    let push_task = tokio::spawn(push.run(events_tx, shutdown.clone()));

    let result = reconciler.run(events_rx, shutdown.clone()).await;
    let was_shutdown = shutdown.is_cancelled();
    shutdown.cancel();
    let _ = push_task.await;

    match result {
        Err(e) if !was_shutdown => return Err(e.into()),
        _ => {}
    }
    tracing::info!("node agent stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}
