use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use nw_control_plane::api;
use nw_control_plane::handlers;
use nw_control_plane::state::AppState;
use nw_domain::config::{Config, ConfigSeverity};
use nw_registry::Registry;

#[derive(Parser)]
#[command(name = "netwardend", version, about = "NetWarden zero-trust overlay control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control-plane server (default).
    Serve,
    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate the environment configuration and exit non-zero on errors.
    Validate,
    /// Print the effective configuration (secrets masked).
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::from_env().context("reading configuration from environment")?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config { command: ConfigCommand::Validate }) => {
            let config = Config::from_env().context("reading configuration from environment")?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("{issue}");
            }
            let errors = issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count();
            if errors > 0 {
                std::process::exit(1);
            }
            println!("configuration ok ({} warning(s))", issues.len());
            Ok(())
        }
        Some(Command::Config { command: ConfigCommand::Show }) => {
            let mut config = Config::from_env().context("reading configuration from environment")?;
            mask(&mut config.admin_secret);
            mask(&mut config.hub_agent_api_key);
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn mask(secret: &mut String) {
    if !secret.is_empty() {
        *secret = "********".to_string();
    }
}

/// Structured JSON tracing for the daemon.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nw_control_plane=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("NetWarden control plane starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Registry ─────────────────────────────────────────────────────
    let registry = Arc::new(
        Registry::open(
            &config.state_path,
            config.overlay_network,
            config.ip_pool_low_threshold,
        )
        .context("opening registry")?,
    );
    tracing::info!(
        path = %config.state_path.display(),
        overlay = %config.overlay_network,
        config_version = registry.config_version(),
        "registry ready"
    );

    // ── State, handlers, background loops ────────────────────────────
    let state = AppState::new(config.clone(), registry);
    let shutdown = CancellationToken::new();
    let sync_loop = handlers::start(&state, shutdown.clone());
    tracing::info!(
        sync_interval_secs = config.sync_interval.as_secs(),
        "event handlers and hub sync loop ready"
    );

    // ── HTTP server ──────────────────────────────────────────────────
    let app = api::router()
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "listening");

    let shutdown_signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        wait_for_shutdown().await;
        shutdown_signal.cancel();
    })
    .await
    .context("server error")?;

    shutdown.cancel();
    let _ = sync_loop.await;
    tracing::info!("control plane stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
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
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
