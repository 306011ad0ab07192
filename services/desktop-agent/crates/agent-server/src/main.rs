//! Desktop Agent entry point.
//!
//! Initialises tracing, loads configuration from `DESKTOP_AGENT_*`
//! environment variables, applies command-line overrides, and serves the
//! loopback WebSocket until Ctrl-C or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use desktop_agent::AppState;
use desktop_agent::discovery::{self, ToolAvailability};
use desktop_agent_common::registry::BUILTIN_TOOLS;
use desktop_agent_common::{AgentServerConfig, ToolRegistry};
use tracing_subscriber::EnvFilter;

// ===================================================================
// Command line
// ===================================================================

#[derive(Debug, Parser)]
#[command(name = "desktop-agent", version, about = "Local security tool runner")]
struct Cli {
    /// Override `DESKTOP_AGENT_LISTEN_ADDR`. Must be a loopback address.
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Print the allow-listed tools and whether each is installed, then exit.
    #[arg(long)]
    list_tools: bool,
}

fn print_tools(tools: &[ToolAvailability]) {
    for tool in tools {
        let location = tool
            .path
            .as_ref()
            .map_or_else(|| "not installed".to_string(), |p| p.display().to_string());
        println!(
            "{:<10} {:<10} {:<40} {}",
            tool.name,
            tool.family.as_str(),
            tool.description,
            location
        );
    }
}

// ===================================================================
// Entry point
// ===================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Tracing with RUST_LOG env filter.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // 2. Configuration from DESKTOP_AGENT_* env vars, then flags.
    let mut config: AgentServerConfig = envy::prefixed("DESKTOP_AGENT_")
        .from_env()
        .context("failed to load config from DESKTOP_AGENT_* env vars")?;
    if let Some(addr) = cli.listen_addr {
        config.listen_addr = addr;
    }
    config.validate().context("invalid configuration")?;

    // 3. Allow-list.
    let registry =
        ToolRegistry::new(BUILTIN_TOOLS.to_vec()).context("built-in tool table is invalid")?;
    let availability = discovery::probe(&registry);
    if cli.list_tools {
        print_tools(&availability);
        return Ok(());
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        max_connections = config.max_connections,
        recon_timeout_secs = config.recon_timeout_secs,
        deep_scan_timeout_secs = config.deep_scan_timeout_secs,
        tools = registry.len(),
        "configuration loaded",
    );
    discovery::log_availability(&availability);

    // 4. Bind and serve.
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let state = Arc::new(AppState::new(config, registry));

    tracing::info!(addr = %listener.local_addr()?, "desktop agent listening");
    let served = desktop_agent::serve(listener, Arc::clone(&state), shutdown_signal()).await;

    // Upgraded sockets outlive the HTTP server; stop their tools before the
    // runtime drops the supervisors.
    state.runner.terminate_all().await;
    served.context("server error")?;

    tracing::info!("desktop agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("received shutdown signal");
}
