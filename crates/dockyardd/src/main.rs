//! dockyardd — the Dockyard daemon.
//!
//! # Usage
//!
//! ```text
//! dockyardd serve --config /etc/dockyard/dockyard.toml --listen 0.0.0.0:8000
//! dockyardd hosts --config /etc/dockyard/dockyard.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dockyard_core::DockyardConfig;
use dockyardd::{Context, resolve_hosts};

const DEFAULT_FILTER: &str = "info,dockyardd=debug,dockyard=debug";

#[derive(Parser)]
#[command(name = "dockyardd", about = "Dockyard container scheduling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the configured hosts and serve the HTTP API.
    Serve {
        /// Path to dockyard.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address, overriding the config file.
        #[arg(long)]
        listen: Option<String>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the hosts and build workers the daemon would use.
    Hosts {
        /// Path to dockyard.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            log_json,
        } => {
            init_tracing(log_json);
            serve(config, listen).await
        }
        Command::Hosts { config } => {
            init_tracing(false);
            let config = DockyardConfig::load(config.as_deref())?;
            let vars: Vec<(String, String)> = std::env::vars().collect();
            println!("{}", serde_json::to_string_pretty(&resolve_hosts(&config, &vars))?);
            Ok(())
        }
    }
}

async fn serve(config_path: Option<PathBuf>, listen: Option<String>) -> anyhow::Result<()> {
    info!("dockyard daemon starting");

    let mut config = DockyardConfig::load(config_path.as_deref())?;
    if let Some(listen) = listen {
        config.server.listen = listen;
    }

    let vars: Vec<(String, String)> = std::env::vars().collect();
    let ctx = Context::connect(config, vars).await?;

    // ── Runtime events ─────────────────────────────────────────

    let forwarders = ctx.forward_events().await;
    info!(hosts = forwarders.len(), "runtime event forwarding started");

    // ── API server ─────────────────────────────────────────────

    let addr = ctx.config.server.listen.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "API server starting");

    axum::serve(listener, ctx.router())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to install CTRL+C handler");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    for handle in forwarders {
        handle.abort();
    }
    info!("dockyard daemon stopped");
    Ok(())
}
