//! onionbox - session-jailed file box with an HTTP API.
//!
//! Usage:
//!   onionbox serve -f <folder> [-p <port>]     # Serve <folder> on 127.0.0.1:<port>
//!   onionbox serve --config /etc/onionbox.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use onionbox::config::{Config, Overrides};
use onionbox::{run_server, AppState};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "onionbox")]
#[command(about = "Session-jailed file box with an HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Root folder every session is confined to
        #[arg(short = 'f', long = "folder", env = "ONIONBOX_ROOT")]
        root: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long, env = "ONIONBOX_PORT")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long, env = "ONIONBOX_BIND")]
        bind: Option<IpAddr>,

        /// TOML configuration file
        #[arg(short, long, env = "ONIONBOX_CONFIG")]
        config: Option<PathBuf>,

        /// Idle seconds before a session expires
        #[arg(long, env = "ONIONBOX_SESSION_TTL_SECS")]
        session_ttl_secs: Option<u64>,

        /// Seconds between expiry sweeps
        #[arg(long, env = "ONIONBOX_SWEEP_INTERVAL_SECS")]
        sweep_interval_secs: Option<u64>,

        /// Upload size limit in bytes (0 disables)
        #[arg(long, env = "ONIONBOX_MAX_UPLOAD_BYTES")]
        max_upload_bytes: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    match args.command {
        Commands::Serve {
            root,
            port,
            bind,
            config,
            session_ttl_secs,
            sweep_interval_secs,
            max_upload_bytes,
        } => {
            let mut config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };
            config.apply(Overrides {
                root,
                bind,
                port,
                session_ttl_secs,
                sweep_interval_secs,
                max_upload_bytes,
            });
            serve(config).await
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let jail = config.validate()?;
    let addr = config.listen_addr();
    let state = AppState::from_config(&config, jail);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    run_server(listener, state, shutdown).await?;
    info!("Server stopped");
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onionbox=info,tower_http=info".into()),
        )
        .init();
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    shutdown.cancel();
}
