//! Trellis XMPP server.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use trellis_xmpp::storage::{hash_password, Deferred, MemoryStorage};
use trellis_xmpp::XmppServer;

mod settings;
mod telemetry;

/// Trellis - XMPP server
#[derive(Parser)]
#[command(name = "trellis-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve until interrupted (the default)
    Run,
    /// Print the effective configuration
    ShowConfig,
    /// Read a password from stdin and print its Argon2 hash for a `[[users]]` entry
    HashPassword,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            telemetry::init(cli.json_logs)?;
            run(settings::load(&cli.config)?).await
        }
        Commands::ShowConfig => {
            let config = settings::load(&cli.config)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::HashPassword => {
            let mut password = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut password)
                .context("failed to read password")?;
            println!("{}", hash_password(password.trim_end_matches(['\r', '\n']))?);
            Ok(())
        }
    }
}

async fn run(config: trellis_xmpp::Config) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Trellis starting");

    let storage = MemoryStorage::from_config(&config.users)?;
    info!(users = config.users.len(), "Accounts loaded");

    let server = XmppServer::new(config, Arc::new(Deferred::new(storage)))
        .start()
        .await
        .context("failed to start server")?;
    let addresses = server.addresses();
    info!(
        client = ?addresses.client,
        server = ?addresses.server,
        component = ?addresses.component,
        http = ?addresses.http,
        "Trellis ready"
    );

    shutdown_signal().await;
    server.shutdown().await;
    info!("Trellis stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Interrupted"),
        _ = terminate => info!("Terminated"),
    }
}
