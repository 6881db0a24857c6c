use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use portaldrop::relay::RelayState;
use portaldrop::Config;

#[derive(Parser)]
#[command(name = "portaldrop", about = "Two-party file drop signaling relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signaling relay daemon
    Relay {
        /// Bind address, overrides the config file
        #[arg(long)]
        addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Relay { addr } => {
            let config = Config::load().context("Failed to load config")?;
            let bind = addr.unwrap_or(config.relay.bind_address);

            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("Failed to bind {}", bind))?;
            info!("Relay listening on {}", bind);

            let app = RelayState::new().router();
            axum::serve(listener, app)
                .await
                .context("Relay server failed")?;
        }
    }

    Ok(())
}
