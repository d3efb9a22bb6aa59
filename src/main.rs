use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use atelier::config::ServerConfig;
use atelier::engine::server;

#[derive(Parser)]
#[command(name = "atelier")]
#[command(version, about = "Sandbox lifecycle and file synchronization engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the engine HTTP server
    Serve {
        #[arg(short, long, default_value = "4100")]
        port: u16,

        /// Path to the SQLite database file
        #[arg(long, default_value = ".atelier/engine.db")]
        db_path: PathBuf,

        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,

        /// Use the in-process sandbox provider (no credentials needed)
        #[arg(long)]
        local: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let default_filter = if cli.verbose { "atelier=debug" } else { "atelier=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            db_path,
            dev,
            local,
        } => {
            server::start_server(ServerConfig {
                port,
                db_path,
                dev_mode: dev,
                local_mode: local,
            })
            .await
        }
    }
}
