//! CLI parser and command dispatch.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::server;
use crate::store::{migrations, Store};

#[derive(Parser)]
#[command(name = "logshed")]
#[command(about = "Lightweight log collection and query service")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collection and query service
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },

    /// Apply or roll back schema migrations
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Start the service and block until shutdown
    Run {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Apply every pending migration in version order
    Rollout {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Roll back an applied migration
    Rollback {
        /// Path to the configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Version to roll back (defaults to the most recently applied)
        #[arg(long)]
        version: Option<i64>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Server { command: ServerCommands::Run { config } } => {
            let config = Config::from_file(&config)?;
            server::run(config).await
        }
        Commands::Migrate { command } => match command {
            MigrateCommands::Rollout { config } => {
                let config = Config::from_file(&config)?;
                let store = Store::new(&config);
                store.initialize().await?;
                migrations::apply_pending(&store, &config.migrations).await?;
                store.close().await;
                Ok(())
            }
            MigrateCommands::Rollback { config, version } => {
                let config = Config::from_file(&config)?;
                let store = Store::new(&config);
                store.initialize().await?;
                migrations::rollback(&store, &config.migrations, version).await?;
                store.close().await;
                Ok(())
            }
        },
    }
}
