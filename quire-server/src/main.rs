//! Quire sync server.
//!
//! `quire-server serve` runs the WebSocket endpoint until Ctrl-C.
//! `quire-server compact` folds stored update logs offline.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;

use quire_collab::{Compactor, RoomKey, ServerConfig, SyncServer, UpdateLogStore};

#[derive(Parser, Debug)]
#[command(name = "quire-server", version, about = "Real-time collaborative document sync")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept WebSocket connections
    Serve {
        /// Override the listen address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Compact stored update logs
    Compact {
        /// Only this room (raw identifier, e.g. `page:abc`)
        #[arg(long)]
        room: Option<String>,
        /// Override the database directory
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            Ok(ServerConfig::from_toml_file(path)?)
        }
        None => {
            info!("Using default config");
            Ok(ServerConfig::default())
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server = SyncServer::with_directory(config)?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    server.shutdown().await?;
    Ok(())
}

fn compact(config: ServerConfig, room: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(UpdateLogStore::open(config.store)?);
    let compactor = Compactor::new(store.clone());

    match room {
        Some(raw) => {
            let key = RoomKey::derive(&raw);
            if compactor.compact_one(&key)? {
                println!("Compacted {raw}");
            } else {
                println!("No updates for {raw}");
            }
        }
        None => {
            let rooms = compactor.compact_all()?;
            println!("Compacted rooms: {rooms}");
        }
    }
    store.sync()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            serve(config).await
        }
        Command::Compact { room, db } => {
            if let Some(db) = db {
                config.store.path = db;
            }
            compact(config, room)
        }
    }
}
