use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use voice_relay::client::{self, ClientOptions};
use voice_relay::config::{
    CHUNK_SIZE, DEFAULT_DIRECTORY_ADDR, DEFAULT_RELAY_ADDR, DirectoryConfig, HANDSHAKE_SIZE,
    MAX_CLIENTS, OUTBOUND_CAPACITY, RelayConfig,
};
use voice_relay::directory::{self, Directory};
use voice_relay::Server;

#[derive(Parser)]
#[command(name = "voice-relay", version, about = "Voice relay with lobby broadcast and private calls")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay.
    Serve {
        #[arg(long, env = "RELAY_LISTEN_ADDR", default_value = DEFAULT_RELAY_ADDR)]
        listen: String,
        #[arg(long, env = "RELAY_MAX_CLIENTS", default_value_t = MAX_CLIENTS)]
        max_clients: usize,
        #[arg(long, env = "RELAY_CHUNK_SIZE", default_value_t = CHUNK_SIZE)]
        chunk_size: usize,
        #[arg(long, env = "RELAY_OUTBOUND_CAPACITY", default_value_t = OUTBOUND_CAPACITY)]
        outbound_capacity: usize,
    },
    /// Run the numbering directory.
    Directory {
        #[arg(long, env = "DIRECTORY_LISTEN_ADDR", default_value = DEFAULT_DIRECTORY_ADDR)]
        listen: String,
        #[arg(long, env = "DIRECTORY_DB", default_value = "db.json")]
        db: PathBuf,
    },
    /// Join a relay from the terminal.
    Connect {
        host: String,
        port: u16,
        #[arg(long)]
        name: String,
        /// Directory address used to obtain a `#number` suffix.
        #[arg(long, env = "RELAY_DIRECTORY")]
        directory: Option<String>,
        #[arg(long, default_value = "device_key")]
        key: PathBuf,
        #[arg(long, default_value = "127.0.0.1")]
        advertise_ip: String,
        #[arg(long, default_value_t = 8081)]
        voice_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve {
            listen,
            max_clients,
            chunk_size,
            outbound_capacity,
        } => {
            let config = RelayConfig {
                listen_addr: listen,
                max_clients,
                chunk_size,
                handshake_size: HANDSHAKE_SIZE,
                outbound_capacity,
            };

            let server = Server::bind(config).await?;
            tokio::spawn(server.state().shutdown.on_ctrl_c());
            server.run().await
        }

        Command::Directory { listen, db } => {
            let config = DirectoryConfig {
                listen_addr: listen,
                db_path: db,
            };

            let directory = Arc::new(Directory::open(&config.db_path).await?);
            let listener = TcpListener::bind(&config.listen_addr).await?;

            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = stop_tx.send(true);
                }
            });

            directory::serve(listener, directory, stop_rx).await
        }

        Command::Connect {
            host,
            port,
            name,
            directory,
            key,
            advertise_ip,
            voice_port,
        } => {
            client::run(ClientOptions {
                host,
                port,
                name,
                directory,
                key_path: key,
                advertise_ip,
                voice_port,
            })
            .await
        }
    }
}
