//! Runtime settings for the relay and the numbering directory.
//!
//! `main` fills these from command-line flags, each of which falls back to
//! an environment variable (a `.env` file is honoured through `dotenvy`).

use std::path::PathBuf;

pub const MAX_CLIENTS: usize = 10;
pub const CHUNK_SIZE: usize = 4096;
pub const HANDSHAKE_SIZE: usize = 1024;
pub const OUTBOUND_CAPACITY: usize = 256;

pub const DEFAULT_RELAY_ADDR: &str = "0.0.0.0:8081";
pub const DEFAULT_DIRECTORY_ADDR: &str = "0.0.0.0:9000";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    /// Upper bound on registered connections.
    pub max_clients: usize,
    /// Largest chunk read from a client in one go; one chunk is one frame.
    pub chunk_size: usize,
    /// Largest read accepted for the `NAME:` handshake.
    pub handshake_size: usize,
    /// Queued outbound items per connection before new ones are dropped.
    pub outbound_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_RELAY_ADDR.to_string(),
            max_clients: MAX_CLIENTS,
            chunk_size: CHUNK_SIZE,
            handshake_size: HANDSHAKE_SIZE,
            outbound_capacity: OUTBOUND_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub listen_addr: String,
    pub db_path: PathBuf,
}
