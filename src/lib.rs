//! Real-time voice relay.
//!
//! Clients join with a `NAME:` handshake and then stream opaque audio
//! chunks. By default every chunk is fanned out to the whole lobby; once
//! two clients agree on a call (`/call`, `/accept`) their audio flows only
//! between them until `/end` or a disconnect.

pub mod broadcast;
pub mod call;
pub mod client;
pub mod config;
pub mod conn;
pub mod directory;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod state;

pub use config::RelayConfig;
pub use server::Server;
pub use state::ServerState;
