use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("relay is at capacity")]
    CapacityExceeded,
    #[error("connection is not registered")]
    NotFound,
    #[error("connection is already registered")]
    AlreadyRegistered,
}

/// A client sent something the relay cannot interpret.
///
/// The `Display` text is what the client sees in the error notice.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handshake must start with NAME:")]
    MissingName,
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    MissingArgument(&'static str),
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("directory payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("directory full")]
    Exhausted,
    #[error("directory refused: {0}")]
    Rejected(String),
    #[error("directory did not answer in time")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file is not base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),
}
