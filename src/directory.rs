//! Numbering directory: hands each device a short number it keeps.
//!
//! One JSON request per TCP connection. The client writes a
//! [`RegisterRequest`] and half-closes; the directory answers with a
//! [`RegisterResponse`] and closes. Assignments are persisted as JSON so a
//! device gets the same number after a restart.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::DirectoryError;
use crate::shutdown;

const FIRST_NUMBER: u16 = 100;
const LAST_NUMBER: u16 = 999;
const MAX_REQUEST: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub device_id: String,
    pub public_key: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RegisterResponse {
    Ok { number: String },
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub device_id: String,
    pub public_key: String,
    pub ip: String,
    pub port: u16,
}

impl From<RegisterRequest> for DirectoryEntry {
    fn from(req: RegisterRequest) -> Self {
        Self {
            device_id: req.device_id,
            public_key: req.public_key,
            ip: req.ip,
            port: req.port,
        }
    }
}

pub struct Directory {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, DirectoryEntry>>,
}

impl Directory {
    /// Opens the store at `path`; a missing file means an empty directory.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, DirectoryError> {
        let path = path.into();

        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the device's existing number, or assigns the lowest free one.
    pub async fn assign(&self, req: RegisterRequest) -> Result<String, DirectoryError> {
        let mut entries = self.entries.lock().await;

        if let Some((number, _)) = entries.iter().find(|(_, e)| e.device_id == req.device_id) {
            return Ok(number.clone());
        }

        let number = (FIRST_NUMBER..=LAST_NUMBER)
            .map(|n| n.to_string())
            .find(|n| !entries.contains_key(n))
            .ok_or(DirectoryError::Exhausted)?;

        entries.insert(number.clone(), req.into());

        let raw = serde_json::to_vec_pretty(&*entries)?;
        tokio::fs::write(&self.path, raw).await?;

        Ok(number)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Answers registration requests until `stop` flips.
pub async fn serve(
    listener: TcpListener,
    directory: Arc<Directory>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, path = %directory.path().display(), "directory listening");

    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown::stopped(&mut stop) => break,
        };

        let directory = Arc::clone(&directory);

        tokio::spawn(async move {
            if let Err(err) = answer(&directory, socket, peer).await {
                debug!(%peer, "directory request failed: {err:#}");
            }
        });
    }

    info!("directory stopped");
    Ok(())
}

async fn answer(directory: &Directory, mut socket: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut raw = Vec::new();
    (&mut socket).take(MAX_REQUEST).read_to_end(&mut raw).await?;

    let response = match serde_json::from_slice::<RegisterRequest>(&raw) {
        Ok(req) => match directory.assign(req).await {
            Ok(number) => {
                info!(%peer, number = %number, "number assigned");
                RegisterResponse::Ok { number }
            }
            Err(e) => {
                warn!(%peer, error = %e, "assignment failed");
                RegisterResponse::Error {
                    error: e.to_string(),
                }
            }
        },
        Err(e) => RegisterResponse::Error {
            error: e.to_string(),
        },
    };

    socket.write_all(&serde_json::to_vec(&response)?).await?;
    socket.shutdown().await?;

    Ok(())
}

/// Client side: asks the directory at `addr` for this device's number.
pub async fn request_number(
    addr: &str,
    req: &RegisterRequest,
    timeout: Duration,
) -> Result<String, DirectoryError> {
    let exchange = async {
        let mut socket = TcpStream::connect(addr).await?;
        socket.write_all(&serde_json::to_vec(req)?).await?;
        socket.shutdown().await?;

        let mut raw = Vec::new();
        socket.take(MAX_REQUEST).read_to_end(&mut raw).await?;

        Ok::<_, DirectoryError>(serde_json::from_slice::<RegisterResponse>(&raw)?)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Err(_) => Err(DirectoryError::Timeout),
        Ok(Err(e)) => Err(e),
        Ok(Ok(RegisterResponse::Ok { number })) => Ok(number),
        Ok(Ok(RegisterResponse::Error { error })) => Err(DirectoryError::Rejected(error)),
    }
}
