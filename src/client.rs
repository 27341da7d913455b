//! Terminal front end: joins a relay, forwards typed lines, prints what
//! comes back. Audio devices are not driven from here; received frames
//! are only summarized.

use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::CHUNK_SIZE;
use crate::directory::{self, RegisterRequest};
use crate::identity::DeviceIdentity;
use crate::protocol::{self, Notice, SERVER_FULL};

const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub name: String,
    /// Numbering directory to ask for a `#number` suffix.
    pub directory: Option<String>,
    pub key_path: PathBuf,
    /// Address and port reported to the directory for this device.
    pub advertise_ip: String,
    pub voice_port: u16,
}

/// One decoded piece of what the relay sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    ServerFull,
    Notice(Notice),
    Audio(usize),
}

impl fmt::Display for Received {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Received::ServerFull => f.write_str("Server is full, try again later."),
            Received::Notice(Notice::IncomingCall(caller)) => {
                write!(f, "[call] {caller} is calling. Type /accept or /reject.")
            }
            Received::Notice(notice) => write!(f, "[server] {notice}"),
            Received::Audio(len) => write!(f, "[audio] {len} bytes"),
        }
    }
}

/// Splits a received chunk into notices, or treats it as one audio frame
/// when any part of it is not a control line.
pub fn decode(chunk: &[u8]) -> Vec<Received> {
    if chunk.starts_with(SERVER_FULL) {
        return vec![Received::ServerFull];
    }

    let notices: Option<Vec<Received>> = std::str::from_utf8(chunk).ok().and_then(|text| {
        text.lines()
            .filter(|line| !line.is_empty())
            .map(|line| Notice::parse(line).map(Received::Notice))
            .collect()
    });

    match notices {
        Some(notices) if !notices.is_empty() => notices,
        _ => vec![Received::Audio(chunk.len())],
    }
}

/// Name to announce: `name#number` when the directory answers, plain
/// `name` otherwise.
pub async fn display_name(opts: &ClientOptions) -> String {
    let Some(addr) = &opts.directory else {
        return opts.name.clone();
    };

    match lookup_number(opts, addr).await {
        Ok(number) => format!("{}#{}", opts.name, number),
        Err(e) => {
            warn!(directory = %addr, "no number assigned, using plain name: {e:#}");
            opts.name.clone()
        }
    }
}

async fn lookup_number(opts: &ClientOptions, addr: &str) -> Result<String> {
    let identity = DeviceIdentity::load_or_create(&opts.key_path)?;

    let req = RegisterRequest {
        device_id: identity.device_id(),
        public_key: identity.public_key_base64(),
        ip: opts.advertise_ip.clone(),
        port: opts.voice_port,
    };

    Ok(directory::request_number(addr, &req, DIRECTORY_TIMEOUT).await?)
}

pub async fn run(opts: ClientOptions) -> Result<()> {
    let name = display_name(&opts).await;

    let addr = format!("{}:{}", opts.host, opts.port);
    println!("Connecting to {addr}...");

    let socket = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;

    let (mut reader, mut writer) = socket.into_split();

    writer.write_all(&protocol::encode_handshake(&name)).await?;
    info!(%addr, name = %name, "connected");

    println!("Connected as '{name}'.");
    println!("Commands: /call <name>, /accept, /reject, /end, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    println!("Connection closed by server.");
                    break;
                }

                let received = decode(&buf[..n]);
                for item in &received {
                    println!("{item}");
                }
                if received.contains(&Received::ServerFull) {
                    break;
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };

                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" || line == "/exit" {
                    println!("Goodbye.");
                    break;
                }

                writer.write_all(format!("{line}\n").as_bytes()).await?;
            }
        }
    }

    Ok(())
}
