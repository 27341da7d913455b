use anyhow::Result;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, warn};

use crate::protocol::{self, Inbound, Notice, Outbound, SERVER_FULL};
use crate::registry::ConnId;
use crate::shutdown;
use crate::state::ServerState;

/// How long a turned-away client gets to stop talking before the socket
/// is dropped. Unread input at close time would turn our FIN into a RST.
const TURN_AWAY_LINGER: Duration = Duration::from_millis(200);

/// How long a departing client's writer may keep flushing queued notices.
const WRITER_DRAIN: Duration = Duration::from_millis(500);

pub async fn handle(state: ServerState, socket: TcpStream, peer: SocketAddr) -> Result<()> {
    let id = state.next_conn_id();

    let (mut reader, mut writer) = socket.into_split();

    if state.registry.is_full() {
        return turn_away(reader, writer, peer).await;
    }

    let mut stop = state.shutdown.subscribe();

    let mut buf = vec![0u8; state.config.handshake_size];

    let read = tokio::select! {
        read = reader.read(&mut buf) => read,
        _ = shutdown::stopped(&mut stop) => return Ok(()),
    };

    let n = match read {
        Ok(0) => {
            debug!(%peer, "closed before handshake");
            return Ok(());
        }
        Ok(n) => n,
        Err(e) => {
            debug!(%peer, error = %e, "failed before handshake");
            return Ok(());
        }
    };

    let (name, trailing) = match protocol::parse_handshake(&buf[..n]) {
        Ok(hs) => (hs.name, hs.trailing),
        Err(e) => {
            warn!(%peer, error = %e, "malformed handshake, continuing without a name");
            (String::new(), &[][..])
        }
    };

    let (tx, rx) = mpsc::channel(state.config.outbound_capacity);
    let close = Arc::new(Notify::new());

    // Another session may have taken the last slot since the check above.
    if let Err(e) = state.registry.register(id, name.clone(), tx, Arc::clone(&close)) {
        debug!(%peer, error = %e, "registration refused");
        return turn_away(reader, writer, peer).await;
    }

    info!(conn = %id, %peer, name = %name, "client joined");

    let mut writer_task = tokio::spawn(write_loop(id, rx, writer));

    state
        .registry
        .broadcast_control(Notice::Joined(name), Some(id));

    if !trailing.iter().all(u8::is_ascii_whitespace) {
        process(&state, id, trailing);
    }

    if let Err(e) = read_loop(&state, id, &mut reader, &close, &mut stop).await {
        debug!(conn = %id, error = %e, "connection fault");
    }

    depart(&state, id, peer);

    // The registry held the only sender, so the queue is closed now and the
    // writer stops once it has flushed what is left.
    if tokio::time::timeout(WRITER_DRAIN, &mut writer_task).await.is_err() {
        debug!(conn = %id, "writer did not drain in time");
        writer_task.abort();
    }

    Ok(())
}

/// Cleanup on disconnect. Unregistering comes first so no new call can
/// find this connection once its call state has been torn down.
fn depart(state: &ServerState, id: ConnId, peer: SocketAddr) {
    let left = state.registry.unregister(id);

    state.calls.on_disconnect(id);

    match left {
        Ok(name) => {
            state.registry.broadcast_control(Notice::Left(name.clone()), None);
            info!(conn = %id, %peer, name = %name, "client left");
        }
        Err(e) => debug!(conn = %id, error = %e, "already unregistered"),
    }
}

async fn read_loop(
    state: &ServerState,
    id: ConnId,
    reader: &mut OwnedReadHalf,
    close: &Notify,
    stop: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let mut buf = vec![0u8; state.config.chunk_size];

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = close.notified() => {
                debug!(conn = %id, "closed by relay");
                return Ok(());
            }
            _ = shutdown::stopped(stop) => return Ok(()),
        };

        if n == 0 {
            return Ok(());
        }

        process(state, id, &buf[..n]);
    }
}

fn process(state: &ServerState, id: ConnId, chunk: &[u8]) {
    match protocol::classify(chunk) {
        Inbound::Commands(lines) => {
            for line in lines {
                match protocol::parse_command(line) {
                    Ok(cmd) => state.calls.dispatch(id, cmd),
                    Err(e) => {
                        state.registry.send(id, Notice::Error(e.to_string()));
                    }
                }
            }
        }
        Inbound::Audio(frame) => {
            state.engine.route(frame, id);
        }
    }
}

/// Drains one connection's outbound queue onto its socket. Ends when the
/// queue closes or the socket stops accepting writes.
async fn write_loop(id: ConnId, mut rx: mpsc::Receiver<Outbound>, mut writer: OwnedWriteHalf) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = writer.write_all(&msg.bytes()).await {
            debug!(conn = %id, error = %e, "write failed");
            break;
        }
    }
}

async fn turn_away(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
) -> Result<()> {
    info!(%peer, "relay full, turning client away");

    writer.write_all(SERVER_FULL).await?;
    writer.shutdown().await?;

    let mut sink = [0u8; 1024];
    let _ = tokio::time::timeout(TURN_AWAY_LINGER, async {
        while let Ok(n) = reader.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;

    Ok(())
}
