//! Table of live connections and their display names.
//!
//! Each entry owns the sending half of that connection's outbound queue,
//! so every delivery is a non-blocking enqueue. Nothing here ever waits
//! on a socket.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::protocol::{Notice, Outbound};

/// Process-unique connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Peer {
    name: String,
    /// Registration order; earliest wins name lookups.
    seq: u64,
    tx: mpsc::Sender<Outbound>,
    /// Wakes the session's read loop so it tears itself down.
    close: Arc<Notify>,
}

pub struct Registry {
    peers: DashMap<ConnId, Peer>,
    occupied: AtomicUsize,
    max_clients: usize,
    next_seq: AtomicU64,
}

impl Registry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            peers: DashMap::new(),
            occupied: AtomicUsize::new(0),
            max_clients,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.occupied.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_clients
    }

    /// Adds a connection. The capacity check and the insert happen under
    /// the entry's shard lock, so concurrent registrations cannot overshoot.
    pub fn register(
        &self,
        id: ConnId,
        name: String,
        tx: mpsc::Sender<Outbound>,
        close: Arc<Notify>,
    ) -> Result<(), RegistryError> {
        match self.peers.entry(id) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered),
            Entry::Vacant(slot) => {
                let max = self.max_clients;
                self.occupied
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .map_err(|_| RegistryError::CapacityExceeded)?;

                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                slot.insert(Peer {
                    name,
                    seq,
                    tx,
                    close,
                });
                debug!(conn = %id, "registered");
                Ok(())
            }
        }
    }

    /// Removes a connection and returns its name. Safe to call twice.
    pub fn unregister(&self, id: ConnId) -> Result<String, RegistryError> {
        let (_, peer) = self.peers.remove(&id).ok_or(RegistryError::NotFound)?;
        self.occupied.fetch_sub(1, Ordering::SeqCst);
        debug!(conn = %id, "unregistered");
        Ok(peer.name)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn name_of(&self, id: ConnId) -> Option<String> {
        self.peers.get(&id).map(|peer| peer.name.clone())
    }

    /// Names are not unique: when several connections share one, the
    /// earliest registration is returned.
    pub fn lookup_by_name(&self, name: &str) -> Option<ConnId> {
        self.peers
            .iter()
            .filter(|entry| entry.value().name == name)
            .min_by_key(|entry| entry.value().seq)
            .map(|entry| *entry.key())
    }

    /// Point-in-time view in registration order.
    pub fn snapshot(&self) -> Vec<(ConnId, String)> {
        let mut rows: Vec<(u64, ConnId, String)> = self
            .peers
            .iter()
            .map(|entry| (entry.value().seq, *entry.key(), entry.value().name.clone()))
            .collect();

        rows.sort_by_key(|(seq, _, _)| *seq);

        rows.into_iter().map(|(_, id, name)| (id, name)).collect()
    }

    /// Enqueues one item for one connection. Returns `false` when the
    /// connection is gone or its queue is full; the item is then dropped.
    pub fn send(&self, id: ConnId, msg: impl Into<Outbound>) -> bool {
        let Some(tx) = self.peers.get(&id).map(|peer| peer.tx.clone()) else {
            debug!(conn = %id, "send to unregistered connection dropped");
            return false;
        };

        deliver(id, &tx, msg.into())
    }

    /// Enqueues `msg` for every connection except `excluding`.
    /// Returns how many queues accepted it.
    pub fn broadcast(&self, msg: impl Into<Outbound>, excluding: Option<ConnId>) -> usize {
        let msg = msg.into();

        let targets: Vec<(ConnId, mpsc::Sender<Outbound>)> = self
            .peers
            .iter()
            .filter(|entry| Some(*entry.key()) != excluding)
            .map(|entry| (*entry.key(), entry.value().tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in &targets {
            if deliver(*id, tx, msg.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn broadcast_control(&self, notice: Notice, excluding: Option<ConnId>) -> usize {
        self.broadcast(notice, excluding)
    }

    /// Asks the session behind `id` to close. Its own cleanup path does
    /// the unregistering.
    pub fn disconnect(&self, id: ConnId) -> bool {
        match self.peers.get(&id) {
            Some(peer) => {
                peer.close.notify_one();
                true
            }
            None => false,
        }
    }
}

fn deliver(id: ConnId, tx: &mpsc::Sender<Outbound>, msg: Outbound) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(conn = %id, "outbound queue full, dropping message");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(conn = %id, "outbound queue closed");
            false
        }
    }
}
