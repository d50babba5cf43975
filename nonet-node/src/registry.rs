//! Peer registry: username → outbound queue of that peer's connection.
//!
//! One instance per session, shared by the session coordinator, every connection task and
//! the send API. All operations take a short exclusive section over the map and never
//! wait on network I/O: sends only push onto the peer's unbounded queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nonet_core::wire::encode_line;
use nonet_core::{LineEncodeError, PeerId, SessionEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::sink::EventSink;

/// Identifies one registered connection. Distinguishes a reconnect under the same
/// username from the connection it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Outbound side of one connection: its send queue and the token that closes it.
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closer: CancellationToken,
}

impl PeerHandle {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>, closer: CancellationToken) -> Self {
        Self { tx, closer }
    }

    fn enqueue(&self, line: Vec<u8>) -> bool {
        self.tx.send(line).is_ok()
    }

    fn close(&self) {
        self.closer.cancel();
    }
}

/// Outcome of [`PeerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added(ConnectionId),
    /// An entry for the same id existed and was closed.
    Replaced(ConnectionId),
    /// Registry already shut down; the handle was closed.
    Rejected,
}

/// Outcome of [`PeerRegistry::unregister_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// No entry for the id (explicit unregister or shutdown got there first).
    Absent,
    /// The id now belongs to a newer connection, which was left alone.
    Superseded,
}

/// Per-peer outcome of [`PeerRegistry::broadcast`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("no peer registered as {0}")]
    NotFound(String),
    #[error("peer {0} is no longer accepting messages")]
    Disconnected(PeerId),
    #[error("message cannot be sent as one line: {0}")]
    InvalidText(#[from] LineEncodeError),
}

struct Entry {
    conn: ConnectionId,
    handle: PeerHandle,
}

#[derive(Default)]
struct RegistryState {
    peers: HashMap<PeerId, Entry>,
    next_conn: u64,
    shut_down: bool,
}

impl RegistryState {
    fn roster(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

struct Inner {
    state: Mutex<RegistryState>,
    sink: Arc<dyn EventSink>,
}

/// Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<Inner>,
}

impl PeerRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState::default()),
                sink,
            }),
        }
    }

    // A panic while holding the lock cannot leave the map half-updated: every
    // mutation is a single insert or remove.
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a notification to this session's sink.
    pub fn notify(&self, event: SessionEvent) {
        self.inner.sink.deliver(event);
    }

    /// Add or replace the entry for `id`. A replaced handle is closed before the new one
    /// becomes visible to senders.
    pub fn register(&self, id: PeerId, handle: PeerHandle) -> Registration {
        let mut state = self.lock();
        if state.shut_down {
            handle.close();
            tracing::debug!(peer = %id, "registry shut down; rejecting registration");
            return Registration::Rejected;
        }
        let conn = ConnectionId(state.next_conn);
        state.next_conn += 1;
        let previous = state.peers.insert(id.clone(), Entry { conn, handle });
        match previous {
            Some(old) => {
                old.handle.close();
                tracing::info!(peer = %id, "replaced existing connection");
                Registration::Replaced(conn)
            }
            None => {
                tracing::debug!(peer = %id, "registered");
                self.notify(SessionEvent::RosterChanged(state.roster()));
                Registration::Added(conn)
            }
        }
    }

    /// Remove `id` and close its connection. Returns whether an entry existed.
    pub fn unregister(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.peers.remove(id) else {
            return false;
        };
        entry.handle.close();
        tracing::debug!(peer = %id, "unregistered");
        self.notify(SessionEvent::RosterChanged(state.roster()));
        true
    }

    /// Remove `id` only if it still maps to `conn`. Used by a connection's own inbound
    /// task so that a stale connection never evicts its replacement.
    pub fn unregister_connection(&self, id: &PeerId, conn: ConnectionId) -> Removal {
        let mut state = self.lock();
        match state.peers.get(id) {
            None => Removal::Absent,
            Some(entry) if entry.conn != conn => Removal::Superseded,
            Some(_) => {
                if let Some(entry) = state.peers.remove(id) {
                    entry.handle.close();
                }
                tracing::debug!(peer = %id, "unregistered after disconnect");
                self.notify(SessionEvent::RosterChanged(state.roster()));
                Removal::Removed
            }
        }
    }

    /// Queue `text` for `id`. Never waits on the socket.
    pub fn send_to(&self, id: &str, text: &str) -> Result<(), SendError> {
        let line = encode_line(text)?;
        let state = self.lock();
        let Some((peer, entry)) = state.peers.get_key_value(id) else {
            tracing::warn!(peer = %id, "send to unknown peer");
            return Err(SendError::NotFound(id.to_string()));
        };
        if entry.handle.enqueue(line) {
            Ok(())
        } else {
            tracing::warn!(peer = %peer, "outbound queue closed");
            Err(SendError::Disconnected(peer.clone()))
        }
    }

    /// Queue `text` for every peer registered right now. A closed queue is reported
    /// in `failed` and does not affect the other peers.
    pub fn broadcast(&self, text: &str) -> Result<BroadcastReport, SendError> {
        let line = encode_line(text)?;
        let state = self.lock();
        let mut report = BroadcastReport::default();
        for (id, entry) in &state.peers {
            if entry.handle.enqueue(line.clone()) {
                report.delivered.push(id.clone());
            } else {
                tracing::warn!(peer = %id, "broadcast: outbound queue closed");
                report.failed.push(id.clone());
            }
        }
        report.delivered.sort();
        report.failed.sort();
        Ok(report)
    }

    /// Close every connection and refuse further registrations.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        let had_peers = !state.peers.is_empty();
        for (id, entry) in state.peers.drain() {
            entry.handle.close();
            tracing::debug!(peer = %id, "closed on shutdown");
        }
        if had_peers {
            self.notify(SessionEvent::RosterChanged(Vec::new()));
        }
        tracing::info!("peer registry shut down");
    }

    /// Registered identifiers, sorted.
    pub fn roster(&self) -> Vec<PeerId> {
        self.lock().roster()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }
}
