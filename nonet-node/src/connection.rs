//! Per-connection workers: the inbound pump (reads lines, feeds the sink) and the
//! outbound dispatcher (drains the peer's queue onto the socket in order).

use std::io;
use std::time::Duration;

use nonet_core::{
    ChatMessage, PeerId, SessionEvent, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_HANDSHAKE_TIMEOUT_MS,
};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::endpoint::{write_line, LineReader};
use crate::registry::{ConnectionId, PeerHandle, PeerRegistry, Registration, Removal};

/// What the dispatcher does when a write to the peer fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteFailurePolicy {
    /// Close the connection; the inbound pump then unregisters the peer.
    #[default]
    Disconnect,
    /// Log and keep the peer registered.
    Keep,
}

/// Timeouts and policies applied to every connection of a session.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// No read timeout when `None`; a dead peer is then noticed only by an I/O error.
    pub read_timeout: Option<Duration>,
    pub on_write_failure: WriteFailurePolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            read_timeout: None,
            on_write_failure: WriteFailurePolicy::default(),
        }
    }
}

/// Register a handshaken connection under `peer` and start its workers.
/// Returns the inbound pump's task, or `None` if the registry is shut down (the
/// connection is dropped).
pub fn attach<R, W>(
    peer: PeerId,
    reader: LineReader<R>,
    writer: W,
    registry: &PeerRegistry,
    options: &ConnectionOptions,
) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let closer = CancellationToken::new();
    let conn = match registry.register(peer.clone(), PeerHandle::new(tx, closer.clone())) {
        Registration::Added(conn) | Registration::Replaced(conn) => conn,
        Registration::Rejected => return None,
    };
    registry.notify(SessionEvent::PeerJoined(peer.clone()));

    tokio::spawn(run_dispatcher(
        writer,
        rx,
        closer.clone(),
        peer.clone(),
        options.on_write_failure,
    ));
    Some(tokio::spawn(run_inbound_pump(
        reader,
        peer,
        conn,
        registry.clone(),
        closer,
        options.read_timeout,
    )))
}

async fn run_dispatcher<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closer: CancellationToken,
    peer: PeerId,
    policy: WriteFailurePolicy,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            next = rx.recv() => match next {
                Some(line) => line,
                None => break,
            },
        };
        let written = tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            r = write_line(&mut writer, &line) => r,
        };
        if let Err(e) = written {
            tracing::warn!(peer = %peer, error = %e, "write failed");
            if policy == WriteFailurePolicy::Disconnect {
                closer.cancel();
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!(peer = %peer, "dispatcher stopped");
}

async fn run_inbound_pump<R>(
    mut reader: LineReader<R>,
    peer: PeerId,
    conn: ConnectionId,
    registry: PeerRegistry,
    closer: CancellationToken,
    read_timeout: Option<Duration>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = closer.cancelled() => {
                tracing::debug!(peer = %peer, "connection closed locally");
                break;
            }
            next = read_next(&mut reader, read_timeout) => next,
        };
        match next {
            Ok(Some(line)) => {
                tracing::trace!(peer = %peer, len = line.len(), "received line");
                registry.notify(SessionEvent::Message(ChatMessage::incoming(
                    peer.clone(),
                    line,
                )));
            }
            Ok(None) => {
                tracing::info!(peer = %peer, "peer closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "read failed");
                break;
            }
        }
    }
    closer.cancel();
    drop(reader);
    match registry.unregister_connection(&peer, conn) {
        Removal::Superseded => {
            tracing::debug!(peer = %peer, "stale connection ended; newer one stays registered");
        }
        Removal::Removed | Removal::Absent => {
            registry.notify(SessionEvent::PeerLost(peer));
        }
    }
}

async fn read_next<R: AsyncRead + Unpin>(
    reader: &mut LineReader<R>,
    limit: Option<Duration>,
) -> io::Result<Option<String>> {
    match limit {
        None => reader.next_line().await,
        Some(limit) => tokio::time::timeout(limit, reader.next_line())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?,
    }
}
