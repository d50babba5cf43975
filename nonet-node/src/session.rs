//! Session coordinator. Host role: listen, accept, handshake, attach. Peer role: dial the
//! host once, announce our username, attach the connection as "Host".

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use nonet_core::PeerId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{self, ConnectionOptions};
use crate::endpoint::{read_handshake, write_handshake, HandshakeError, LineReader};
use crate::registry::PeerRegistry;

/// Pause after a failed `accept` (e.g. out of file descriptors) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Accepting,
    Connecting,
    Handshaking,
    Running,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Listening => "listening",
            SessionState::Accepting => "accepting",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },
    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: HandshakeError,
    },
    #[error("peer registry is shut down")]
    RegistryClosed,
}

fn set_state(tx: &watch::Sender<SessionState>, next: SessionState) {
    let prev = tx.send_replace(next);
    if prev != next {
        tracing::debug!(from = %prev, to = %next, "session state");
    }
}

/// Host role. Owns the listening socket through its accept task.
pub struct HostSession {
    local_addr: SocketAddr,
    stop: CancellationToken,
    state: watch::Receiver<SessionState>,
    accept_task: JoinHandle<()>,
}

impl HostSession {
    /// Bind `bind` and start accepting peers into `registry`.
    pub async fn start(
        bind: SocketAddr,
        registry: PeerRegistry,
        options: ConnectionOptions,
    ) -> Result<Self, SessionError> {
        let (state_tx, state) = watch::channel(SessionState::Listening);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| SessionError::Bind { addr: bind, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| SessionError::Bind { addr: bind, source })?;
        tracing::info!(addr = %local_addr, "listening for peers");

        let stop = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry,
            options,
            stop.clone(),
            state_tx,
        ));
        Ok(Self {
            local_addr,
            stop,
            state,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Close the listening socket. Registered peers stay connected until they leave or
    /// the registry is shut down.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.accept_task.await {
            tracing::warn!(error = %e, "accept task ended abnormally");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: PeerRegistry,
    options: ConnectionOptions,
    stop: CancellationToken,
    state: watch::Sender<SessionState>,
) {
    set_state(&state, SessionState::Accepting);
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!(addr = %addr, "accepted connection");
                // Handshake off the accept loop so a silent client cannot stall it.
                tokio::spawn(admit_peer(stream, addr, registry.clone(), options.clone()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    drop(listener);
    set_state(&state, SessionState::Stopped);
    tracing::info!("stopped accepting peers");
}

async fn admit_peer(
    stream: TcpStream,
    addr: SocketAddr,
    registry: PeerRegistry,
    options: ConnectionOptions,
) {
    if registry.is_shut_down() {
        tracing::debug!(addr = %addr, "session closing; connection dropped before handshake");
        return;
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);
    let peer = match read_handshake(&mut reader, options.handshake_timeout).await {
        Ok(peer) => peer,
        Err(e) => {
            tracing::warn!(addr = %addr, error = %e, "handshake failed; dropping connection");
            return;
        }
    };
    match connection::attach(peer.clone(), reader, write_half, &registry, &options) {
        Some(_) => tracing::info!(peer = %peer, addr = %addr, "peer joined"),
        None => tracing::debug!(peer = %peer, "session closing; connection dropped"),
    }
}

/// Peer role: a single connection to the host, registered as "Host".
pub struct PeerSession {
    host_addr: SocketAddr,
    state: watch::Receiver<SessionState>,
    watcher: JoinHandle<()>,
}

impl PeerSession {
    /// Dial `host`, announce `me`, and attach the connection. No retry on failure.
    pub async fn connect(
        host: SocketAddr,
        me: &PeerId,
        registry: PeerRegistry,
        options: ConnectionOptions,
    ) -> Result<Self, SessionError> {
        let (state_tx, state) = watch::channel(SessionState::Connecting);
        tracing::info!(addr = %host, "connecting to host");
        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(host))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(SessionError::Connect { addr: host, source }),
            Err(_) => {
                return Err(SessionError::ConnectTimeout {
                    addr: host,
                    timeout: options.connect_timeout,
                })
            }
        };

        set_state(&state_tx, SessionState::Handshaking);
        let (read_half, mut write_half) = stream.into_split();
        write_handshake(&mut write_half, me)
            .await
            .map_err(|source| SessionError::Handshake { addr: host, source })?;

        let pump = connection::attach(
            PeerId::host(),
            LineReader::new(read_half),
            write_half,
            &registry,
            &options,
        )
        .ok_or(SessionError::RegistryClosed)?;
        set_state(&state_tx, SessionState::Running);
        tracing::info!(addr = %host, me = %me, "joined session");

        let watcher = tokio::spawn(async move {
            if let Err(e) = pump.await {
                tracing::warn!(error = %e, "inbound task ended abnormally");
            }
            set_state(&state_tx, SessionState::Stopped);
        });
        Ok(Self {
            host_addr: host,
            state,
            watcher,
        })
    }

    pub fn host_addr(&self) -> SocketAddr {
        self.host_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the connection to the host has ended.
    pub async fn closed(self) {
        let _ = self.watcher.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nonet_core::SessionEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::test_io::FailingWriter;
    use crate::registry::SendError;

    type Events = mpsc::UnboundedReceiver<SessionEvent>;

    fn registry() -> (PeerRegistry, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerRegistry::new(Arc::new(tx)), rx)
    }

    fn id(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn wait_for(rx: &mut Events, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("sink closed");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn wait_joined(rx: &mut Events, name: &str) {
        let want = SessionEvent::PeerJoined(id(name));
        wait_for(rx, |e| *e == want).await;
    }

    async fn wait_message(rx: &mut Events) -> (PeerId, String) {
        match wait_for(rx, |e| matches!(e, SessionEvent::Message(_))).await {
            SessionEvent::Message(msg) => (msg.sender, msg.content),
            _ => unreachable!(),
        }
    }

    async fn join(host: &HostSession, name: &str) -> (PeerSession, PeerRegistry, Events) {
        let (reg, events) = registry();
        let session = PeerSession::connect(
            host.local_addr(),
            &id(name),
            reg.clone(),
            ConnectionOptions::default(),
        )
        .await
        .unwrap();
        (session, reg, events)
    }

    #[tokio::test]
    async fn host_sends_to_registered_peer() {
        let (host_reg, mut host_events) = registry();
        let host = HostSession::start(loopback(), host_reg.clone(), ConnectionOptions::default())
            .await
            .unwrap();
        let (alice, alice_reg, mut alice_events) = join(&host, "alice").await;
        assert_eq!(alice.state(), SessionState::Running);
        assert_eq!(alice_reg.roster(), vec![PeerId::host()]);

        wait_joined(&mut host_events, "alice").await;
        host_reg.send_to("alice", "hello").unwrap();
        assert_eq!(
            wait_message(&mut alice_events).await,
            (PeerId::host(), "hello".to_string())
        );
    }

    #[tokio::test]
    async fn peer_sends_to_host() {
        let (host_reg, mut host_events) = registry();
        let host = HostSession::start(loopback(), host_reg, ConnectionOptions::default())
            .await
            .unwrap();
        let (_alice, alice_reg, _alice_events) = join(&host, "alice").await;
        wait_joined(&mut host_events, "alice").await;

        alice_reg.send_to("Host", "hi host").unwrap();
        assert_eq!(
            wait_message(&mut host_events).await,
            (id("alice"), "hi host".to_string())
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() {
        let (host_reg, mut host_events) = registry();
        let host = HostSession::start(loopback(), host_reg.clone(), ConnectionOptions::default())
            .await
            .unwrap();
        let (_alice, _ra, mut alice_events) = join(&host, "alice").await;
        let (_bob, _rb, mut bob_events) = join(&host, "bob").await;
        wait_joined(&mut host_events, "alice").await;
        wait_joined(&mut host_events, "bob").await;

        let report = host_reg.broadcast("hi all").unwrap();
        assert_eq!(report.delivered, vec![id("alice"), id("bob")]);
        assert!(report.failed.is_empty());
        for events in [&mut alice_events, &mut bob_events] {
            assert_eq!(
                wait_message(events).await,
                (PeerId::host(), "hi all".to_string())
            );
        }
    }

    #[tokio::test]
    async fn abrupt_close_removes_peer() {
        let (host_reg, mut host_events) = registry();
        let host = HostSession::start(loopback(), host_reg.clone(), ConnectionOptions::default())
            .await
            .unwrap();
        let mut raw = TcpStream::connect(host.local_addr()).await.unwrap();
        raw.write_all(b"carol\n").await.unwrap();
        wait_joined(&mut host_events, "carol").await;
        assert!(host_reg.contains("carol"));

        drop(raw);
        wait_for(&mut host_events, |e| {
            matches!(e, SessionEvent::RosterChanged(r) if r.is_empty())
        })
        .await;
        assert_eq!(
            wait_for(&mut host_events, |e| matches!(e, SessionEvent::PeerLost(_))).await,
            SessionEvent::PeerLost(id("carol"))
        );
        assert_eq!(
            host_reg.send_to("carol", "still there?"),
            Err(SendError::NotFound("carol".into()))
        );
    }

    #[tokio::test]
    async fn empty_handshake_is_dropped() {
        let (host_reg, _host_events) = registry();
        let host = HostSession::start(loopback(), host_reg.clone(), ConnectionOptions::default())
            .await
            .unwrap();
        let mut raw = TcpStream::connect(host.local_addr()).await.unwrap();
        raw.write_all(b"\n").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(host_reg.is_empty());
    }

    #[tokio::test]
    async fn silent_client_is_dropped_after_handshake_timeout() {
        let (host_reg, _host_events) = registry();
        let options = ConnectionOptions {
            handshake_timeout: Duration::from_millis(100),
            ..ConnectionOptions::default()
        };
        let host = HostSession::start(loopback(), host_reg.clone(), options)
            .await
            .unwrap();
        let mut raw = TcpStream::connect(host.local_addr()).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(host_reg.is_empty());
    }

    #[tokio::test]
    async fn duplicate_username_replaces_previous_connection() {
        let (host_reg, mut host_events) = registry();
        let host = HostSession::start(loopback(), host_reg.clone(), ConnectionOptions::default())
            .await
            .unwrap();
        let (first, _r1, mut first_events) = join(&host, "alice").await;
        wait_joined(&mut host_events, "alice").await;
        let (_second, _r2, mut second_events) = join(&host, "alice").await;
        wait_joined(&mut host_events, "alice").await;

        // The first connection is closed by the host.
        tokio::time::timeout(Duration::from_secs(5), first.closed())
            .await
            .unwrap();
        wait_for(&mut first_events, |e| matches!(e, SessionEvent::PeerLost(_))).await;

        host_reg.send_to("alice", "to the new one").unwrap();
        assert_eq!(
            wait_message(&mut second_events).await,
            (PeerId::host(), "to the new one".to_string())
        );
        assert_eq!(host_reg.roster(), vec![id("alice")]);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let listener = TcpListener::bind(loopback()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (reg, _events) = registry();
        let err = PeerSession::connect(addr, &id("alice"), reg.clone(), ConnectionOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SessionError::Connect { .. } | SessionError::ConnectTimeout { .. }
        ));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn stop_closes_listener_but_keeps_peers() {
        let (host_reg, mut host_events) = registry();
        let host = HostSession::start(loopback(), host_reg.clone(), ConnectionOptions::default())
            .await
            .unwrap();
        let addr = host.local_addr();
        let state = host.subscribe();
        let (_alice, _ra, mut alice_events) = join(&host, "alice").await;
        wait_joined(&mut host_events, "alice").await;

        host.stop().await;
        assert_eq!(*state.borrow(), SessionState::Stopped);
        assert!(TcpStream::connect(addr).await.is_err());

        host_reg.send_to("alice", "still here").unwrap();
        assert_eq!(
            wait_message(&mut alice_events).await,
            (PeerId::host(), "still here".to_string())
        );
    }

    #[tokio::test]
    async fn registry_shutdown_disconnects_peers() {
        let (host_reg, mut host_events) = registry();
        let host = HostSession::start(loopback(), host_reg.clone(), ConnectionOptions::default())
            .await
            .unwrap();
        let (alice, _ra, _alice_events) = join(&host, "alice").await;
        wait_joined(&mut host_events, "alice").await;

        host_reg.shutdown();
        tokio::time::timeout(Duration::from_secs(5), alice.closed())
            .await
            .unwrap();
        assert_eq!(
            wait_for(&mut host_events, |e| matches!(e, SessionEvent::PeerLost(_))).await,
            SessionEvent::PeerLost(id("alice"))
        );
        host.stop().await;
    }

    #[tokio::test]
    async fn connections_after_registry_shutdown_are_dropped() {
        let (host_reg, _host_events) = registry();
        let host = HostSession::start(loopback(), host_reg.clone(), ConnectionOptions::default())
            .await
            .unwrap();
        host_reg.shutdown();

        let mut late = TcpStream::connect(host.local_addr()).await.unwrap();
        let _ = late.write_all(b"late\n").await;
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), late.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(host_reg.is_empty());
        host.stop().await;
    }

    #[tokio::test]
    async fn broadcast_survives_a_peer_whose_writes_fail() {
        let (host_reg, mut host_events) = registry();
        let host = HostSession::start(loopback(), host_reg.clone(), ConnectionOptions::default())
            .await
            .unwrap();
        let (_alice, _ra, mut alice_events) = join(&host, "alice").await;
        wait_joined(&mut host_events, "alice").await;
        let (_bob, _rb, mut bob_events) = join(&host, "bob").await;
        wait_joined(&mut host_events, "bob").await;

        let (_carol_client, carol_server) = tokio::io::duplex(64);
        connection::attach(
            id("carol"),
            LineReader::new(carol_server),
            FailingWriter,
            &host_reg,
            &ConnectionOptions::default(),
        )
        .unwrap();

        let report = host_reg.broadcast("hi all").unwrap();
        assert_eq!(report.delivered, vec![id("alice"), id("bob"), id("carol")]);
        assert!(report.failed.is_empty());
        for events in [&mut alice_events, &mut bob_events] {
            assert_eq!(
                wait_message(events).await,
                (PeerId::host(), "hi all".to_string())
            );
        }

        let lost = SessionEvent::PeerLost(id("carol"));
        wait_for(&mut host_events, |e| *e == lost).await;
        assert_eq!(host_reg.roster(), vec![id("alice"), id("bob")]);

        host_reg.broadcast("again").unwrap();
        assert_eq!(
            wait_message(&mut alice_events).await,
            (PeerId::host(), "again".to_string())
        );
        assert_eq!(
            wait_message(&mut bob_events).await,
            (PeerId::host(), "again".to_string())
        );
        host.stop().await;
    }
}
