//! NoNet chat node: the peer-connection and message-routing layer.
//!
//! A session has one host and any number of peers in a star. The host accepts TCP
//! connections, reads each peer's username from the first line and registers the
//! connection in a [`PeerRegistry`]; a peer dials the host once and registers it as
//! `"Host"`. Every registered connection gets an inbound pump feeding an [`EventSink`]
//! and an outbound dispatcher draining its queue in order.

pub mod config;
pub mod connection;
pub mod console;
pub mod endpoint;
pub mod registry;
pub mod session;
pub mod sink;

pub use connection::{attach, ConnectionOptions, WriteFailurePolicy};
pub use endpoint::{HandshakeError, LineReader};
pub use registry::{BroadcastReport, PeerHandle, PeerRegistry, Registration, SendError};
pub use session::{HostSession, PeerSession, SessionError, SessionState};
pub use sink::EventSink;
