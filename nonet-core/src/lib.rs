//! NoNet chat protocol core.
//! No I/O: peer identity, message and notification types, newline framing.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use identity::{IdentityError, PeerId, HOST_PEER_ID};
pub use protocol::{
    now_millis, ChatMessage, Recipient, SessionEvent, SessionRole, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_PORT,
};
pub use wire::{decode_line, decode_trailing, encode_line, LineDecodeError, LineEncodeError};
