//! NoNet chat protocol: message types, session role, notifications and constants.

use chrono::Utc;

use crate::identity::PeerId;

/// TCP port the session host listens on.
pub const DEFAULT_PORT: u16 = 8888;

/// Connect timeout for the peer role, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 8000;

/// Bound on reading the handshake line from an accepted connection, in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Role of this device in a session. Decided by discovery before the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Host,
    Peer,
}

/// Addressee of a chat message: a named peer or this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Peer(PeerId),
    Local,
}

/// A single chat line, incoming or outgoing. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: uuid::Uuid,
    pub sender: PeerId,
    pub recipient: Recipient,
    pub content: String,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl ChatMessage {
    /// Message read from `sender`'s connection, addressed to this device.
    pub fn incoming(sender: PeerId, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            sender,
            recipient: Recipient::Local,
            content,
            timestamp: now_millis(),
        }
    }

    /// Message typed locally by `sender` for `recipient` (local echo).
    pub fn outgoing(sender: PeerId, recipient: PeerId, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            sender,
            recipient: Recipient::Peer(recipient),
            content,
            timestamp: now_millis(),
        }
    }
}

/// Notification delivered to the message sink (UI side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A line arrived from a registered peer.
    Message(ChatMessage),
    /// Handshake completed and the peer was registered.
    PeerJoined(PeerId),
    /// The peer's connection ended (end-of-stream, I/O error or shutdown).
    PeerLost(PeerId),
    /// The registry's key set changed. Sorted.
    RosterChanged(Vec<PeerId>),
}

/// Milliseconds since the Unix epoch; 0 if the clock is before the epoch.
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_is_addressed_to_self() {
        let msg = ChatMessage::incoming(PeerId::new("alice").unwrap(), "hi".into());
        assert_eq!(msg.recipient, Recipient::Local);
        assert_eq!(msg.sender.as_str(), "alice");
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn outgoing_keeps_recipient() {
        let msg = ChatMessage::outgoing(
            PeerId::new("User7").unwrap(),
            PeerId::host(),
            "hello".into(),
        );
        assert_eq!(msg.recipient, Recipient::Peer(PeerId::host()));
    }

    #[test]
    fn distinct_message_ids() {
        let a = ChatMessage::incoming(PeerId::host(), "x".into());
        let b = ChatMessage::incoming(PeerId::host(), "x".into());
        assert_ne!(a.id, b.id);
    }
}
