//! Peer identity: usernames declared in the handshake line, default username generation.

use std::borrow::Borrow;
use std::fmt;

use rand::Rng;
use serde::Deserialize;

/// Logical identifier under which a peer registers the session host.
pub const HOST_PEER_ID: &str = "Host";

/// Prefix of generated usernames ("User" + 0..1000).
pub const DEFAULT_USERNAME_PREFIX: &str = "User";

/// Peer identifier: the username a connecting party declares as its first line.
/// Non-empty, no line terminators. Immutable once constructed.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Validate a username. Surrounding whitespace is trimmed; the rest must be non-empty
    /// and must not contain `\r` or `\n`.
    pub fn new(name: &str) -> Result<Self, IdentityError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        if trimmed.contains(['\r', '\n']) {
            return Err(IdentityError::LineBreak);
        }
        Ok(PeerId(trimmed.to_string()))
    }

    /// Parse the first line read from an accepted connection.
    pub fn from_handshake_line(line: &str) -> Result<Self, IdentityError> {
        Self::new(line)
    }

    /// The identifier a peer uses for its single connection to the host.
    pub fn host() -> Self {
        PeerId(HOST_PEER_ID.to_string())
    }

    /// Random default username, e.g. `User417`.
    pub fn generate() -> Self {
        let n: u16 = rand::thread_rng().gen_range(0..1000);
        PeerId(format!("{DEFAULT_USERNAME_PREFIX}{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Handshake line as written by the connecting side, terminator included.
    pub fn handshake_line(&self) -> String {
        format!("{}\n", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PeerId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PeerId::new(&value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl std::str::FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PeerId::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("peer identifier is empty")]
    Empty,
    #[error("peer identifier contains a line break")]
    LineBreak,
}
