//! Core protocol types for the Weft feed
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};

/// 32-byte fixed-size array used for hashes and keys.
pub type Bytes32 = [u8; 32];

/// Event identifier: BLAKE3 over the canonical encoding of
/// (kind, author, timestamp, body).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub Bytes32);

impl EventId {
    /// Hex encoding of the full id.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Author identity: an ed25519 public key.
///
/// The stable string encoding used everywhere an author crosses a
/// human-readable boundary is lowercase hex of the raw key bytes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Author(pub Bytes32);

impl Author {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, crate::error::Error> {
        let bytes = hex::decode(s)
            .map_err(|_| crate::error::Error::InvalidPublicKey(s.to_string()))?;
        let arr: Bytes32 = bytes
            .try_into()
            .map_err(|_| crate::error::Error::InvalidPublicKey(s.to_string()))?;
        Ok(Author(arr))
    }

    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl std::fmt::Display for Author {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Event type discriminant.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Post = 0,
    Follow = 1,
    Unfollow = 2,
    Profile = 3,
}

/// Union of per-kind event content.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum EventBody {
    /// A post in a topic channel. `topic` is stored normalized
    /// (trimmed, lowercased, empty defaults to "general").
    Post { text: String, topic: String },
    /// Start following `target`. Optionally carries the follower's
    /// X25519 public key so the followee can encrypt toward them;
    /// the encryption scheme itself is opaque to this layer.
    Follow {
        target: Author,
        encryption_key: Option<Bytes32>,
    },
    /// Stop following `target`.
    Unfollow { target: Author },
    /// Display profile update. Latest per author wins.
    Profile { name: String, about: String },
}

impl EventBody {
    /// The kind this body belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Post { .. } => EventKind::Post,
            EventBody::Follow { .. } => EventKind::Follow,
            EventBody::Unfollow { .. } => EventKind::Unfollow,
            EventBody::Profile { .. } => EventKind::Profile,
        }
    }
}

/// Immutable, signed, content-addressed log record.
///
/// Invariants:
/// - `id == compute_event_id(kind, author, timestamp, &body)`
/// - `signature` verifies over `id || canonical_bytes(body)` against `author`
///
/// Events are never edited; corrections are new events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Content hash of (kind, author, timestamp, body)
    pub id: EventId,
    /// Event type discriminator
    pub kind: EventKind,
    /// Signing public key of the creator
    pub author: Author,
    /// Author-supplied creation time, unix millis
    pub timestamp: u64,
    /// Event payload
    pub body: EventBody,
    /// Ed25519 signature (64 bytes)
    pub signature: Vec<u8>,
}

impl Event {
    /// Follow/unfollow target, if this is a follow-class event.
    pub fn follow_target(&self) -> Option<Author> {
        match &self.body {
            EventBody::Follow { target, .. } | EventBody::Unfollow { target } => Some(*target),
            _ => None,
        }
    }
}

/// Bookkeeping record for a peer we have exchanged events with.
/// Never authoritative for identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeerRecord {
    /// Peer's node public key
    pub peer_id: Bytes32,
    /// Last contact, unix millis
    pub last_seen: u64,
    /// Dial hint, if known
    pub addr: Option<String>,
}
