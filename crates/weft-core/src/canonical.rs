//! Canonical encoding for Weft events
//!
//! All hashed/signed objects use postcard serialization with strict
//! constraints:
//! - No maps/hashmaps
//! - Field order is Rust struct/enum declaration order
//!
//! Because the encoding is driven by declaration order rather than
//! insertion order, independent implementations produce identical bytes
//! for identical logical content.

use crate::error::{Error, Result};
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
/// Implementations in other languages MUST produce identical bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Default topic for posts that do not name one.
pub const DEFAULT_TOPIC: &str = "general";

/// Normalize a topic tag: trim, lowercase, empty defaults to "general".
///
/// Topic equality throughout the system is defined over this normal form.
pub fn normalize_topic(topic: &str) -> String {
    let t = topic.trim().to_lowercase();
    if t.is_empty() {
        DEFAULT_TOPIC.to_string()
    } else {
        t
    }
}
