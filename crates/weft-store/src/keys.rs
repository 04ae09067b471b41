//! Index key layouts
//!
//! All secondary index keys are fixed-width and big-endian so that sled's
//! lexicographic key order is (timestamp, id) ascending. Descending lists
//! come from reverse iteration, which makes the id the stable tie-break
//! for equal timestamps in both directions.

use weft_core::{Author, EventId};

/// by_time key: ts_be(8) || id(32)
pub fn time_key(timestamp: u64, id: &EventId) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&timestamp.to_be_bytes());
    key[8..].copy_from_slice(&id.0);
    key
}

/// by_author / follow_events key: author(32) || ts_be(8) || id(32)
pub fn author_time_key(author: &Author, timestamp: u64, id: &EventId) -> [u8; 72] {
    let mut key = [0u8; 72];
    key[..32].copy_from_slice(&author.0);
    key[32..40].copy_from_slice(&timestamp.to_be_bytes());
    key[40..].copy_from_slice(&id.0);
    key
}

/// by_topic key: topic_hash(32) || ts_be(8) || id(32)
///
/// Hashing the normalized topic gives a fixed-width prefix without any
/// escaping rules for arbitrary topic bytes.
pub fn topic_time_key(topic: &str, timestamp: u64, id: &EventId) -> [u8; 72] {
    let mut key = [0u8; 72];
    key[..32].copy_from_slice(topic_hash(topic).as_bytes());
    key[32..40].copy_from_slice(&timestamp.to_be_bytes());
    key[40..].copy_from_slice(&id.0);
    key
}

/// 32-byte prefix identifying a normalized topic.
pub fn topic_hash(topic: &str) -> blake3::Hash {
    blake3::hash(topic.as_bytes())
}

/// Extract the trailing event id from an index key.
pub fn id_suffix(key: &[u8]) -> Option<EventId> {
    if key.len() < 32 {
        return None;
    }
    let bytes: [u8; 32] = key[key.len() - 32..].try_into().ok()?;
    Some(EventId(bytes))
}

/// Inclusive (start, end) bounds over ts_be(8) || id(32) suffixes,
/// appended to `prefix`.
pub fn range_bounds(prefix: &[u8], since: Option<u64>, until: Option<u64>) -> (Vec<u8>, Vec<u8>) {
    let mut start = prefix.to_vec();
    start.extend_from_slice(&since.unwrap_or(0).to_be_bytes());
    start.extend_from_slice(&[0u8; 32]);

    let mut end = prefix.to_vec();
    end.extend_from_slice(&until.unwrap_or(u64::MAX).to_be_bytes());
    end.extend_from_slice(&[0xFFu8; 32]);

    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order_is_timestamp_then_id() {
        let a = time_key(1, &EventId([9; 32]));
        let b = time_key(2, &EventId([0; 32]));
        assert!(a < b);

        let c = time_key(1, &EventId([1; 32]));
        let d = time_key(1, &EventId([2; 32]));
        assert!(c < d);
    }

    #[test]
    fn test_author_prefix_groups() {
        let alice = Author([1; 32]);
        let bob = Author([2; 32]);
        let a = author_time_key(&alice, u64::MAX, &EventId([0xFF; 32]));
        let b = author_time_key(&bob, 0, &EventId([0; 32]));
        assert!(a < b);
    }

    #[test]
    fn test_id_suffix_round_trip() {
        let id = EventId([7; 32]);
        let key = author_time_key(&Author([3; 32]), 123, &id);
        assert_eq!(id_suffix(&key), Some(id));
    }

    #[test]
    fn test_range_bounds_cover_ties() {
        let (start, end) = range_bounds(&[], Some(5), Some(5));
        let low = time_key(5, &EventId([0; 32]));
        let high = time_key(5, &EventId([0xFF; 32]));
        assert!(start.as_slice() <= &low[..]);
        assert!(end.as_slice() >= &high[..]);
    }
}
