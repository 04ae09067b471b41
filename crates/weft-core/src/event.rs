//! Event construction, content addressing, and validation
//!
//! Every event id is a BLAKE3 hash (with domain separation) over the
//! canonical encoding of the event's logical content, so identical content
//! from independent processes yields identical ids, and any mutation of a
//! stored event breaks verification.

use crate::canonical::{canonical_bytes, normalize_topic};
use crate::error::{Error, Result};
use crate::identity::{verify, Identity};
use crate::types::*;
use blake3::Hasher;
use serde::Serialize;

/// Domain prefix for event id derivation
pub const DOMAIN_EVENT: &[u8] = b"weft-event-v1";

/// The fields that participate in content addressing, in canonical order.
/// The id and signature themselves are excluded.
#[derive(Serialize)]
struct EventHashable<'a> {
    kind: EventKind,
    author: &'a Author,
    timestamp: u64,
    body: &'a EventBody,
}

/// Compute an event id from its addressed fields.
///
/// `id = BLAKE3("weft-event-v1" || canonical_bytes(kind, author, timestamp, body))`
pub fn compute_event_id(
    kind: EventKind,
    author: &Author,
    timestamp: u64,
    body: &EventBody,
) -> Result<EventId> {
    let hashable = EventHashable {
        kind,
        author,
        timestamp,
        body,
    };
    let bytes = canonical_bytes(&hashable)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_EVENT);
    hasher.update(&bytes);
    Ok(EventId(*hasher.finalize().as_bytes()))
}

/// Bytes covered by the event signature: `id || canonical_bytes(body)`.
///
/// Signing the id binds the signature to every addressed field; including
/// the body bytes directly keeps the content covered even if the hash
/// function were ever weakened.
pub fn sign_bytes(id: &EventId, body: &EventBody) -> Result<Vec<u8>> {
    let body_bytes = canonical_bytes(body)?;
    let mut bytes = Vec::with_capacity(32 + body_bytes.len());
    bytes.extend_from_slice(&id.0);
    bytes.extend_from_slice(&body_bytes);
    Ok(bytes)
}

// Zero means "unset" everywhere timestamps travel, and validation
// rejects it, so constructors must never produce it.
fn assemble(identity: &Identity, timestamp: u64, body: EventBody) -> Result<Event> {
    if timestamp == 0 {
        return Err(Error::MissingField("timestamp"));
    }
    let author = identity.author();
    let kind = body.kind();
    let id = compute_event_id(kind, &author, timestamp, &body)?;
    let signature = identity.sign(&sign_bytes(&id, &body)?).to_vec();

    Ok(Event {
        id,
        kind,
        author,
        timestamp,
        body,
        signature,
    })
}

/// Create a signed post. The topic is normalized before addressing, so
/// "Tech" and " tech " produce the same stored topic.
pub fn create_post(identity: &Identity, text: &str, topic: &str, timestamp: u64) -> Result<Event> {
    if text.is_empty() {
        return Err(Error::MissingField("text"));
    }
    assemble(
        identity,
        timestamp,
        EventBody::Post {
            text: text.to_string(),
            topic: normalize_topic(topic),
        },
    )
}

/// Create a signed follow of `target`, optionally advertising an
/// encryption public key for the followee to use.
pub fn create_follow(
    identity: &Identity,
    target: Author,
    encryption_key: Option<Bytes32>,
    timestamp: u64,
) -> Result<Event> {
    assemble(
        identity,
        timestamp,
        EventBody::Follow {
            target,
            encryption_key,
        },
    )
}

/// Create a signed unfollow of `target`.
pub fn create_unfollow(identity: &Identity, target: Author, timestamp: u64) -> Result<Event> {
    assemble(identity, timestamp, EventBody::Unfollow { target })
}

/// Create a signed profile update.
pub fn create_profile(
    identity: &Identity,
    name: &str,
    about: &str,
    timestamp: u64,
) -> Result<Event> {
    assemble(
        identity,
        timestamp,
        EventBody::Profile {
            name: name.to_string(),
            about: about.to_string(),
        },
    )
}

/// Verify an event's content address and signature.
///
/// Recomputes the expected id from the declared fields and requires
/// equality, then verifies the signature over `id || body` against the
/// declared author. Both must pass.
pub fn verify_event(event: &Event) -> Result<()> {
    let computed = compute_event_id(event.kind, &event.author, event.timestamp, &event.body)?;
    if computed != event.id {
        return Err(Error::IdMismatch {
            computed: computed.to_hex(),
            declared: event.id.to_hex(),
        });
    }

    let msg = sign_bytes(&event.id, &event.body)?;
    if !verify(&event.author, &msg, &event.signature) {
        return Err(Error::InvalidSignature);
    }
    Ok(())
}

/// Full structural + cryptographic validation.
///
/// An event failing this check MUST NOT be stored or rebroadcast.
pub fn is_valid_event(event: &Event) -> bool {
    if event.signature.len() != 64 {
        return false;
    }
    if event.timestamp == 0 {
        return false;
    }
    if event.kind != event.body.kind() {
        return false;
    }
    if let EventBody::Post { text, .. } = &event.body {
        if text.is_empty() {
            return false;
        }
    }
    verify_event(event).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::from_seed(&[1u8; 32])
    }

    #[test]
    fn test_create_post_verifies() {
        let event = create_post(&alice(), "hello", "Tech", 1000).unwrap();
        assert_eq!(event.kind, EventKind::Post);
        assert!(verify_event(&event).is_ok());
        assert!(is_valid_event(&event));

        // Topic is stored normalized
        match &event.body {
            EventBody::Post { topic, .. } => assert_eq!(topic, "tech"),
            _ => panic!("wrong body"),
        }
    }

    #[test]
    fn test_all_constructors_verify() {
        let id = alice();
        let bob = Identity::from_seed(&[2u8; 32]);

        let events = [
            create_post(&id, "hi", "", 1).unwrap(),
            create_follow(&id, bob.author(), Some(id.encryption_public_key()), 2).unwrap(),
            create_unfollow(&id, bob.author(), 3).unwrap(),
            create_profile(&id, "Alice", "likes gossip", 4).unwrap(),
        ];
        for event in &events {
            assert!(is_valid_event(event), "{:?} failed validation", event.kind);
        }
    }

    #[test]
    fn test_identical_content_identical_id() {
        let a = create_post(&alice(), "same", "general", 42).unwrap();
        let b = create_post(&alice(), "same", "general", 42).unwrap();
        assert_eq!(a.id, b.id);

        let c = create_post(&alice(), "same", "general", 43).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_tampered_content_fails() {
        let mut event = create_post(&alice(), "hello", "tech", 1000).unwrap();
        event.body = EventBody::Post {
            text: "hijacked".into(),
            topic: "tech".into(),
        };
        assert!(matches!(
            verify_event(&event),
            Err(Error::IdMismatch { .. })
        ));
        assert!(!is_valid_event(&event));
    }

    #[test]
    fn test_tampered_timestamp_fails() {
        let mut event = create_post(&alice(), "hello", "tech", 1000).unwrap();
        event.timestamp = 2000;
        assert!(!is_valid_event(&event));
    }

    #[test]
    fn test_tampered_author_fails() {
        let mut event = create_post(&alice(), "hello", "tech", 1000).unwrap();
        let mallory = Identity::from_seed(&[9u8; 32]);
        event.author = mallory.author();
        assert!(!is_valid_event(&event));
    }

    #[test]
    fn test_wrong_signer_fails() {
        let mut event = create_post(&alice(), "hello", "tech", 1000).unwrap();
        let mallory = Identity::from_seed(&[9u8; 32]);
        let msg = sign_bytes(&event.id, &event.body).unwrap();
        event.signature = mallory.sign(&msg).to_vec();
        assert!(matches!(verify_event(&event), Err(Error::InvalidSignature)));
    }

    #[test]
    fn test_kind_body_mismatch_fails() {
        let mut event = create_post(&alice(), "hello", "tech", 1000).unwrap();
        event.kind = EventKind::Profile;
        assert!(!is_valid_event(&event));
    }

    #[test]
    fn test_zero_timestamp_rejected() {
        // Every constructor must refuse what validation would drop.
        let id = alice();
        let bob = Identity::from_seed(&[2u8; 32]);
        assert!(matches!(
            create_post(&id, "x", "tech", 0),
            Err(Error::MissingField("timestamp"))
        ));
        assert!(matches!(
            create_follow(&id, bob.author(), None, 0),
            Err(Error::MissingField("timestamp"))
        ));
        assert!(matches!(
            create_unfollow(&id, bob.author(), 0),
            Err(Error::MissingField("timestamp"))
        ));
        assert!(matches!(
            create_profile(&id, "A", "", 0),
            Err(Error::MissingField("timestamp"))
        ));
    }

    #[test]
    fn test_empty_post_rejected() {
        assert!(matches!(
            create_post(&alice(), "", "tech", 1000),
            Err(Error::MissingField("text"))
        ));
    }
}
