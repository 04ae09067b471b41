//! Derived follow graph
//!
//! Per (follower, followee) pair the relationship is a two-state machine,
//! NotFollowing ⇄ Following, driven by Follow/Unfollow events replayed
//! ascending by timestamp with the event id breaking ties. Queries
//! recompute from the full follow history on every call; the store is the
//! only source of truth and the result is independent of insertion order.
//!
//! The reduction used here keeps the latest (timestamp, id) event per pair
//! instead of stepping the machine event by event. Pairs are independent,
//! so this is equivalent to a full ascending replay.

use std::collections::HashMap;
use std::sync::Arc;
use weft_core::{Author, Event, EventBody, EventId};
use weft_store::{Store, StoreError};

/// Follow graph engine over the event store.
pub struct FollowGraph {
    store: Arc<Store>,
}

/// Latest decisive event for one (follower, followee) pair.
#[derive(Clone, Copy)]
struct PairState {
    timestamp: u64,
    id: EventId,
    following: bool,
}

impl PairState {
    fn apply(slot: &mut Option<PairState>, event: &Event, following: bool) {
        let candidate = PairState {
            timestamp: event.timestamp,
            id: event.id,
            following,
        };
        match slot {
            Some(current) if (current.timestamp, current.id) >= (candidate.timestamp, candidate.id) => {}
            _ => *slot = Some(candidate),
        }
    }
}

impl FollowGraph {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Is `follower` currently following `followee`?
    pub fn is_following(&self, follower: &Author, followee: &Author) -> Result<bool, StoreError> {
        let mut state: Option<PairState> = None;
        for event in self.store.list_follow_events_by(follower)? {
            if event.follow_target() != Some(*followee) {
                continue;
            }
            let following = matches!(event.body, EventBody::Follow { .. });
            PairState::apply(&mut state, &event, following);
        }
        Ok(state.map(|s| s.following).unwrap_or(false))
    }

    /// Everyone `follower` currently follows, recomputed from full history.
    pub fn following(&self, follower: &Author) -> Result<Vec<Author>, StoreError> {
        let mut pairs: HashMap<Author, Option<PairState>> = HashMap::new();
        for event in self.store.list_follow_events_by(follower)? {
            let Some(target) = event.follow_target() else {
                continue;
            };
            let following = matches!(event.body, EventBody::Follow { .. });
            PairState::apply(pairs.entry(target).or_default(), &event, following);
        }
        Ok(collect_active(pairs))
    }

    /// Everyone currently following `target`, recomputed from the full
    /// follow history of all authors.
    pub fn followers(&self, target: &Author) -> Result<Vec<Author>, StoreError> {
        let mut pairs: HashMap<Author, Option<PairState>> = HashMap::new();
        for event in self.store.list_follow_events()? {
            if event.follow_target() != Some(*target) {
                continue;
            }
            let following = matches!(event.body, EventBody::Follow { .. });
            PairState::apply(pairs.entry(event.author).or_default(), &event, following);
        }
        Ok(collect_active(pairs))
    }
}

fn collect_active(pairs: HashMap<Author, Option<PairState>>) -> Vec<Author> {
    let mut authors: Vec<Author> = pairs
        .into_iter()
        .filter(|(_, state)| state.map(|s| s.following).unwrap_or(false))
        .map(|(author, _)| author)
        .collect();
    // Deterministic output for callers that diff results
    authors.sort();
    authors
}
