//! Persistent event storage using sled

use crate::keys;
use sled::Db;
use std::path::Path;
use thiserror::Error;
use weft_core::canonical::normalize_topic;
use weft_core::{Author, Bytes32, Event, EventBody, EventId, PeerRecord};

/// Index entries carry no value; the key encodes everything.
const EMPTY: &[u8] = &[];

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("index references missing event: {0}")]
    Corrupt(String),
}

/// Storage backend for a Weft node.
///
/// One process owns one store; replicas never share a database. The store
/// is the sole source of truth for persisted events; the profile
/// projection is a derived side table that can always be rebuilt by
/// re-scanning Profile events.
pub struct Store {
    db: Db,
    /// Primary tree: event_id -> Event
    events: sled::Tree,
    /// Index: ts_be || id -> []
    by_time: sled::Tree,
    /// Index: author || ts_be || id -> []
    by_author: sled::Tree,
    /// Index: topic_hash || ts_be || id -> [] (Post events only)
    by_topic: sled::Tree,
    /// Index: author || ts_be || id -> [] (Follow/Unfollow events only)
    follow_events: sled::Tree,
    /// Projection: author -> latest Profile event
    profiles: sled::Tree,
    /// Bookkeeping: peer_id -> PeerRecord
    peers: sled::Tree,
}

impl Store {
    /// Open storage at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let events = db.open_tree("events")?;
        let by_time = db.open_tree("by_time")?;
        let by_author = db.open_tree("by_author")?;
        let by_topic = db.open_tree("by_topic")?;
        let follow_events = db.open_tree("follow_events")?;
        let profiles = db.open_tree("profiles")?;
        let peers = db.open_tree("peers")?;

        Ok(Self {
            db,
            events,
            by_time,
            by_author,
            by_topic,
            follow_events,
            profiles,
            peers,
        })
    }

    /// Idempotent upsert by id. Returns true if the event was new.
    ///
    /// Re-putting an identical event rewrites the same keys, so store and
    /// index state after `put(e); put(e)` equals a single `put(e)`.
    pub fn put(&self, event: &Event) -> Result<bool, StoreError> {
        let value = postcard::to_allocvec(event)?;
        let inserted = self.events.insert(event.id.0, value)?.is_none();

        self.by_time
            .insert(keys::time_key(event.timestamp, &event.id), EMPTY)?;
        self.by_author.insert(
            keys::author_time_key(&event.author, event.timestamp, &event.id),
            EMPTY,
        )?;

        match &event.body {
            EventBody::Post { topic, .. } => {
                self.by_topic
                    .insert(keys::topic_time_key(topic, event.timestamp, &event.id), EMPTY)?;
            }
            EventBody::Follow { .. } | EventBody::Unfollow { .. } => {
                self.follow_events.insert(
                    keys::author_time_key(&event.author, event.timestamp, &event.id),
                    EMPTY,
                )?;
            }
            EventBody::Profile { .. } => {
                self.upsert_profile(event)?;
            }
        }

        Ok(inserted)
    }

    /// Store a batch of events as a unit. Each event is durable on its
    /// own; a crash mid-batch leaves a prefix applied, which is safe
    /// because every put is an independent idempotent upsert.
    pub fn put_batch(&self, events: &[Event]) -> Result<usize, StoreError> {
        let mut inserted = 0;
        for event in events {
            if self.put(event)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Get an event by id.
    pub fn get(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        match self.events.get(id.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Check if an event exists.
    pub fn exists(&self, id: &EventId) -> Result<bool, StoreError> {
        Ok(self.events.contains_key(id.0)?)
    }

    /// Count all events.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// All known event ids, in id order.
    pub fn list_all_ids(&self) -> Result<Vec<EventId>, StoreError> {
        let mut ids = Vec::with_capacity(self.events.len());
        for result in self.events.iter() {
            let (key, _) = result?;
            if let Some(id) = keys::id_suffix(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Ids of one author's events, descending by timestamp.
    pub fn list_ids_by_author(&self, author: &Author) -> Result<Vec<EventId>, StoreError> {
        let mut ids = Vec::new();
        for result in self.by_author.scan_prefix(author.0).rev() {
            let (key, _) = result?;
            if let Some(id) = keys::id_suffix(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// One author's events, descending by timestamp (ties by id).
    pub fn list_by_author(
        &self,
        author: &Author,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        let iter = self.by_author.scan_prefix(author.0).rev();
        self.collect_indexed(iter, limit)
    }

    /// One author's events within an inclusive timestamp range, descending.
    pub fn list_by_author_in_range(
        &self,
        author: &Author,
        since: Option<u64>,
        until: Option<u64>,
    ) -> Result<Vec<Event>, StoreError> {
        let (start, end) = keys::range_bounds(&author.0, since, until);
        let iter = self.by_author.range(start..=end).rev();
        self.collect_indexed(iter, None)
    }

    /// All events within an inclusive timestamp range, descending.
    pub fn list_in_range(
        &self,
        since: Option<u64>,
        until: Option<u64>,
    ) -> Result<Vec<Event>, StoreError> {
        let (start, end) = keys::range_bounds(&[], since, until);
        let iter = self.by_time.range(start..=end).rev();
        self.collect_indexed(iter, None)
    }

    /// Posts in a topic (normalized before lookup), descending.
    pub fn list_by_topic(
        &self,
        topic: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        let prefix = *keys::topic_hash(&normalize_topic(topic)).as_bytes();
        let iter = self.by_topic.scan_prefix(prefix).rev();
        self.collect_indexed(iter, limit)
    }

    /// One author's follow/unfollow events, ascending by timestamp.
    /// Ascending order is what graph replay consumes.
    pub fn list_follow_events_by(&self, author: &Author) -> Result<Vec<Event>, StoreError> {
        let iter = self.follow_events.scan_prefix(author.0);
        self.collect_indexed(iter, None)
    }

    /// All follow/unfollow events, grouped by author, ascending within
    /// each author.
    pub fn list_follow_events(&self) -> Result<Vec<Event>, StoreError> {
        let iter = self.follow_events.iter();
        self.collect_indexed(iter, None)
    }

    fn collect_indexed(
        &self,
        iter: impl Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut events = Vec::new();
        for result in iter {
            if let Some(limit) = limit {
                if events.len() >= limit {
                    break;
                }
            }
            let (key, _) = result?;
            let id = keys::id_suffix(&key)
                .ok_or_else(|| StoreError::Corrupt(hex::encode(&key)))?;
            let event = self
                .get(&id)?
                .ok_or_else(|| StoreError::Corrupt(id.to_hex()))?;
            events.push(event);
        }
        Ok(events)
    }

    /// Latest Profile event for an author, if any.
    pub fn profile(&self, author: &Author) -> Result<Option<Event>, StoreError> {
        match self.profiles.get(author.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Keep only the latest profile per author, by (timestamp, id).
    fn upsert_profile(&self, event: &Event) -> Result<(), StoreError> {
        if let Some(current) = self.profile(&event.author)? {
            if (current.timestamp, current.id) >= (event.timestamp, event.id) {
                return Ok(());
            }
        }
        self.profiles
            .insert(event.author.0, postcard::to_allocvec(event)?)?;
        Ok(())
    }

    /// Rebuild the profile projection by re-scanning Profile events.
    /// The projection is never independently authoritative.
    pub fn rebuild_profiles(&self) -> Result<(), StoreError> {
        self.profiles.clear()?;
        for result in self.events.iter() {
            let (_, bytes) = result?;
            let event: Event = postcard::from_bytes(&bytes)?;
            if matches!(event.body, EventBody::Profile { .. }) {
                self.upsert_profile(&event)?;
            }
        }
        Ok(())
    }

    /// Record or refresh a peer bookkeeping entry.
    pub fn put_peer(&self, record: &PeerRecord) -> Result<(), StoreError> {
        self.peers
            .insert(record.peer_id, postcard::to_allocvec(record)?)?;
        Ok(())
    }

    /// Look up a peer record.
    pub fn get_peer(&self, peer_id: &Bytes32) -> Result<Option<PeerRecord>, StoreError> {
        match self.peers.get(peer_id)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All known peer records.
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let mut records = Vec::new();
        for result in self.peers.iter() {
            let (_, bytes) = result?;
            records.push(postcard::from_bytes(&bytes)?);
        }
        Ok(records)
    }

    /// Flush all pending writes.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
