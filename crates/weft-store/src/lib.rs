//! Weft event store
//!
//! Persistent, content-addressed storage for the append-only event log,
//! backed by sled. Besides the primary id → event mapping, the store
//! maintains secondary indexes by timestamp, by (author, timestamp), and
//! by topic, a follow-event index for graph replay, a latest-profile
//! projection, and peer bookkeeping records.
//!
//! All writes are idempotent upserts by id: identical content always
//! yields the identical id, so concurrent writers can only produce true
//! duplicates, never conflicting versions.

mod keys;
mod store;

pub use store::{Store, StoreError};
