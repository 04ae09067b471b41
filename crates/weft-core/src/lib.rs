//! Weft Core Library
//!
//! This crate provides the core types, canonical encoding, identity, and
//! event construction/validation rules for the Weft peer-to-peer feed.
//!
//! # Modules
//!
//! - [`types`]: Core protocol types (EventId, Author, Event, etc.)
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`identity`]: Signing keypair and public-key encoding
//! - [`event`]: Event construction, content addressing, and validation
//! - [`error`]: Error types

pub mod canonical;
pub mod error;
pub mod event;
pub mod identity;
pub mod types;

pub use error::{Error, Result};
pub use event::{
    compute_event_id, create_follow, create_post, create_profile, create_unfollow,
    is_valid_event, verify_event,
};
pub use identity::Identity;
pub use types::*;
