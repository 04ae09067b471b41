//! Error types for weft-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Weft core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Event id mismatch (computed != declared)
    #[error("event id mismatch: computed {computed} != declared {declared}")]
    IdMismatch { computed: String, declared: String },

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Declared kind does not match body discriminant
    #[error("event kind does not match body")]
    KindMismatch,

    /// Missing or empty required field
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
