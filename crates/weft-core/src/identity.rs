//! Signing identity for Weft authors
//!
//! An identity bundles an ed25519 signing key with a static X25519 secret.
//! The X25519 public half is what Follow events hand out so a followee can
//! encrypt toward the follower; encryption itself is an opaque capability
//! outside this crate.

use crate::types::{Author, Bytes32};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Author identity: signing keypair plus encryption keypair.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    encryption_secret: StaticSecret,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let encryption_secret = StaticSecret::random_from_rng(OsRng);
        Self {
            signing_key,
            encryption_secret,
        }
    }

    /// Create from seed bytes (deterministic recovery and testing).
    /// The encryption secret is derived from the same seed.
    pub fn from_seed(seed: &Bytes32) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let enc_seed = blake3::derive_key("weft-encryption-key-v1", seed);
        let encryption_secret = StaticSecret::from(enc_seed);
        Self {
            signing_key,
            encryption_secret,
        }
    }

    /// Public author identity (signing public key).
    pub fn author(&self) -> Author {
        Author(self.signing_key.verifying_key().to_bytes())
    }

    /// X25519 public key handed out in Follow events.
    pub fn encryption_public_key(&self) -> Bytes32 {
        X25519Public::from(&self.encryption_secret).to_bytes()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify a signature against an author's public key.
///
/// Returns false for malformed keys or signatures rather than erroring;
/// callers treat any failure as an invalid event.
pub fn verify(author: &Author, message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&author.0) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &sig).is_ok()
}
