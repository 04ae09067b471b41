//! Wire encoding for the gossip protocol
//!
//! Five message kinds ride a duplex stream per peer connection. Messages
//! are postcard-encoded; the enum variant index is the on-wire
//! discriminant. Full event bodies are transmitted, never diffs.
//!
//! For stream transports each message is framed with a 4-byte big-endian
//! length prefix.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use weft_core::{Bytes32, Event, EventId};

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum event ids per event-request message. Larger wants are split
/// into multiple batches to bound message size.
pub const EVENT_REQUEST_BATCH: usize = 100;

/// Wire errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Gossip protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Message {
    /// Transport-level handshake: announce our node public key.
    /// Exchanged once per connection before any gossip traffic.
    Hello { pubkey: Bytes32 },
    /// Sent once per newly connected peer: the sender's complete
    /// known-id set.
    SyncRequest { event_ids: Vec<EventId> },
    /// Both halves of the responder's symmetric difference:
    /// ids the responder lacks (and requests from the peer), and ids the
    /// responder holds that the peer is missing.
    SyncResponse {
        ids_i_request_from_you: Vec<EventId>,
        ids_you_are_missing: Vec<EventId>,
    },
    /// Request full bodies for an id batch (≤ [`EVENT_REQUEST_BATCH`]).
    EventRequest { event_ids: Vec<EventId> },
    /// Bodies for requested ids the sender actually has; unknown ids are
    /// silently omitted.
    EventResponse { events: Vec<Event> },
    /// Unsolicited broadcast of a freshly created or freshly learned
    /// event.
    NewEvent { event: Event },
}

impl Message {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Codec for length-prefixed message frames on stream transports.
///
/// Wire format:
/// - 4 bytes: payload length (big-endian)
/// - N bytes: postcard-encoded [`Message`]
#[derive(Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(length));
        }
        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length).to_vec()))
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(item.len()));
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}
