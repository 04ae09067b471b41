//! weftd - Weft feed node daemon
//!
//! This daemon provides:
//! - Derived follow graph and feed projections over the event log
//! - Anti-entropy gossip synchronization with connected peers
//! - Loop-free rebroadcast of freshly learned events
//! - Transport glue and wire framing

pub mod config;
pub mod feed;
pub mod graph;
pub mod net;
pub mod node;
pub mod sync;
pub mod wire;

pub use config::Config;
pub use feed::{FeedEngine, FeedItem, SubscriptionId};
pub use graph::FollowGraph;
pub use net::{MemoryMesh, NetEvent, PeerId, Transport};
pub use node::Node;
pub use sync::Gossip;
pub use wire::Message;
