//! Encrypted authenticated gossip over TCP: signed envelopes with per-peer
//! AES-GCM payloads, length-prefixed frames, ping liveness, and head-hash
//! propagation with pull-on-miss.

pub mod message;
pub mod node;
pub mod peer;

pub use message::{Message, MessageKind, MAX_MESSAGE_SIZE};
pub use node::{Node, PROTOCOL_VERSION};
pub use peer::Peer;
