//! Coordination message protocol
//!
//! - [`messages`] - the typed message catalog
//! - [`wire`] - JSON string-sample encoding with forward-compatible decoding
//! - [`dedup`] - bounded duplicate suppression
//! - [`channel`] - outlet, dedicated polling worker, inbound filter chain and
//!   the connection confirmation handshake

pub mod channel;
pub mod dedup;
pub mod messages;
pub mod wire;

pub use channel::{ChannelStats, CoordinationChannel, DiscoveryChange, HandshakePolicy};
pub use dedup::RecentMessages;
pub use messages::{CoordinationMessage, MessagePayload, MessageType, StreamControl};
pub use wire::{decode, encode, Decoded, WireEnvelope};
