//! Peer wire protocol: message codec, per-peer I/O tasks and the
//! extension protocol (BEP-3, BEP-6, BEP-10).

mod bitfield;
mod connection;
mod error;
mod extension;
mod fast;
mod message;
mod peer_id;

#[cfg(test)]
mod tests;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use extension::{ExtensionHandshake, MetadataKind, MetadataMessage, METADATA_PIECE_SIZE};
pub use fast::allowed_fast_set;
pub use message::{Extensions, Message};
pub use peer_id::PeerId;

pub(crate) use connection::{read_loop, write_loop, PeerCommand, PeerEvent};
pub(crate) use extension::{EXTENSION_HANDSHAKE_ID, LOCAL_METADATA_ID};

/// Opaque identity of one connected peer within an engine.
///
/// Sub-tasks carry the key instead of references to peer state; all
/// lookups go through the engine-owned maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey(pub(crate) u64);
