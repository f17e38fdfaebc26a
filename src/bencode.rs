//! Bencode encoding and decoding (BEP-3).
//!
//! Bencode is the serialization format used by torrent metainfo files,
//! tracker responses and the extension protocol. Only four shapes exist:
//! integers, byte strings, lists and dictionaries with sorted keys.

mod decode;
mod encode;
mod error;
mod value;

#[cfg(test)]
mod tests;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;
