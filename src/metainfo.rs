//! Torrent metainfo: `.torrent` files, info dictionaries and magnet links.

mod error;
mod info;
mod info_hash;
mod magnet;
mod torrent;

#[cfg(test)]
mod tests;

pub use error::MetainfoError;
pub use info::{FileItem, Info};
pub use info_hash::InfoHash;
pub use magnet::MagnetLink;
pub use torrent::Metainfo;
