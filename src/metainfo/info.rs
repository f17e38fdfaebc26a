use bytes::Bytes;
use std::path::PathBuf;

use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};

/// One file described by the info dictionary.
///
/// `offset` is the file's start within the torrent's contiguous byte
/// space; pieces address that space, not individual files.
#[derive(Debug, Clone)]
pub struct FileItem {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// The parsed info dictionary of a torrent.
///
/// Becomes available exactly once per torrent — either from the
/// `.torrent` file or fetched from peers via `ut_metadata` — and is
/// immutable afterwards. The raw bencoded bytes are kept verbatim so
/// they can be served to other peers and re-hashed on resume.
#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub piece_length: u32,
    pub num_pieces: u32,
    pub total_length: u64,
    pub private: bool,
    pub files: Vec<FileItem>,
    pub hash: InfoHash,
    /// Raw canonical bencoding of the dictionary, served to peers.
    pub raw: Bytes,
    piece_hashes: Bytes,
}

impl Info {
    /// Parses raw bencoded info bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, MetainfoError> {
        let value = decode(raw)?;
        Self::from_value(&value, Bytes::copy_from_slice(raw))
    }

    /// Builds an `Info` from an already-decoded value plus its canonical bytes.
    pub(crate) fn from_value(value: &Value, raw: Bytes) -> Result<Self, MetainfoError> {
        let dict = value.as_dict().ok_or(MetainfoError::InvalidKey("info"))?;

        let name = dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::MissingKey("name"))?
            .to_owned();

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_int())
            .filter(|&n| n > 0 && n <= u32::MAX as i64)
            .ok_or(MetainfoError::InvalidKey("piece length"))?
            as u32;

        let piece_hashes = dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or(MetainfoError::MissingKey("pieces"))?;
        if piece_hashes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPieces);
        }
        let num_pieces = (piece_hashes.len() / 20) as u32;

        let private = dict
            .get(b"private".as_slice())
            .and_then(|v| v.as_int())
            .unwrap_or(0)
            == 1;

        let files = parse_files(dict, &name)?;
        let total_length: u64 = files.iter().map(|f| f.length).sum();

        // Every piece except the last must be full; the last must fit.
        let covered = u64::from(piece_length) * u64::from(num_pieces);
        if num_pieces == 0
            || covered < total_length
            || covered - total_length >= u64::from(piece_length)
        {
            return Err(MetainfoError::InvalidLayout);
        }

        Ok(Self {
            name,
            piece_length,
            num_pieces,
            total_length,
            private,
            files,
            hash: InfoHash::of(&raw),
            raw,
            piece_hashes,
        })
    }

    /// Expected SHA-1 of piece `index`.
    ///
    /// # Panics
    ///
    /// Panics when `index >= num_pieces`.
    pub fn piece_hash(&self, index: u32) -> [u8; 20] {
        assert!(index < self.num_pieces, "piece index out of range");
        let start = index as usize * 20;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.piece_hashes[start..start + 20]);
        hash
    }

    /// Byte offset of piece `index` within the torrent's byte space.
    pub fn piece_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.piece_length)
    }

    /// True length of piece `index`; only the last piece may be short.
    pub fn piece_length_of(&self, index: u32) -> u32 {
        if index == self.num_pieces - 1 {
            let rem = self.total_length - self.piece_offset(index);
            rem as u32
        } else {
            self.piece_length
        }
    }
}

fn parse_files(
    dict: &std::collections::BTreeMap<Bytes, Value>,
    name: &str,
) -> Result<Vec<FileItem>, MetainfoError> {
    match dict.get(b"files".as_slice()) {
        None => {
            // Single-file mode: the name is the file name.
            let length = dict
                .get(b"length".as_slice())
                .and_then(|v| v.as_int())
                .filter(|&n| n >= 0)
                .ok_or(MetainfoError::MissingKey("length"))? as u64;
            Ok(vec![FileItem {
                path: PathBuf::from(name),
                length,
                offset: 0,
            }])
        }
        Some(files) => {
            let list = files.as_list().ok_or(MetainfoError::InvalidKey("files"))?;
            let mut items = Vec::with_capacity(list.len());
            let mut offset = 0u64;
            for entry in list {
                let length = entry
                    .get(b"length")
                    .and_then(|v| v.as_int())
                    .filter(|&n| n >= 0)
                    .ok_or(MetainfoError::InvalidKey("files"))? as u64;
                let mut path = PathBuf::from(name);
                let segments = entry
                    .get(b"path")
                    .and_then(|v| v.as_list())
                    .ok_or(MetainfoError::InvalidKey("path"))?;
                if segments.is_empty() {
                    return Err(MetainfoError::InvalidKey("path"));
                }
                for seg in segments {
                    let seg = seg.as_str().ok_or(MetainfoError::InvalidKey("path"))?;
                    // Keep file layout under the torrent root.
                    if seg.is_empty() || seg == "." || seg == ".." || seg.contains('/') {
                        return Err(MetainfoError::InvalidKey("path"));
                    }
                    path.push(seg);
                }
                items.push(FileItem {
                    path,
                    length,
                    offset,
                });
                offset += length;
            }
            if items.is_empty() {
                return Err(MetainfoError::InvalidKey("files"));
            }
            Ok(items)
        }
    }
}

/// Re-encodes a decoded info value to its canonical bytes.
pub(crate) fn canonical_bytes(value: &Value) -> Bytes {
    Bytes::from(encode(value))
}
