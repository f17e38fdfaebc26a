use std::path::Path;

use super::error::MetainfoError;
use super::info::{canonical_bytes, Info};
use crate::bencode::decode;

/// A parsed `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
}

impl Metainfo {
    /// Parses the raw contents of a `.torrent` file.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = decode(data)?;
        let dict = root.as_dict().ok_or(MetainfoError::InvalidKey("torrent"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingKey("info"))?;
        // The info hash is defined over the canonical encoding of the
        // info value alone, which re-encoding reproduces.
        let raw = canonical_bytes(info_value);
        let info = Info::from_value(info_value, raw)?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        let mut announce_list = Vec::new();
        if let Some(tiers) = dict.get(b"announce-list".as_slice()).and_then(|v| v.as_list()) {
            for tier in tiers {
                let urls: Vec<String> = tier
                    .as_list()
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect();
                if !urls.is_empty() {
                    announce_list.push(urls);
                }
            }
        }

        Ok(Self {
            info,
            announce,
            announce_list,
            creation_date: dict.get(b"creation date".as_slice()).and_then(|v| v.as_int()),
            comment: dict
                .get(b"comment".as_slice())
                .and_then(|v| v.as_str())
                .map(String::from),
            created_by: dict
                .get(b"created by".as_slice())
                .and_then(|v| v.as_str())
                .map(String::from),
            encoding: dict
                .get(b"encoding".as_slice())
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    /// Reads and parses a `.torrent` file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// All tracker URLs, announce-list tiers first, flattened and deduplicated.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .announce_list
            .iter()
            .flatten()
            .cloned()
            .collect();
        if let Some(announce) = &self.announce {
            if !urls.contains(announce) {
                urls.push(announce.clone());
            }
        }
        urls.dedup();
        urls
    }
}
