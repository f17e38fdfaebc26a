use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode, decode_prefix, encode, Value};

/// Extended-message ID of the extension handshake itself.
pub(crate) const EXTENSION_HANDSHAKE_ID: u8 = 0;
/// The metadata exchange extension name (BEP-9).
pub(crate) const METADATA_NAME: &str = "ut_metadata";
/// The extended-message ID we assign to `ut_metadata` locally.
pub(crate) const LOCAL_METADATA_ID: u8 = 1;
/// Metadata is transferred in 16 KiB chunks.
pub const METADATA_PIECE_SIZE: u32 = 16 * 1024;

/// The bencoded payload of an extension-protocol handshake (BEP-10).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the sender's local message ID.
    pub m: BTreeMap<String, u8>,
    /// Client name and version.
    pub v: Option<String>,
    /// The sender's listen port.
    pub p: Option<u16>,
    /// Info dictionary size in bytes; present iff the sender has it.
    pub metadata_size: Option<u32>,
}

impl ExtensionHandshake {
    /// The handshake this client sends. `metadata_size` is set once the
    /// info dictionary is known.
    pub fn ours(port: u16, metadata_size: Option<u32>) -> Self {
        let mut m = BTreeMap::new();
        m.insert(METADATA_NAME.to_owned(), LOCAL_METADATA_ID);
        Self {
            m,
            v: Some(concat!("downpour ", env!("CARGO_PKG_VERSION")).to_owned()),
            p: Some(port),
            metadata_size,
        }
    }

    /// The remote's message ID for `ut_metadata`, when advertised.
    pub fn metadata_id(&self) -> Option<u8> {
        self.m.get(METADATA_NAME).copied()
    }

    pub fn encode(&self) -> Bytes {
        let mut m = BTreeMap::new();
        for (name, id) in &self.m {
            m.insert(
                Bytes::copy_from_slice(name.as_bytes()),
                Value::Int(i64::from(*id)),
            );
        }
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
        if let Some(v) = &self.v {
            dict.insert(Bytes::from_static(b"v"), Value::str(v));
        }
        if let Some(p) = self.p {
            dict.insert(Bytes::from_static(b"p"), Value::Int(i64::from(p)));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(
                Bytes::from_static(b"metadata_size"),
                Value::Int(i64::from(size)),
            );
        }
        Bytes::from(encode(&Value::Dict(dict)))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value = decode(payload)?;
        let dict = value.as_dict().ok_or(PeerError::Extension("expected dict"))?;

        let mut hs = Self::default();
        if let Some(m) = dict.get(b"m".as_slice()).and_then(|v| v.as_dict()) {
            for (name, id) in m {
                let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_int()) else {
                    continue;
                };
                // ID zero means the extension was disabled by the sender.
                if (1..=255).contains(&id) {
                    hs.m.insert(name.to_owned(), id as u8);
                }
            }
        }
        hs.v = dict
            .get(b"v".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);
        hs.p = dict
            .get(b"p".as_slice())
            .and_then(|v| v.as_int())
            .filter(|&p| (0..=i64::from(u16::MAX)).contains(&p))
            .map(|p| p as u16);
        hs.metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(|v| v.as_int())
            .filter(|&s| s > 0 && s <= i64::from(u32::MAX))
            .map(|s| s as u32);
        Ok(hs)
    }
}

/// `ut_metadata` message kinds (BEP-9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    Request,
    Data,
    Reject,
}

/// One `ut_metadata` message: a bencoded header dict, followed by the
/// raw chunk bytes for `Data` messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub kind: MetadataKind,
    pub piece: u32,
    pub total_size: Option<u32>,
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            kind: MetadataKind::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: u32, total_size: u32, data: Bytes) -> Self {
        Self {
            kind: MetadataKind::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            kind: MetadataKind::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let msg_type = match self.kind {
            MetadataKind::Request => 0,
            MetadataKind::Data => 1,
            MetadataKind::Reject => 2,
        };
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"msg_type"), Value::Int(msg_type));
        dict.insert(Bytes::from_static(b"piece"), Value::Int(i64::from(self.piece)));
        if let Some(total) = self.total_size {
            dict.insert(Bytes::from_static(b"total_size"), Value::Int(i64::from(total)));
        }
        let mut out = encode(&Value::Dict(dict));
        if let Some(data) = &self.data {
            out.extend_from_slice(data);
        }
        Bytes::from(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, used) = decode_prefix(payload)?;
        let dict = header
            .as_dict()
            .ok_or(PeerError::Extension("expected dict"))?;

        let kind = match dict.get(b"msg_type".as_slice()).and_then(|v| v.as_int()) {
            Some(0) => MetadataKind::Request,
            Some(1) => MetadataKind::Data,
            Some(2) => MetadataKind::Reject,
            _ => return Err(PeerError::Extension("bad msg_type")),
        };
        let piece = dict
            .get(b"piece".as_slice())
            .and_then(|v| v.as_int())
            .filter(|&p| (0..=i64::from(u32::MAX)).contains(&p))
            .ok_or(PeerError::Extension("missing piece"))? as u32;
        let total_size = dict
            .get(b"total_size".as_slice())
            .and_then(|v| v.as_int())
            .filter(|&s| s >= 0)
            .map(|s| s as u32);
        let data = match kind {
            MetadataKind::Data => Some(Bytes::copy_from_slice(&payload[used..])),
            _ => None,
        };

        Ok(Self {
            kind,
            piece,
            total_size,
            data,
        })
    }
}
