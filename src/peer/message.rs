use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;

/// Reserved-bit flags exchanged in the BitTorrent handshake.
///
/// Byte 5 bit 0x10 advertises the extension protocol (BEP-10), byte 7
/// bit 0x04 the fast extension (BEP-6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extensions(pub [u8; 8]);

impl Extensions {
    /// The flags this client sends: extension protocol plus fast extension.
    pub fn ours() -> Self {
        let mut bits = [0u8; 8];
        bits[5] |= 0x10;
        bits[7] |= 0x04;
        Self(bits)
    }

    pub fn none() -> Self {
        Self([0u8; 8])
    }

    pub fn fast(&self) -> bool {
        self.0[7] & 0x04 != 0
    }

    pub fn extension_protocol(&self) -> bool {
        self.0[5] & 0x10 != 0
    }

    /// Flags common to both sides of a handshake.
    pub fn intersect(&self, other: &Extensions) -> Extensions {
        let mut bits = [0u8; 8];
        for i in 0..8 {
            bits[i] = self.0[i] & other.0[i];
        }
        Extensions(bits)
    }
}

/// A peer wire message, excluding the handshake.
///
/// On the wire each message is a 4-byte big-endian length, then (unless
/// it is a keep-alive) a single-byte type ID and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    // Fast extension (BEP-6)
    Suggest { index: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { index: u32 },
    // Extension protocol (BEP-10)
    Extended { id: u8, payload: Bytes },
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_SUGGEST: u8 = 13;
const ID_HAVE_ALL: u8 = 14;
const ID_HAVE_NONE: u8 = 15;
const ID_REJECT: u8 = 16;
const ID_ALLOWED_FAST: u8 = 17;
const ID_EXTENDED: u8 = 20;

impl Message {
    /// Appends the framed message, length prefix included.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => Self::bare(buf, ID_CHOKE),
            Message::Unchoke => Self::bare(buf, ID_UNCHOKE),
            Message::Interested => Self::bare(buf, ID_INTERESTED),
            Message::NotInterested => Self::bare(buf, ID_NOT_INTERESTED),
            Message::Have { index } => Self::index_only(buf, ID_HAVE, *index),
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(ID_BITFIELD);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => Self::triple(buf, ID_REQUEST, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(ID_PIECE);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => Self::triple(buf, ID_CANCEL, *index, *begin, *length),
            Message::Suggest { index } => Self::index_only(buf, ID_SUGGEST, *index),
            Message::HaveAll => Self::bare(buf, ID_HAVE_ALL),
            Message::HaveNone => Self::bare(buf, ID_HAVE_NONE),
            Message::Reject {
                index,
                begin,
                length,
            } => Self::triple(buf, ID_REJECT, *index, *begin, *length),
            Message::AllowedFast { index } => Self::index_only(buf, ID_ALLOWED_FAST, *index),
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(ID_EXTENDED);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
    }

    /// Encodes the framed message into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes one frame body (the bytes after the length prefix).
    ///
    /// An empty frame is a keep-alive. Payload lengths are checked
    /// exactly; anything off closes the peer as an invalid wire message.
    pub fn decode(mut frame: Bytes) -> Result<Self, PeerError> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = frame.get_u8();
        let msg = match id {
            ID_CHOKE => Self::expect_empty(frame, Message::Choke)?,
            ID_UNCHOKE => Self::expect_empty(frame, Message::Unchoke)?,
            ID_INTERESTED => Self::expect_empty(frame, Message::Interested)?,
            ID_NOT_INTERESTED => Self::expect_empty(frame, Message::NotInterested)?,
            ID_HAVE => Message::Have {
                index: Self::expect_u32(&mut frame)?,
            },
            ID_BITFIELD => Message::Bitfield(frame),
            ID_REQUEST => {
                let (index, begin, length) = Self::expect_triple(&mut frame)?;
                Message::Request {
                    index,
                    begin,
                    length,
                }
            }
            ID_PIECE => {
                if frame.len() < 8 {
                    return Err(PeerError::InvalidWireMessage("piece too short"));
                }
                let index = frame.get_u32();
                let begin = frame.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: frame,
                }
            }
            ID_CANCEL => {
                let (index, begin, length) = Self::expect_triple(&mut frame)?;
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
            ID_SUGGEST => Message::Suggest {
                index: Self::expect_u32(&mut frame)?,
            },
            ID_HAVE_ALL => Self::expect_empty(frame, Message::HaveAll)?,
            ID_HAVE_NONE => Self::expect_empty(frame, Message::HaveNone)?,
            ID_REJECT => {
                let (index, begin, length) = Self::expect_triple(&mut frame)?;
                Message::Reject {
                    index,
                    begin,
                    length,
                }
            }
            ID_ALLOWED_FAST => Message::AllowedFast {
                index: Self::expect_u32(&mut frame)?,
            },
            ID_EXTENDED => {
                if frame.is_empty() {
                    return Err(PeerError::InvalidWireMessage("extended too short"));
                }
                let id = frame.get_u8();
                Message::Extended { id, payload: frame }
            }
            _ => return Err(PeerError::InvalidWireMessage("unknown message id")),
        };
        Ok(msg)
    }

    fn bare(buf: &mut BytesMut, id: u8) {
        buf.put_u32(1);
        buf.put_u8(id);
    }

    fn index_only(buf: &mut BytesMut, id: u8, index: u32) {
        buf.put_u32(5);
        buf.put_u8(id);
        buf.put_u32(index);
    }

    fn triple(buf: &mut BytesMut, id: u8, index: u32, begin: u32, length: u32) {
        buf.put_u32(13);
        buf.put_u8(id);
        buf.put_u32(index);
        buf.put_u32(begin);
        buf.put_u32(length);
    }

    fn expect_empty(frame: Bytes, msg: Message) -> Result<Message, PeerError> {
        if frame.is_empty() {
            Ok(msg)
        } else {
            Err(PeerError::InvalidWireMessage("unexpected payload"))
        }
    }

    fn expect_u32(frame: &mut Bytes) -> Result<u32, PeerError> {
        if frame.len() != 4 {
            return Err(PeerError::InvalidWireMessage("expected 4-byte payload"));
        }
        Ok(frame.get_u32())
    }

    fn expect_triple(frame: &mut Bytes) -> Result<(u32, u32, u32), PeerError> {
        if frame.len() != 12 {
            return Err(PeerError::InvalidWireMessage("expected 12-byte payload"));
        }
        Ok((frame.get_u32(), frame.get_u32(), frame.get_u32()))
    }
}
