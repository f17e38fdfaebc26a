use std::collections::HashSet;

use crate::metainfo::Info;
use crate::peer::PeerKey;

/// Unit of peer-to-peer transfer: a 16 KiB slice of a piece.
pub(crate) const BLOCK_SIZE: u32 = 16 * 1024;

/// One block of a piece; the last block of the last piece may be short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    pub begin: u32,
    pub length: u32,
}

/// Engine-side state of one piece.
pub(crate) struct PieceState {
    pub index: u32,
    pub hash: [u8; 20],
    /// Byte offset within the torrent's contiguous space.
    pub offset: u64,
    pub length: u32,
    /// Peers that advertise this piece.
    pub having: HashSet<PeerKey>,
    /// Peers that granted us allowed-fast for this piece.
    pub allowed_fast: HashSet<PeerKey>,
    /// Peers we are currently downloading this piece from.
    pub requested: HashSet<PeerKey>,
    /// A verified copy is sitting in the writer.
    pub writing: bool,
}

impl PieceState {
    /// Builds the piece table for a torrent.
    pub fn build(info: &Info) -> Vec<PieceState> {
        (0..info.num_pieces)
            .map(|index| PieceState {
                index,
                hash: info.piece_hash(index),
                offset: info.piece_offset(index),
                length: info.piece_length_of(index),
                having: HashSet::new(),
                allowed_fast: HashSet::new(),
                requested: HashSet::new(),
                writing: false,
            })
            .collect()
    }

    /// The piece's blocks in ascending offset order.
    pub fn blocks(&self) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(self.length.div_ceil(BLOCK_SIZE) as usize);
        let mut begin = 0;
        while begin < self.length {
            blocks.push(Block {
                begin,
                length: (self.length - begin).min(BLOCK_SIZE),
            });
            begin += BLOCK_SIZE;
        }
        blocks
    }

    /// Looks up the block with exactly this offset and length.
    pub fn find_block(&self, begin: u32, length: u32) -> Option<Block> {
        if begin % BLOCK_SIZE != 0 || begin >= self.length {
            return None;
        }
        let expected = (self.length - begin).min(BLOCK_SIZE);
        (length == expected).then_some(Block { begin, length })
    }
}
