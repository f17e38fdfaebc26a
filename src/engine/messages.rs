use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::state::EngineState;
use crate::peer::{
    Bitfield, MetadataKind, MetadataMessage, Message, PeerCommand, PeerKey,
    EXTENSION_HANDSHAKE_ID, LOCAL_METADATA_ID, METADATA_PIECE_SIZE,
};

/// Largest block we are willing to serve in one request.
const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

impl EngineState {
    /// Dispatches one message from one peer. Runs to completion before
    /// the next event; this is the serialisation point for all peer
    /// traffic.
    pub(super) async fn handle_message(&mut self, key: PeerKey, message: Message) {
        if !self.peers.contains_key(&key) {
            return;
        }
        match message {
            Message::KeepAlive => {}

            Message::Choke => self.on_choke_state(key, true),
            Message::Unchoke => self.on_choke_state(key, false),

            Message::Interested => {
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.peer_interested = true;
                    trace!(peer = key.0, "peer interested: {}", peer.peer_interested);
                }
            }
            Message::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.peer_interested = false;
                    trace!(peer = key.0, "peer interested: {}", peer.peer_interested);
                }
            }

            Message::Have { index } => self.on_have(key, index),
            Message::Bitfield(bytes) => self.on_bitfield(key, bytes),
            Message::HaveAll => self.on_have_all(key),
            // A peer with nothing needs no bookkeeping.
            Message::HaveNone => {}
            Message::AllowedFast { index } => self.on_allowed_fast(key, index),
            Message::Suggest { index } => {
                trace!(peer = key.0, "peer suggests piece {index}");
            }

            Message::Request {
                index,
                begin,
                length,
            } => self.on_request(key, index, begin, length),
            Message::Piece { index, begin, data } => self.on_piece(key, index, begin, data),
            Message::Cancel { index, .. } => {
                // The upload queue is small and bounded; a cancelled
                // block is at worst served once.
                trace!(peer = key.0, "cancel for piece {index}");
            }
            Message::Reject {
                index,
                begin,
                length,
            } => self.on_reject(key, index, begin, length),

            Message::Extended { id, payload } => self.on_extended(key, id, payload),
        }
    }

    fn protocol_violation(&mut self, key: PeerKey, what: &str) {
        warn!(peer = key.0, "protocol violation: {what}");
        self.close_peer(key);
    }

    fn on_choke_state(&mut self, key: PeerKey, choked: bool) {
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.peer_choking = choked;
        }
        if let Some(download) = self.piece_downloads.get(&key) {
            download.deliver_choke(choked);
        }
    }

    fn on_have(&mut self, key: PeerKey, index: u32) {
        if self.bitfield.is_none() {
            self.park(key, Message::Have { index });
            return;
        }
        if index as usize >= self.pieces.len() {
            self.protocol_violation(key, "have index out of range");
            return;
        }
        self.pieces[index as usize].having.insert(key);
        self.update_interest(key);
    }

    fn on_bitfield(&mut self, key: PeerKey, bytes: Bytes) {
        if self.bitfield.is_none() {
            self.park(key, Message::Bitfield(bytes));
            return;
        }
        let num_pieces = self.pieces.len() as u32;
        let Some(theirs) = Bitfield::from_bytes(&bytes, num_pieces) else {
            self.protocol_violation(key, "bitfield length mismatch");
            return;
        };
        for index in 0..num_pieces {
            if theirs.test(index) {
                self.pieces[index as usize].having.insert(key);
            }
        }
        self.update_interest(key);
    }

    fn on_have_all(&mut self, key: PeerKey) {
        if self.bitfield.is_none() {
            self.park(key, Message::HaveAll);
            return;
        }
        for piece in &mut self.pieces {
            piece.having.insert(key);
        }
        self.update_interest(key);
    }

    fn on_allowed_fast(&mut self, key: PeerKey, index: u32) {
        if self.bitfield.is_none() {
            self.park(key, Message::AllowedFast { index });
            return;
        }
        if index as usize >= self.pieces.len() {
            self.protocol_violation(key, "allowed-fast index out of range");
            return;
        }
        self.pieces[index as usize].allowed_fast.insert(key);
    }

    fn on_piece(&mut self, key: PeerKey, index: u32, begin: u32, data: Bytes) {
        if self.bitfield.is_none() {
            self.protocol_violation(key, "piece before info");
            return;
        }
        let Some(piece) = self.pieces.get(index as usize) else {
            self.protocol_violation(key, "piece index out of range");
            return;
        };
        if piece.find_block(begin, data.len() as u32).is_none() {
            self.protocol_violation(key, "piece block does not exist");
            return;
        }

        let len = data.len() as u64;
        if let Some(peer) = self.peers.get_mut(&key) {
            peer.bytes_in_choke_period += len;
        }
        self.bytes_downloaded += len;

        match self.piece_downloads.get(&key) {
            Some(download) if download.index == index => download.deliver_block(begin, data),
            // Late data from a download that already ended; ignore.
            _ => trace!(peer = key.0, "stray block for piece {index}"),
        }
    }

    fn on_request(&mut self, key: PeerKey, index: u32, begin: u32, length: u32) {
        if self.bitfield.is_none() {
            self.protocol_violation(key, "request before info");
            return;
        }
        let Some(piece) = self.pieces.get(index as usize) else {
            self.protocol_violation(key, "request index out of range");
            return;
        };
        if length == 0
            || length > MAX_REQUEST_LENGTH
            || u64::from(begin) + u64::from(length) > u64::from(piece.length)
        {
            self.protocol_violation(key, "request outside piece");
            return;
        }
        let offset = piece.offset + u64::from(begin);

        let have = self.bitfield.as_ref().is_some_and(|bf| bf.test(index));
        let Some(peer) = self.peers.get(&key) else {
            return;
        };
        let fast = peer.fast;
        let serve_while_choked = fast && peer.our_allowed_fast.contains(&index);

        if !have {
            if fast {
                self.send_message(key, Message::Reject { index, begin, length });
            } else {
                self.protocol_violation(key, "request for piece we do not have");
            }
            return;
        }

        let choking = self.peers.get(&key).map(|p| p.am_choking).unwrap_or(true);
        if choking && !serve_while_choked {
            if fast {
                self.send_message(key, Message::Reject { index, begin, length });
            }
            // A plain peer racing our choke just loses the request.
            return;
        }

        let Some(store) = self.store.clone() else {
            return;
        };
        self.bytes_uploaded += u64::from(length);
        self.send_to_peer(
            key,
            PeerCommand::SendBlock {
                index,
                begin,
                length,
                offset,
                store,
            },
        );
    }

    fn on_reject(&mut self, key: PeerKey, index: u32, begin: u32, length: u32) {
        if self.bitfield.is_none() {
            self.protocol_violation(key, "reject before info");
            return;
        }
        let Some(piece) = self.pieces.get(index as usize) else {
            self.protocol_violation(key, "reject index out of range");
            return;
        };
        let Some(block) = piece.find_block(begin, length) else {
            self.protocol_violation(key, "reject block does not exist");
            return;
        };
        match self.piece_downloads.get(&key) {
            Some(download) if download.index == index => download.deliver_reject(block),
            _ => {
                self.protocol_violation(key, "reject without active download");
            }
        }
    }

    fn on_extended(&mut self, key: PeerKey, id: u8, payload: Bytes) {
        match id {
            EXTENSION_HANDSHAKE_ID => {
                let handshake = match crate::peer::ExtensionHandshake::decode(&payload) {
                    Ok(handshake) => handshake,
                    Err(err) => {
                        debug!(peer = key.0, "bad extension handshake: {err}");
                        self.close_peer(key);
                        return;
                    }
                };
                trace!(peer = key.0, "extension handshake: {handshake:?}");
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.ext_handshake = Some(handshake);
                }
                // The info pump picks this peer up after the event.
            }
            LOCAL_METADATA_ID => {
                let message = match MetadataMessage::decode(&payload) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(peer = key.0, "bad metadata message: {err}");
                        self.close_peer(key);
                        return;
                    }
                };
                match message.kind {
                    MetadataKind::Request => self.serve_metadata(key, message.piece),
                    MetadataKind::Data => {
                        if let Some(download) = self.info_downloads.get(&key) {
                            download.deliver_chunk(message.piece, message.data.unwrap_or_default());
                        }
                    }
                    MetadataKind::Reject => {
                        if let Some(download) = self.info_downloads.remove(&key) {
                            debug!(peer = key.0, "peer rejected metadata request");
                            download.abort();
                        }
                        // Do not pick this peer again for metadata.
                        if let Some(peer) = self.peers.get_mut(&key) {
                            if let Some(hs) = peer.ext_handshake.as_mut() {
                                hs.metadata_size = None;
                            }
                        }
                    }
                }
            }
            other => trace!(peer = key.0, "unknown extension message {other}"),
        }
    }

    /// Answers a `ut_metadata` request out of the stored raw info bytes.
    fn serve_metadata(&mut self, key: PeerKey, piece: u32) {
        let Some(remote_id) = self
            .peers
            .get(&key)
            .and_then(|peer| peer.ext_handshake.as_ref())
            .and_then(|hs| hs.metadata_id())
        else {
            return;
        };

        let reply = match &self.info {
            Some(info) => {
                let total = info.raw.len() as u32;
                let start = piece.saturating_mul(METADATA_PIECE_SIZE);
                if start >= total {
                    MetadataMessage::reject(piece)
                } else {
                    let end = (start + METADATA_PIECE_SIZE).min(total);
                    let data = info.raw.slice(start as usize..end as usize);
                    MetadataMessage::data(piece, total, data)
                }
            }
            None => MetadataMessage::reject(piece),
        };
        self.send_message(
            key,
            Message::Extended {
                id: remote_id,
                payload: reply.encode(),
            },
        );
    }

    fn park(&mut self, key: PeerKey, message: Message) {
        if let Some(peer) = self.peers.get_mut(&key) {
            trace!(peer = key.0, "parking message until info is ready");
            peer.parked.push(message);
        }
    }
}
