use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::state::EngineState;
use crate::handshake::Established;
use crate::mse::Cipher;
use crate::peer::{
    allowed_fast_set, read_loop, write_loop, ExtensionHandshake, Extensions, Message, PeerCommand,
    PeerId, PeerKey, EXTENSION_HANDSHAKE_ID,
};

/// Pieces granted as allowed-fast to each fast-extension peer.
const ALLOWED_FAST_GRANTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PeerSource {
    Incoming,
    Outgoing,
}

/// Engine-side state of one connected peer.
///
/// The connection itself lives in two tasks (reader and writer); this
/// holds the flags, counters and the bounded outbound queue.
pub(super) struct Peer {
    pub key: PeerKey,
    pub id: PeerId,
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub cipher: Cipher,
    /// Both sides speak the fast extension.
    pub fast: bool,
    /// Both sides speak the extension protocol.
    pub extension_protocol: bool,
    pub ext_handshake: Option<ExtensionHandshake>,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub optimistic_unchoked: bool,

    /// Bytes received this choke period; the tit-for-tat ranking key.
    pub bytes_in_choke_period: u64,
    /// Corrupt pieces traced back to this peer.
    pub misbehaviour: u32,
    /// Messages received before the bitfield existed, replayed in
    /// order once it does.
    pub parked: Vec<Message>,
    /// Pieces this peer may request from us while we choke it.
    pub our_allowed_fast: HashSet<u32>,

    pub tx: mpsc::Sender<PeerCommand>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl EngineState {
    /// Adopts an established connection as a peer, spawning its I/O
    /// tasks. Duplicate identities are rejected here.
    pub(super) fn start_peer(
        &mut self,
        established: Established,
        addr: SocketAddr,
        source: PeerSource,
    ) {
        if self.peer_ids.contains_key(&established.peer_id) {
            debug!("peer {:?} already connected, dropping", established.peer_id);
            self.connected_ips.remove(&addr.ip());
            return;
        }

        let key = PeerKey(self.next_key);
        self.next_key += 1;

        let negotiated = established.extensions.intersect(&Extensions::ours());
        let (reader_half, writer_half) = established.stream.into_split();
        let (tx, rx) = mpsc::channel(self.config.peer_queue_len);
        let reader = tokio::spawn(read_loop(
            reader_half,
            key,
            self.ch.events_tx.clone(),
            self.ch.disconnect_tx.clone(),
        ));
        let writer = tokio::spawn(write_loop(writer_half, rx));

        let peer = Peer {
            key,
            id: established.peer_id,
            addr,
            source,
            cipher: established.cipher,
            fast: negotiated.fast(),
            extension_protocol: negotiated.extension_protocol(),
            ext_handshake: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            optimistic_unchoked: false,
            bytes_in_choke_period: 0,
            misbehaviour: 0,
            parked: Vec::new(),
            our_allowed_fast: HashSet::new(),
            tx,
            reader,
            writer,
        };
        debug!(
            peer = key.0,
            "new {:?} peer {} ({:?})", source, addr, peer.cipher
        );
        self.peer_ids.insert(peer.id, key);
        self.peers.insert(key, peer);

        self.send_first_messages(key);
        // A young swarm gets unchoked immediately; the choker takes
        // over from the first tick.
        if self.peers.len() <= 4 {
            self.unchoke(key);
        }
    }

    /// The opening sequence: piece inventory, extension handshake and
    /// allowed-fast grants.
    fn send_first_messages(&mut self, key: PeerKey) {
        let Some(peer) = self.peers.get(&key) else { return };
        let fast = peer.fast;
        let extension_protocol = peer.extension_protocol;
        let peer_ip = peer.addr.ip();

        let inventory = match &self.bitfield {
            Some(bitfield) if fast && bitfield.all() => Some(Message::HaveAll),
            Some(bitfield) if fast && bitfield.count() == 0 => Some(Message::HaveNone),
            Some(bitfield) => Some(Message::Bitfield(bitfield.to_bytes())),
            None if fast => Some(Message::HaveNone),
            None => None,
        };
        if let Some(message) = inventory {
            if !self.send_message(key, message) {
                return;
            }
        }

        if extension_protocol {
            let metadata_size = self.info.as_ref().map(|info| info.raw.len() as u32);
            let port = self
                .listener_addr
                .map(|addr| addr.port())
                .unwrap_or(self.config.port);
            let handshake = ExtensionHandshake::ours(port, metadata_size);
            let message = Message::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload: handshake.encode(),
            };
            if !self.send_message(key, message) {
                return;
            }
        }

        if fast {
            if let Some(info) = self.info.clone() {
                let grants = allowed_fast_set(
                    self.info_hash.as_bytes(),
                    peer_ip,
                    info.num_pieces,
                    ALLOWED_FAST_GRANTS,
                );
                for &index in &grants {
                    if !self.send_message(key, Message::AllowedFast { index }) {
                        return;
                    }
                }
                if let Some(peer) = self.peers.get_mut(&key) {
                    peer.our_allowed_fast = grants.into_iter().collect();
                }
            }
        }
    }

    /// Removes a peer and everything keyed on it.
    pub(super) fn close_peer(&mut self, key: PeerKey) {
        let Some(peer) = self.peers.remove(&key) else {
            return;
        };
        trace!(peer = key.0, "closing peer {}", peer.addr);
        self.peer_ids.remove(&peer.id);
        self.connected_ips.remove(&peer.addr.ip());
        peer.reader.abort();
        peer.writer.abort();

        if let Some(download) = self.piece_downloads.remove(&key) {
            download.abort();
        }
        if let Some(download) = self.info_downloads.remove(&key) {
            download.abort();
        }
        for piece in &mut self.pieces {
            piece.having.remove(&key);
            piece.allowed_fast.remove(&key);
            piece.requested.remove(&key);
        }
        if self.optimistic == Some(key) {
            self.optimistic = None;
        }
    }

    /// Queues a command on the peer's bounded outbound channel. A full
    /// queue means the peer cannot keep up and is closed.
    pub(super) fn send_to_peer(&mut self, key: PeerKey, command: PeerCommand) -> bool {
        let Some(peer) = self.peers.get(&key) else {
            return false;
        };
        match peer.tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(peer = key.0, "outbound queue overflow, closing");
                self.close_peer(key);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close_peer(key);
                false
            }
        }
    }

    pub(super) fn send_message(&mut self, key: PeerKey, message: Message) -> bool {
        self.send_to_peer(key, PeerCommand::Send(message))
    }

    /// Recomputes whether we want anything from this peer and tells it
    /// on transitions only.
    pub(super) fn update_interest(&mut self, key: PeerKey) {
        let Some(bitfield) = &self.bitfield else {
            return;
        };
        let Some(peer) = self.peers.get(&key) else {
            return;
        };
        let interested = self
            .pieces
            .iter()
            .any(|piece| !bitfield.test(piece.index) && piece.having.contains(&key));

        if interested != peer.am_interested {
            let message = if interested {
                Message::Interested
            } else {
                Message::NotInterested
            };
            if let Some(peer) = self.peers.get_mut(&key) {
                peer.am_interested = interested;
            }
            self.send_message(key, message);
        }
    }

    /// Replays messages that peers sent before the bitfield existed.
    pub(super) async fn process_parked(&mut self) {
        let queued: Vec<(PeerKey, Vec<Message>)> = self
            .peers
            .values_mut()
            .filter(|peer| !peer.parked.is_empty())
            .map(|peer| (peer.key, std::mem::take(&mut peer.parked)))
            .collect();
        for (key, messages) in queued {
            for message in messages {
                self.handle_message(key, message).await;
            }
        }
    }
}

/// Re-exported for the engine tests: fabricates a peer without a socket.
#[cfg(test)]
impl Peer {
    pub(super) fn fake(key: PeerKey, id: PeerId) -> (Peer, mpsc::Receiver<PeerCommand>) {
        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(async {});
        let writer = tokio::spawn(async {});
        let peer = Peer {
            key,
            id,
            addr: "127.0.0.1:1".parse().expect("fixed addr"),
            source: PeerSource::Outgoing,
            cipher: Cipher::Plain,
            fast: true,
            extension_protocol: true,
            ext_handshake: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            optimistic_unchoked: false,
            bytes_in_choke_period: 0,
            misbehaviour: 0,
            parked: Vec::new(),
            our_allowed_fast: HashSet::new(),
            tx,
            reader,
            writer,
        };
        (peer, rx)
    }
}
