use rand::Rng;
use tracing::trace;

use super::state::EngineState;
use crate::peer::{Message, PeerKey};

/// Peers kept unchoked by the regular tick, optimistic slot excluded.
const REGULAR_UNCHOKE_SLOTS: usize = 3;

impl EngineState {
    /// Regular tit-for-tat tick (every 10 s): unchoke the three peers
    /// that uploaded to us the most this period, choke the rest, and
    /// zero every counter. The optimistic pick is left alone.
    pub(super) fn tick_unchoke(&mut self) {
        if !self.running {
            return;
        }

        let mut ranked: Vec<(PeerKey, u64)> = self
            .peers
            .values()
            .filter(|peer| !peer.optimistic_unchoked)
            .map(|peer| (peer.key, peer.bytes_in_choke_period))
            .collect();
        // Key order breaks byte-count ties deterministically.
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0 .0.cmp(&b.0 .0)));

        for peer in self.peers.values_mut() {
            peer.bytes_in_choke_period = 0;
        }

        let winners: Vec<PeerKey> = ranked
            .iter()
            .take(REGULAR_UNCHOKE_SLOTS)
            .map(|(key, _)| *key)
            .collect();
        trace!("unchoke tick, winners: {winners:?}");

        for (key, _) in ranked {
            if winners.contains(&key) {
                self.unchoke(key);
            } else {
                self.choke(key);
            }
        }
    }

    /// Optimistic tick (every 30 s): rotate the randomly unchoked peer
    /// so cold peers get a chance to prove themselves.
    pub(super) fn tick_optimistic(&mut self) {
        if !self.running {
            return;
        }

        // Candidates are the peers still choked and not already the
        // optimistic pick; snapshot before rotating the old one out.
        let mut pool: Vec<PeerKey> = self
            .peers
            .values()
            .filter(|peer| !peer.optimistic_unchoked && peer.am_choking)
            .map(|peer| peer.key)
            .collect();
        pool.sort_by_key(|key| key.0);

        if let Some(previous) = self.optimistic.take() {
            if let Some(peer) = self.peers.get_mut(&previous) {
                peer.optimistic_unchoked = false;
            }
            self.choke(previous);
        }

        if pool.is_empty() {
            return;
        }
        let pick = pool[self.rng.random_range(0..pool.len())];
        trace!(peer = pick.0, "optimistic unchoke");
        if let Some(peer) = self.peers.get_mut(&pick) {
            peer.optimistic_unchoked = true;
        }
        self.unchoke(pick);
        self.optimistic = Some(pick);
    }

    /// Sends `Unchoke` only on an actual transition.
    pub(super) fn unchoke(&mut self, key: PeerKey) {
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        if peer.am_choking {
            peer.am_choking = false;
            self.send_message(key, Message::Unchoke);
        }
    }

    /// Sends `Choke` only on an actual transition.
    pub(super) fn choke(&mut self, key: PeerKey) {
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        if !peer.am_choking {
            peer.am_choking = true;
            self.send_message(key, Message::Choke);
        }
    }
}
