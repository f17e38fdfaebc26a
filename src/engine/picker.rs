use rand::rngs::StdRng;
use rand::Rng;

use super::piece::PieceState;
use crate::peer::{Bitfield, PeerKey};

/// How many pieces are fetched purely at random before rarest-first
/// kicks in; gives a fresh torrent something to upload quickly.
const START_PHASE_PIECES: u32 = 4;

/// Picks the next (piece, peer) pair to download.
///
/// Pieces already owned, being written, or already being downloaded are
/// skipped. `peer_ok` decides whether a peer can serve a piece right
/// now (connected, idle, and unchoked or allowed-fast). Selection is
/// rarest-first with uniform random tie-breaks, so identical swarms do
/// not converge on the same order.
pub(crate) fn pick(
    pieces: &[PieceState],
    bitfield: &Bitfield,
    peer_ok: impl Fn(PeerKey, &PieceState) -> bool,
    rng: &mut StdRng,
) -> Option<(u32, PeerKey)> {
    let candidates: Vec<(&PieceState, Vec<PeerKey>)> = pieces
        .iter()
        .filter(|p| !bitfield.test(p.index) && !p.writing && p.requested.is_empty())
        .filter_map(|p| {
            let mut peers: Vec<PeerKey> =
                p.having.iter().copied().filter(|k| peer_ok(*k, p)).collect();
            // HashSet order is arbitrary; fix it so the random choice
            // below is the only source of randomness.
            peers.sort_by_key(|k| k.0);
            (!peers.is_empty()).then_some((p, peers))
        })
        .collect();

    if candidates.is_empty() {
        return None;
    }

    let start_phase = bitfield.count() < START_PHASE_PIECES;
    let (piece, peers) = if start_phase {
        &candidates[rng.random_range(0..candidates.len())]
    } else {
        let rarest = candidates
            .iter()
            .map(|(p, _)| p.having.len())
            .min()
            .expect("candidates not empty");
        let tied: Vec<&(&PieceState, Vec<PeerKey>)> = candidates
            .iter()
            .filter(|(p, _)| p.having.len() == rarest)
            .collect();
        tied[rng.random_range(0..tied.len())]
    };

    let peer = peers[rng.random_range(0..peers.len())];
    Some((piece.index, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn pieces_with_having(having: &[&[u64]]) -> Vec<PieceState> {
        having
            .iter()
            .enumerate()
            .map(|(i, keys)| PieceState {
                index: i as u32,
                hash: [0; 20],
                offset: i as u64 * 16384,
                length: 16384,
                having: keys.iter().map(|&k| PeerKey(k)).collect(),
                allowed_fast: Default::default(),
                requested: Default::default(),
                writing: false,
            })
            .collect()
    }

    /// Sets enough owned pieces outside the candidates to leave the
    /// random start phase.
    fn past_start_phase() -> Bitfield {
        let mut bf = Bitfield::new(16);
        for i in 8..12 {
            bf.set(i);
        }
        bf
    }

    #[test]
    fn prefers_rarest_piece() {
        let pieces = pieces_with_having(&[&[1, 2, 3], &[1], &[1, 2]]);
        let bitfield = past_start_phase();
        let mut rng = StdRng::seed_from_u64(7);

        let picked = pick(&pieces, &bitfield, |_, _| true, &mut rng).unwrap();
        assert_eq!(picked.0, 1, "rarest piece wins");
        assert_eq!(picked.1, PeerKey(1), "only eligible peer");
    }

    #[test]
    fn skips_owned_requested_and_writing() {
        let mut pieces = pieces_with_having(&[&[1], &[1], &[1], &[1]]);
        let mut bitfield = past_start_phase();
        bitfield.set(0);
        pieces[1].requested.insert(PeerKey(9));
        pieces[2].writing = true;

        let mut rng = StdRng::seed_from_u64(1);
        let picked = pick(&pieces, &bitfield, |_, _| true, &mut rng).unwrap();
        assert_eq!(picked.0, 3);
    }

    #[test]
    fn none_when_no_eligible_peer() {
        let pieces = pieces_with_having(&[&[1, 2]]);
        let bitfield = Bitfield::new(1);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(pick(&pieces, &bitfield, |_, _| false, &mut rng).is_none());
    }

    #[test]
    fn start_phase_spreads_over_available_pieces() {
        let pieces = pieces_with_having(&[&[1], &[1, 2], &[1, 2, 3], &[1, 2, 3, 4]]);
        let bitfield = Bitfield::new(16);
        let mut rng = StdRng::seed_from_u64(3);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let (index, _) = pick(&pieces, &bitfield, |_, _| true, &mut rng).unwrap();
            seen.insert(index);
        }
        // Random start-phase selection touches more than the rarest.
        assert!(seen.len() > 1);
    }
}
