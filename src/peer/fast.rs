use std::net::IpAddr;

use sha1::{Digest, Sha1};

/// Computes a peer's allowed-fast set (BEP-6).
///
/// The set is a deterministic function of the peer's masked IP and the
/// info hash, so both sides can derive the same pieces. IPv4 addresses
/// are masked to /24, IPv6 to their first four bytes.
pub fn allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    set_size: u32,
) -> Vec<u32> {
    if num_pieces == 0 {
        return Vec::new();
    }
    let set_size = set_size.min(num_pieces) as usize;

    let masked: [u8; 4] = match peer_ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], 0]
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], o[3]]
        }
    };

    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&masked);
    seed.extend_from_slice(info_hash);

    let mut set = Vec::with_capacity(set_size);
    while set.len() < set_size {
        let digest = Sha1::digest(&seed);
        for word in digest.chunks_exact(4) {
            if set.len() >= set_size {
                break;
            }
            let index = u32::from_be_bytes([word[0], word[1], word[2], word[3]]) % num_pieces;
            if !set.contains(&index) {
                set.push(index);
            }
        }
        seed = digest.to_vec();
    }
    set
}
