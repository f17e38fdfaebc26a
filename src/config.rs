use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one torrent engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen port for incoming peers; 0 picks an ephemeral port.
    pub port: u16,
    /// Incoming handshakes plus incoming peers above this are refused.
    pub max_peer_accept: usize,
    /// Outstanding outgoing dial attempts.
    pub max_dials: usize,
    /// Concurrent piece downloads across all peers.
    pub parallel_piece_downloads: usize,
    /// Concurrent metadata downloads while the info is unknown.
    pub parallel_info_downloads: usize,
    /// Block requests pipelined per piece download.
    pub max_requests_in: usize,
    /// Per-peer outbound queue; a peer that falls this far behind is dropped.
    pub peer_queue_len: usize,
    /// Deadline between requesting a block and receiving it.
    pub piece_read_timeout: Duration,
    /// Total deadline for one handshake, encryption included.
    pub handshake_timeout: Duration,
    /// Regular tit-for-tat unchoke cadence.
    pub unchoke_interval: Duration,
    /// Optimistic unchoke cadence.
    pub optimistic_unchoke_interval: Duration,
    /// Offer MSE on outgoing connections, accept it on incoming ones.
    pub enable_encryption: bool,
    /// Refuse any peer that ends up on a plaintext stream.
    pub force_encryption: bool,
    /// Corrupt pieces tolerated from one peer before disconnecting it.
    pub misbehaviour_limit: u32,
    /// Directory for resume data; `None` disables resume entirely.
    pub resume_dir: Option<PathBuf>,
    /// Fixed RNG seed for the piece picker and choker, for tests.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            max_peer_accept: 40,
            max_dials: 8,
            parallel_piece_downloads: 4,
            parallel_info_downloads: 2,
            max_requests_in: 10,
            peer_queue_len: 256,
            piece_read_timeout: Duration::from_secs(4),
            handshake_timeout: Duration::from_secs(10),
            unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            enable_encryption: true,
            force_encryption: false,
            misbehaviour_limit: 3,
            resume_dir: None,
            rng_seed: None,
        }
    }
}
