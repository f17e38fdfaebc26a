use std::fmt;
use std::sync::OnceLock;

use rand::RngCore;

const PREFIX: &[u8; 8] = b"-RN0001-";

/// A 20-byte peer identity: client prefix plus random tail.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

static LOCAL: OnceLock<PeerId> = OnceLock::new();

impl PeerId {
    /// The local peer ID, generated once per process.
    pub fn local() -> PeerId {
        *LOCAL.get_or_init(PeerId::generate)
    }

    pub fn generate() -> PeerId {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PREFIX);
        rand::rng().fill_bytes(&mut id[8..]);
        PeerId(id)
    }

    pub fn from_bytes(bytes: [u8; 20]) -> PeerId {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The Azureus-style client tag, when the ID carries one.
    pub fn client(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId(")?;
        for b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", *b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        write!(f, ")")
    }
}
