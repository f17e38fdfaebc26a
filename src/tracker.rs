//! Tracker interface: the announce contract the engine consumes, plus
//! the HTTP transport.

mod error;
mod http;


pub use error::TrackerError;
pub use http::HttpTracker;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::metainfo::InfoHash;
use crate::peer::PeerId;

/// The lifecycle event attached to an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Periodic announce, no event parameter on the wire.
    None,
    Started,
    Completed,
    Stopped,
}

impl Event {
    pub(crate) fn as_query(&self) -> Option<&'static str> {
        match self {
            Event::None => None,
            Event::Started => Some("started"),
            Event::Completed => Some("completed"),
            Event::Stopped => Some("stopped"),
        }
    }
}

/// A snapshot of the torrent's transfer state, fetched from the engine
/// right before each announce.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// 64-bit; `u64::MAX` only when the total size itself is unknown.
    pub bytes_left: u64,
}

/// A successful announce response.
#[derive(Debug, Clone)]
pub struct Announce {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

/// One tracker transport. Implementations are stateless between calls;
/// retry policy lives in the announcer.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn announce(&self, transfer: &Transfer, event: Event) -> Result<Announce, TrackerError>;

    fn url(&self) -> &str;
}

/// Builds the transport for a tracker URL.
pub fn from_url(url: &str) -> Result<Box<dyn Tracker>, TrackerError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Box::new(HttpTracker::new(url)?))
    } else {
        Err(TrackerError::UnsupportedScheme(url.to_owned()))
    }
}
