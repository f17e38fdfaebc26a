use thiserror::Error;

/// Errors from a tracker transport.
///
/// The announcer recovers from all of these with backoff; none are
/// fatal to the torrent.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed response: {0}")]
    InvalidResponse(&'static str),

    /// The tracker answered with a `failure reason`.
    #[error("tracker failure: {0}")]
    Failure(String),
}
