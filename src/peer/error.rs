use thiserror::Error;

/// Errors raised on a single peer connection.
///
/// All of these are grounds for closing the offending peer; none of
/// them affect the rest of the swarm.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed framing, unknown message ID or bad payload length.
    #[error("invalid wire message: {0}")]
    InvalidWireMessage(&'static str),

    /// A message that is illegal in the current state, e.g. `Piece`
    /// before the info dictionary is known.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Frame larger than the configured limit.
    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),

    /// The remote closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// No data inside the idle window.
    #[error("read timeout")]
    Timeout,

    #[error("extension message error: {0}")]
    Extension(&'static str),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
