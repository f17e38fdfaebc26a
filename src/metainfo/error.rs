use thiserror::Error;

/// Errors produced while parsing torrent metadata.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("missing required key: {0}")]
    MissingKey(&'static str),

    #[error("invalid value for key: {0}")]
    InvalidKey(&'static str),

    #[error("pieces string is not a multiple of 20 bytes")]
    InvalidPieces,

    #[error("file lengths do not cover the piece space")]
    InvalidLayout,

    #[error("invalid info hash")]
    InvalidInfoHash,

    #[error("invalid magnet link")]
    InvalidMagnet,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
