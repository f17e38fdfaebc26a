use thiserror::Error;

/// Errors produced while decoding or encoding bencode data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A byte that cannot start or continue a value at this position.
    #[error("unexpected byte {0:#04x} at offset {1}")]
    UnexpectedByte(u8, usize),

    /// Malformed integer (empty, leading zeros, bad digits).
    #[error("invalid integer")]
    InvalidInteger,

    /// Malformed byte-string length prefix.
    #[error("invalid string length")]
    InvalidLength,

    /// A dictionary key that is not a byte string.
    #[error("dictionary key is not a byte string")]
    InvalidKey,

    /// Values nested deeper than the decoder allows.
    #[error("nesting too deep")]
    TooDeep,

    /// Bytes left over after a complete value.
    #[error("trailing data after value")]
    TrailingData,
}
