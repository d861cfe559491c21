use std::fmt::Display;

pub type Result<T> = std::result::Result<T, Error>;

// Errors specific to bencoding on top of those present in serde.
// Decode errors carry the byte offset into the input where they were detected.
#[derive(Debug, thiserror::Error)]
pub enum Error {

    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: usize },

    // Leading byte is not one of i, l, d, e or a digit.
    #[error("invalid token {found:?} at byte {offset}")]
    InvalidToken { offset: usize, found: char },

    // Non-digits, leading zeros, negative zero or overflow.
    #[error("invalid integer at byte {offset}")]
    InvalidInteger { offset: usize },

    #[error("string length {len} at byte {offset} exceeds remaining {remaining} bytes")]
    LengthOutOfBounds { offset: usize, len: usize, remaining: usize },

    #[error("missing terminating 'e' for value starting at byte {offset}")]
    MissingTerminator { offset: usize },

    #[error("unexpected trailing data at byte {offset}")]
    TrailingData { offset: usize },

    // Valid token, wrong type for the target.
    #[error("expected {expected} at byte {offset}")]
    UnexpectedToken { expected: &'static str, offset: usize },

    #[error("invalid utf-8 in string at byte {offset}")]
    InvalidUtf8 { offset: usize },

    // Attempted to serialize a type bencode can't represent.
    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("map serialization error: {0}")]
    MapSerializationOrder(String),

    #[error("{0}")]
    Custom(String),

}

impl serde::ser::Error for Error {
    fn custom<T>(msg:T) -> Self where T:Display {
        Error::Custom(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T>(msg:T) -> Self where T:Display {
        Error::Custom(msg.to_string())
    }
}
