use std::fmt::Display;

pub type Result<T> = std::result::Result<T, Error>;

// Errors specific to bencoding on top of those present in serde.
#[derive(Debug, thiserror::Error)]
pub enum Error {

    #[error("unexpected end of input at byte {0}")]
    Eof(usize),

    // Type valid but unexpected token.
    #[error("invalid token at byte {pos}: expected {expected}, found {found:?}")]
    InvalidToken {
        pos: usize,
        expected: &'static str,
        found: char,
    },

    #[error("invalid integer at byte {0}")]
    InvalidInteger(usize),

    // Attempted to deserialize an invalid type.
    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("trailing data after value at byte {0}")]
    TrailingData(usize),

    // Lists and dicts nested deeper than the decoder allows.
    #[error("nesting too deep at byte {0}")]
    TooDeep(usize),

    #[error("{0}")]
    Custom(String),

}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self where T: Display {
        Error::Custom(msg.to_string())
    }
}
