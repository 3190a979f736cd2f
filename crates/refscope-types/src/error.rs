use thiserror::Error;

/// Errors produced when parsing an object id.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("object id is not hex: {0}")]
    InvalidHex(String),

    #[error("object id has {actual} bytes, expected {expected}")]
    InvalidLength { expected: usize, actual: usize },
}
