//! Error types for the agent.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WASM error: {0}")]
    Wasm(String),

    #[error("Guest memory access out of bounds: offset {offset}, length {len}, memory size {memory_size}")]
    OutOfBounds {
        offset: u64,
        len: u64,
        memory_size: usize,
    },

    #[error("Buffer not large enough to encode string. Buffer capacity: {capacity}, to encode: {needed}")]
    BufferOverflow { needed: usize, capacity: usize },

    #[error("Value {value} does not fit in a {width}-byte integer")]
    IntegerOverflow { value: u64, width: usize },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Guest export missing: {0}")]
    MissingExport(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::Decode(err.to_string())
    }
}
