use thiserror::Error;

use crate::storage::base::Address;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The file does not hold a readable array (bad magic, unsupported
    /// version, undecodable record).
    #[error("Format error: {0}")]
    Format(String),
    /// A page or chunk address is invalid, unreachable, or a chain is broken.
    #[error("Address error at {address}: {reason}")]
    Address { address: Address, reason: String },
    /// The allocator could not satisfy a request.
    #[error("Capacity error: {0}")]
    Capacity(String),
    #[error("Position {position} out of range (count {count})")]
    Bounds { position: u64, count: u64 },
    /// Counters or links disagree with each other.
    #[error("Inconsistent state: {0}")]
    State(String),
    #[error("Page at {address} is full")]
    PageFull { address: Address },
    #[error("Size mismatch: expected {expected} bytes, found {actual}")]
    Size { expected: u64, actual: u64 },
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn address(address: Address, reason: impl Into<String>) -> Self {
        Error::Address {
            address,
            reason: reason.into(),
        }
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(err: bincode::error::EncodeError) -> Self {
        Error::Format(format!("encode: {}", err))
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::Format(format!("decode: {}", err))
    }
}
