//! Error types for dbqueue
//!
//! Two layers: `DbQueueError` for the client itself (construction, submission,
//! configuration) and `DriverError` for outcomes reported by a store driver.
//! Driver errors never abort a call chain; they travel to callbacks inside a
//! `Reply`.

use std::io;
use thiserror::Error;

/// Result type alias for dbqueue operations
pub type Result<T> = std::result::Result<T, DbQueueError>;

/// Result type returned by store drivers
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors raised by the client facade
#[derive(Error, Debug)]
pub enum DbQueueError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Address parse error: {0}")]
    Address(String),

    #[error("Driver connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: DriverError,
    },

    #[error("Console command error: {0}")]
    Console(String),

    #[error("Client stopped: {0} command rejected")]
    Stopped(&'static str),
}

impl From<nom::Err<nom::error::Error<&str>>> for DbQueueError {
    fn from(err: nom::Err<nom::error::Error<&str>>) -> Self {
        DbQueueError::Address(format!("Parse error: {:?}", err))
    }
}

/// Outcome errors reported by a store driver.
///
/// `NotFound` is the not-found sentinel: it classifies as MISS and is not
/// logged. Every other variant classifies as FAIL.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("not found")]
    NotFound,

    #[error("wrong type: operation against key {key} holding the wrong kind of value")]
    WrongType { key: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("driver panicked: {0}")]
    Panicked(String),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound)
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::Decode(err.to_string())
    }
}
