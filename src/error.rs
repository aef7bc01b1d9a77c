use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Incomplete: {0}")]
    Incomplete(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<tokio::time::error::Elapsed> for SwarmError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        SwarmError::Timeout(err.to_string())
    }
}

impl SwarmError {
    /// Wire code for this error. Local-only failures travel as protocol errors.
    pub fn code(&self) -> ErrorCode {
        match self {
            SwarmError::NotFound(_) => ErrorCode::NotFound,
            SwarmError::Unavailable(_) => ErrorCode::Unavailable,
            SwarmError::OutOfRange(_) => ErrorCode::OutOfRange,
            SwarmError::Timeout(_) => ErrorCode::Timeout,
            SwarmError::Incomplete(_) => ErrorCode::Incomplete,
            SwarmError::ProtocolError(_)
            | SwarmError::ConfigError(_)
            | SwarmError::IoError(_)
            | SwarmError::JsonError(_) => ErrorCode::ProtocolError,
        }
    }

    /// True for errors that end a connection rather than a single request.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            SwarmError::IoError(_) | SwarmError::Timeout(_) | SwarmError::ProtocolError(_)
        )
    }
}

/// Error taxonomy as carried by both wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Unavailable,
    OutOfRange,
    Timeout,
    ProtocolError,
    Incomplete,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ErrorCode::NotFound => 1,
            ErrorCode::Unavailable => 2,
            ErrorCode::OutOfRange => 3,
            ErrorCode::Timeout => 4,
            ErrorCode::ProtocolError => 5,
            ErrorCode::Incomplete => 6,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ErrorCode::NotFound),
            2 => Some(ErrorCode::Unavailable),
            3 => Some(ErrorCode::OutOfRange),
            4 => Some(ErrorCode::Timeout),
            5 => Some(ErrorCode::ProtocolError),
            6 => Some(ErrorCode::Incomplete),
            _ => None,
        }
    }

    pub fn into_error(self, message: impl Into<String>) -> SwarmError {
        let message = message.into();
        match self {
            ErrorCode::NotFound => SwarmError::NotFound(message),
            ErrorCode::Unavailable => SwarmError::Unavailable(message),
            ErrorCode::OutOfRange => SwarmError::OutOfRange(message),
            ErrorCode::Timeout => SwarmError::Timeout(message),
            ErrorCode::ProtocolError => SwarmError::ProtocolError(message),
            ErrorCode::Incomplete => SwarmError::Incomplete(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;
