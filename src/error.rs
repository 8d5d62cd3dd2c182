//! Error types for the sync client
//!
//! The library reports a single [`Error`] enum everywhere. Each variant maps
//! onto a stable numeric [`ResultCode`] so host adapters can translate errors
//! across a language boundary without string matching.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the sync client
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: invalid JSON body, bad configuration, or an
    /// operation against a tombstoned document
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Document does not exist (or is tombstoned)
    #[error("Document not found: {0}")]
    NotFound(Uuid),

    /// SQLite failure; the enclosing operation was rolled back
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Transport-level failure. Never returned from local CRUD calls;
    /// surfaced through error events and `is_connected()`
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol frame or JSON payload could not be parsed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Defensive catch-all
    #[error("{0}")]
    Unknown(String),
}

/// Result type for sync client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable numeric result codes exposed at the host boundary
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    InvalidInput = -1,
    Connection = -2,
    Database = -3,
    Serialization = -4,
    Unknown = -99,
}

impl Error {
    /// Numeric code for this error
    ///
    /// `NotFound` reports `InvalidInput`: the boundary contract has no
    /// separate code for a missing document.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::InvalidInput(_) | Error::NotFound(_) => ResultCode::InvalidInput,
            Error::Database(_) => ResultCode::Database,
            Error::Connection(_) => ResultCode::Connection,
            Error::Serialization(_) => ResultCode::Serialization,
            Error::Unknown(_) => ResultCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::InvalidInput("bad".into()).code(),
            ResultCode::InvalidInput
        );
        assert_eq!(
            Error::NotFound(Uuid::new_v4()).code(),
            ResultCode::InvalidInput
        );
        assert_eq!(
            Error::Connection("refused".into()).code(),
            ResultCode::Connection
        );
        assert_eq!(Error::Unknown("?".into()).code(), ResultCode::Unknown);
    }

    #[test]
    fn test_code_values_are_stable() {
        assert_eq!(ResultCode::Success as i32, 0);
        assert_eq!(ResultCode::InvalidInput as i32, -1);
        assert_eq!(ResultCode::Connection as i32, -2);
        assert_eq!(ResultCode::Database as i32, -3);
        assert_eq!(ResultCode::Serialization as i32, -4);
        assert_eq!(ResultCode::Unknown as i32, -99);
    }

    #[test]
    fn test_serialization_code() {
        let err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        assert_eq!(Error::from(err).code(), ResultCode::Serialization);
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("body is not valid JSON".to_string());
        assert!(err.to_string().contains("Invalid input"));
        assert!(err.to_string().contains("body is not valid JSON"));
    }
}
