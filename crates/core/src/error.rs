//! Unified error types for offgrid.
//!
//! Per-resource and per-request failures are values of this enum so they can
//! be recorded and isolated; only store-level failures propagate upward.

use rmcp::model::{ErrorCode, ErrorData as McpError};
use tokio_rusqlite::rusqlite;

/// Unified error types for the offline cache.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., an empty resource list).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// A reference could not be resolved to a cacheable absolute URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Transport-level fetch failure.
    #[error("NETWORK_FAILURE: {0}")]
    NetworkFailure(String),

    /// Fetch did not resolve within the per-resource timeout.
    #[error("FETCH_TIMEOUT: {0}")]
    FetchTimeout(String),

    /// The server answered, but not with a success status.
    #[error("HTTP_STATUS: {0}")]
    HttpStatus(String),

    /// Fetch response too large.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// Persisting an entry failed (quota exceeded, database write error).
    #[error("STORE_WRITE_FAILED: {0}")]
    StoreWrite(String),

    /// The store or a generation could not be opened.
    #[error("STORE_OPEN_FAILED: {0}")]
    StoreOpen(String),

    /// No entry for the given key.
    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Lifecycle transition requested from the wrong state.
    #[error("INVALID_STATE: {0}")]
    InvalidState(String),
}

impl Error {
    /// True for failures that send a request down the fallback path.
    pub fn is_network_failure(&self) -> bool {
        matches!(self, Error::NetworkFailure(_) | Error::FetchTimeout(_))
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        let (code, message) = match &err {
            Error::InvalidInput(msg) => (-32602, msg.clone()),
            Error::InvalidUrl(msg) => (-32003, msg.clone()),
            Error::NetworkFailure(msg) => (-32008, msg.clone()),
            Error::FetchTimeout(msg) => (-32006, msg.clone()),
            Error::FetchTooLarge(msg) => (-32007, msg.clone()),
            Error::HttpStatus(msg) => (-32009, msg.clone()),
            Error::StoreWrite(msg) => (-32013, msg.clone()),
            Error::StoreOpen(msg) => (-32014, msg.clone()),
            Error::NotFound(msg) => (-32001, msg.clone()),
            Error::InvalidState(msg) => (-32015, msg.clone()),
            Error::Database(e) => (-32002, e.to_string()),
            Error::MigrationFailed(msg) => (-32002, msg.clone()),
        };

        McpError { code: ErrorCode(code), message: message.into(), data: None }
    }
}
