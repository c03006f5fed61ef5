//! Error types for the sync server.

use std::path::PathBuf;

/// Main error type for server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Fetch error.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Signal bus error.
    #[error("signal bus error: {0}")]
    SignalBus(#[from] SignalBusError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored body could not be encoded or decoded.
    #[error("invalid resource body: {0}")]
    Body(#[from] serde_json::Error),

    /// Resource not found.
    #[error("resource not found: {kind}/{id}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource ID.
        id: String,
    },

    /// A stored identifier failed to parse.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Errors returned by a fetch.
///
/// Loader errors pass through verbatim. Cache errors never reach callers:
/// the fetcher falls back to the loader instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// The loader failed.
    #[error("{0}")]
    Loader(String),

    /// The shared cache failed or timed out.
    #[error("fetch cache error: {0}")]
    Cache(String),

    /// The fetcher was already closed.
    #[error("fetcher is closed")]
    Closed,
}

impl From<StorageError> for FetchError {
    fn from(err: StorageError) -> Self {
        Self::Loader(err.to_string())
    }
}

/// Clustered signal bus errors.
///
/// These are logged and retried by the listener; they never reach
/// subscribers.
#[derive(Debug, thiserror::Error)]
pub enum SignalBusError {
    /// Database error on the listen or publish connection.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The listen connection closed.
    #[error("listen connection closed")]
    ConnectionClosed,
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for fetches.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_error_is_verbatim() {
        let err = FetchError::Loader("connection refused".into());
        assert_eq!(err.to_string(), "connection refused");
    }

    #[test]
    fn storage_error_converts_to_loader_error() {
        let err: FetchError = StorageError::NotFound {
            kind: "device".into(),
            id: "abc".into(),
        }
        .into();
        assert_eq!(err.to_string(), "resource not found: device/abc");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServerError>();
        assert_send_sync::<FetchError>();
    }
}
