//! Client errors.

use sync_types::{ApiError, TypesError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server rejected the request.
    #[error("request rejected ({status}): {}", .body.error)]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error body returned by the server.
        body: ApiError,
    },

    /// A line of the stream or an event value did not decode.
    #[error("decode error: {0}")]
    Decode(#[from] TypesError),

    /// A single line exceeded the decoder limit.
    #[error("line too long: {0} bytes")]
    LineTooLong(usize),

    /// The base URL cannot be used.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}
