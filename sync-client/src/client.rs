//! WatchClient - opens watch streams against the API server.
//!
//! # Example
//!
//! ```ignore
//! use sync_client::WatchClient;
//! use sync_types::Watch;
//!
//! let client = WatchClient::new("http://localhost:8080")?;
//! let mut stream = client.watch(&org, &[Watch::new("device")]).await?;
//! while let Some(event) = stream.next_event().await? {
//!     println!("{:?}", event);
//! }
//! ```

use crate::decoder::LineDecoder;
use crate::error::ClientError;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::ACCEPT;
use sync_types::{ApiError, Watch, WatchEvent, WATCH_CONTENT_TYPE};
use uuid::Uuid;

/// HTTP client for the watch endpoint.
#[derive(Debug, Clone)]
pub struct WatchClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl WatchClient {
    /// Create a client for the server at `base_url` (`http://` or `https://`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidUrl(base_url));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: None,
        })
    }

    /// Use a preconfigured HTTP client (proxies, TLS roots, timeouts).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Send `token` as a bearer token on every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// URL of the multi-kind watch endpoint for `organization`.
    pub fn events_url(&self, organization: &Uuid) -> String {
        format!("{}/api/organizations/{organization}/events", self.base_url)
    }

    /// Open a watch stream for `watches`.
    ///
    /// Fails with [`ClientError::Rejected`] when the server refuses the
    /// request (unknown kind, rate limit, ...).
    pub async fn watch(
        &self,
        organization: &Uuid,
        watches: &[Watch],
    ) -> Result<WatchStream, ClientError> {
        let mut request = self
            .http
            .post(self.events_url(organization))
            .header(ACCEPT, WATCH_CONTENT_TYPE)
            .json(watches);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body =
                serde_json::from_str::<ApiError>(&text).unwrap_or_else(|_| ApiError::new(text));
            tracing::debug!(status = status.as_u16(), error = %body.error, "watch rejected");
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(%organization, kinds = watches.len(), "watch stream opened");
        Ok(WatchStream::from_chunks(response.bytes_stream().map(
            |chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ClientError::from),
        )))
    }
}

/// An open watch stream.
///
/// Yields events until the server sends `error` or `close`, or the body ends.
pub struct WatchStream {
    chunks: BoxStream<'static, Result<Vec<u8>, ClientError>>,
    decoder: LineDecoder,
    finished: bool,
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream")
            .field("buffered", &self.decoder.buffered())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl WatchStream {
    /// Wrap a stream of body chunks.
    pub fn from_chunks<S>(chunks: S) -> Self
    where
        S: Stream<Item = Result<Vec<u8>, ClientError>> + Send + 'static,
    {
        Self {
            chunks: chunks.boxed(),
            decoder: LineDecoder::new(),
            finished: false,
        }
    }

    /// Whether the stream has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read the next event.
    ///
    /// Returns `Ok(None)` once the stream has ended. A line that fails to
    /// decode is returned as an error and the stream stays usable.
    pub async fn next_event(&mut self) -> Result<Option<WatchEvent>, ClientError> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if let Some(event) = self.decoder.next_event() {
                let event = event?;
                if event.event_type.is_terminal() {
                    self.finished = true;
                }
                return Ok(Some(event));
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(e);
                }
                None => {
                    self.finished = true;
                    return self.decoder.finish().transpose();
                }
            }
        }
    }
}
