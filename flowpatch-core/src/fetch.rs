//! Synchronous outbound fetches used by URL substitution and by response-side
//! transform units.

use crate::error::FetchError;
use std::time::Duration;
use tracing::debug;

/// Result of a completed fetch, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Blocking HTTP GET. Called from the engine's blocking callbacks, never from an
/// async task.
pub trait ContentFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError>;
}

/// [`ContentFetcher`] backed by `reqwest`'s blocking client.
///
/// Build it outside of any Tokio runtime; the blocking client owns its own.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ContentFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .map_err(|e| FetchError::Body {
                url: url.to_string(),
                message: e.to_string(),
            })?
            .to_vec();

        Ok(FetchedContent {
            status,
            content_type,
            body,
        })
    }
}
