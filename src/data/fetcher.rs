//! Gas price feed client
//!
//! Retrieves the raw feed over HTTP. The upstream feed prepends one stray
//! character to the JSON body; it is stripped here so the rest of the
//! pipeline only ever sees JSON text.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use super::RawPayload;

/// Endpoint of the upstream gas price feed
pub const DEFAULT_FEED_URL: &str = "http://www.tomorrowsgaspricetoday.com/mobile/json_mobile_data.php";

/// Errors that can occur when fetching the feed
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection, timeout or transfer failure
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered, but not with a usable feed body
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Anything that can produce a raw feed payload
///
/// The refresh cycle is written against this trait so that it can be driven
/// by the HTTP client in production and by canned payloads in tests.
pub trait FeedSource: Send + Sync {
    /// Retrieves one payload
    fn fetch(&self) -> impl Future<Output = Result<RawPayload, FetchError>> + Send;
}

impl<S: FeedSource + ?Sized> FeedSource for Arc<S> {
    fn fetch(&self) -> impl Future<Output = Result<RawPayload, FetchError>> + Send {
        (**self).fetch()
    }
}

/// HTTP client for the gas price feed
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: Client,
    url: String,
}

impl Default for FeedFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_URL)
    }
}

impl FeedFetcher {
    /// Creates a fetcher for the given feed URL with no request timeout
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    /// Replaces the HTTP client with one that enforces a request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, FetchError> {
        self.client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    /// URL this fetcher reads from
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches the feed body and strips the upstream sentinel character
    ///
    /// # Returns
    /// * `Ok(RawPayload)` - JSON text, not yet parsed
    /// * `Err(FetchError::Network)` - connection or transfer failure
    /// * `Err(FetchError::Protocol)` - non-success status or empty body
    pub async fn fetch_raw(&self) -> Result<RawPayload, FetchError> {
        debug!(url = %self.url, "Fetching gas price feed");

        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Protocol(format!(
                "Feed returned HTTP {}",
                status.as_u16()
            )));
        }

        let text = response.text().await?;
        let body = strip_sentinel(&text)?;
        debug!(bytes = body.len(), "Fetched gas price feed");

        Ok(RawPayload::new(body))
    }
}

impl FeedSource for FeedFetcher {
    async fn fetch(&self) -> Result<RawPayload, FetchError> {
        self.fetch_raw().await
    }
}

/// Removes the single leading character the upstream prepends to the JSON
///
/// An empty body has nothing to strip and is reported as a protocol error.
pub fn strip_sentinel(body: &str) -> Result<&str, FetchError> {
    let mut chars = body.chars();
    match chars.next() {
        Some(_) => Ok(chars.as_str()),
        None => Err(FetchError::Protocol("Feed body is empty".to_string())),
    }
}
