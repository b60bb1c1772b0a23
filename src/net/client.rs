//! The one HTTP client a reader process shares between galleries.
//!
//! The application root builds an [`HttpClient`] and clones it into every
//! remote page source. It owns the session cookie store; loaders only issue
//! GETs through it and never reconfigure it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::cookie::Jar;
use reqwest::{Client, Response};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::FetchError;
use crate::user_agent;

/// Cheaply cloneable GET client; clones share connections and cookies.
///
/// ```no_run
/// use std::sync::Arc;
/// use gallery_core::net::HttpClient;
/// use reqwest::cookie::Jar;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::configured(Some(Arc::new(Jar::default())), 15, 60)?;
/// let listing = client.get_text("https://example.org/g/1/abc/").await?;
/// assert!(!listing.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    cookie_jar: Option<Arc<Jar>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Client with default timeouts and no cookie store.
    ///
    /// # Panics
    ///
    /// Only if the TLS backend cannot initialise, which the fixed settings
    /// used here never trigger.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::configured(None, CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
            .expect("default HTTP client settings are valid")
    }

    /// Client with an optional cookie store and explicit timeouts in seconds.
    ///
    /// # Errors
    ///
    /// Returns the builder error when reqwest rejects the settings.
    #[instrument(level = "debug", skip(cookie_jar), fields(cookies = cookie_jar.is_some()))]
    pub fn configured(
        cookie_jar: Option<Arc<Jar>>,
        connect_secs: u64,
        read_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(connect_secs))
            .timeout(Duration::from_secs(read_secs))
            .gzip(true)
            .user_agent(user_agent::default_user_agent());
        if let Some(jar) = &cookie_jar {
            builder = builder.cookie_provider(Arc::clone(jar));
        }
        Ok(Self {
            client: builder.build()?,
            cookie_jar,
        })
    }

    #[must_use]
    pub fn cookie_jar(&self) -> Option<&Arc<Jar>> {
        self.cookie_jar.as_ref()
    }

    /// GETs a listing or viewer page as text.
    ///
    /// # Errors
    ///
    /// [`FetchError`] for unusable URLs, transport failures and non-2xx answers.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|e| FetchError::network(url, e))
    }

    /// GETs an image body.
    ///
    /// # Errors
    ///
    /// [`FetchError`] for unusable URLs, transport failures and non-2xx answers.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn get_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        let body = self
            .get(url)
            .await?
            .bytes()
            .await
            .map_err(|e| FetchError::network(url, e))?;
        debug!(len = body.len(), "image body received");
        Ok(body)
    }

    async fn get(&self, url: &str) -> Result<Response, FetchError> {
        let target = Url::parse(url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| FetchError::invalid_url(url))?;

        let response = self
            .client
            .get(target)
            .send()
            .await
            .map_err(|e| FetchError::network(url, e))?;
        match response.status() {
            status if status.is_success() => Ok(response),
            status => Err(FetchError::http_status(url, status.as_u16())),
        }
    }
}
