//! Fetch failures, each tagged with the URL that produced it.

use thiserror::Error;

/// Why a listing, viewer or image GET did not yield a body.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure below HTTP: DNS, refused connection, TLS.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Connect or read timeout elapsed.
    #[error("timeout fetching {url}")]
    Timeout {
        url: String,
    },

    /// The server answered with a non-2xx status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
    },

    /// Not an absolute http(s) URL; nothing was sent.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        url: String,
    },
}

impl FetchError {
    /// Wraps a reqwest error; its timeouts become [`FetchError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// URL of the failed request.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Network { url, .. }
            | Self::Timeout { url }
            | Self::HttpStatus { url, .. }
            | Self::InvalidUrl { url } => url,
        }
    }
}

// No From<reqwest::Error>; reqwest errors do not always carry the URL.
