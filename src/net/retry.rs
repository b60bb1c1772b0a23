//! Backoff and retry for listing, viewer and image fetches.
//!
//! Every failed fetch is sorted into a [`FailureType`]. Server errors and
//! timeouts are worth another try, a missing page is not, a rejected session
//! needs new cookies, and quota exhaustion (429 or the site's 509) is retried
//! with backoff like a transient failure.
//!
//! [`RetryPolicy`] turns that class plus the number of the failed attempt into
//! a [`RetryDecision`]. [`with_retry`] drives the loop for one fetch.
//!
//! ```
//! use gallery_core::net::{FetchError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::with_max_attempts(4);
//! let failed = FetchError::http_status("https://example.org/img/1.jpg", 503);
//!
//! if let RetryDecision::Retry { delay, attempt } = policy.should_retry(classify_error(&failed), 1) {
//!     assert_eq!(attempt, 2);
//!     assert!(delay >= std::time::Duration::from_millis(500));
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::FetchError;

/// Attempts per fetch when nothing is configured, the first one included.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const FIRST_BACKOFF: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const BACKOFF_GROWTH: f32 = 2.0;

/// Upper bound on random jitter, further limited by the first backoff.
const JITTER_CAP: Duration = Duration::from_millis(250);

/// How a failed fetch should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Timeouts, dropped connections, 408 and 5xx.
    Transient,

    /// Missing pages, malformed URLs, TLS failures.
    Permanent,

    /// 401/403: the cookie store lacks a valid session.
    NeedsAuth,

    /// HTTP 429, or 509 which the gallery site uses for exhausted image quota.
    RateLimited,
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then make attempt number `attempt`.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
        /// Number of the upcoming attempt; the first retry is 2.
        attempt: u32,
    },

    /// Give up and surface the last error.
    DoNotRetry {
        /// Why the fetch is abandoned, for logs.
        reason: String,
    },
}

/// Exponential backoff settings for a single fetch.
///
/// The wait after failed attempt `n` is
/// `min(first * growth^(n-1), cap)` plus up to 250ms of jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    first_backoff: Duration,
    backoff_cap: Duration,
    growth: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, FIRST_BACKOFF, BACKOFF_CAP, BACKOFF_GROWTH)
    }
}

impl RetryPolicy {
    /// Builds a policy from explicit backoff settings.
    ///
    /// `max_attempts` counts the first attempt; zero is raised to one.
    #[must_use]
    pub fn new(max_attempts: u32, first_backoff: Duration, backoff_cap: Duration, growth: f32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            first_backoff,
            backoff_cap,
            growth,
        }
    }

    /// Default backoff with a different attempt limit.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self::new(max_attempts, FIRST_BACKOFF, BACKOFF_CAP, BACKOFF_GROWTH)
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what follows failed attempt number `attempt` (1-based).
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        let refusal = match failure_type {
            FailureType::Permanent => Some("not recoverable by refetching".to_string()),
            FailureType::NeedsAuth => Some("session cookies missing or rejected".to_string()),
            FailureType::Transient | FailureType::RateLimited if attempt >= self.max_attempts => {
                debug!(attempt, "attempt limit reached");
                Some(format!("all {} attempts used", self.max_attempts))
            }
            FailureType::Transient | FailureType::RateLimited => None,
        };
        if let Some(reason) = refusal {
            return RetryDecision::DoNotRetry { reason };
        }

        let delay = self.backoff(attempt) + self.jitter();
        debug!(attempt, delay_ms = delay.as_millis(), "backing off");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn backoff(&self, attempt: u32) -> Duration {
        let steps = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.first_backoff.as_millis() as f64 * f64::from(self.growth).powi(steps);
        let capped = scaled.min(self.backoff_cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn jitter(&self) -> Duration {
        let bound = JITTER_CAP.min(self.first_backoff).as_millis() as u64;
        if bound == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
        }
    }
}

/// Runs `operation` until it succeeds or the policy stops retrying.
///
/// Each attempt is a fresh future; dropping the returned future (task abort)
/// cancels both in-flight requests and pending backoff sleeps.
///
/// # Errors
///
/// Returns the last [`FetchError`] once the policy gives up.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        match policy.should_retry(classify_error(&error), attempt) {
            RetryDecision::Retry { delay, attempt: next } => {
                warn!(url = error.url(), error = %error, attempt, "fetch failed; retrying");
                tokio::time::sleep(delay).await;
                attempt = next;
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(url = error.url(), %reason, "giving up");
                return Err(error);
            }
        }
    }
}

/// Sorts a fetch error into a [`FailureType`].
///
/// Status codes: 401/403 need auth, 429/509 are rate limits, 408 and other
/// 5xx are transient, remaining codes are permanent. Timeouts and plain
/// network errors are transient; TLS failures and bad URLs are permanent.
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::HttpStatus { status, .. } => match *status {
            401 | 403 => FailureType::NeedsAuth,
            429 | 509 => FailureType::RateLimited,
            408 | 500..=599 => FailureType::Transient,
            _ => FailureType::Permanent,
        },
        FetchError::Timeout { .. } => FailureType::Transient,
        FetchError::Network { source, .. } if looks_like_tls(source) => FailureType::Permanent,
        FetchError::Network { .. } => FailureType::Transient,
        FetchError::InvalidUrl { .. } => FailureType::Permanent,
    }
}

fn looks_like_tls(error: &reqwest::Error) -> bool {
    let text = error.to_string().to_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| text.contains(needle))
}
