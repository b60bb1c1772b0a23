//! HTTP plumbing shared by every remote page source.
//!
//! # Features
//!
//! - One long-lived client per process with a shared cookie store
//! - Structured error types with the failing URL attached
//! - Exponential backoff with jitter for transient failures

mod client;
mod constants;
mod error;
mod retry;

pub use client::HttpClient;
pub use constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
pub use error::FetchError;
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error, with_retry,
};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, FetchError>` explicitly in function signatures.
