//! Constants for the HTTP layer (timeouts).

/// Default HTTP connect timeout (15 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default HTTP read timeout (60 seconds; single page images are small).
pub const READ_TIMEOUT_SECS: u64 = 60;
