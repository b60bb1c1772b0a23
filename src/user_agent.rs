//! Shared User-Agent string for gallery HTTP traffic.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/gallery-reader";

/// Default User-Agent for listing, viewer and image requests.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("gallery-reader/{version} (+{PROJECT_UA_URL})")
}
