//! Error types for page sources.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::net::FetchError;

/// Errors that can occur while resolving a gallery or fetching one of its pages.
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP request failed after retries.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A listing or viewer page did not have the expected shape.
    #[error("unexpected page layout at {url}: {reason}")]
    Parse {
        /// The page that failed to parse.
        url: String,
        /// What was missing or malformed.
        reason: String,
    },

    /// The archive holds encrypted entries and no passphrase has been accepted.
    #[error("archive {path} is encrypted and needs a passphrase")]
    NeedsPassphrase {
        /// Archive path.
        path: PathBuf,
    },

    /// The ZIP container could not be read.
    #[error("archive error in {path}: {source}")]
    Archive {
        /// Archive path.
        path: PathBuf,
        /// The underlying ZIP error.
        #[source]
        source: zip::result::ZipError,
    },

    /// File system error while reading an archive.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Page index past the end of the resolved gallery.
    #[error("page {index} is outside the gallery ({size} pages)")]
    PageOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of pages.
        size: usize,
    },

    /// The operation only exists for the other source variant.
    #[error("{operation} is not supported by {kind} sources")]
    Unsupported {
        /// Operation name.
        operation: &'static str,
        /// Source variant name.
        kind: &'static str,
    },

    /// A blocking extraction task panicked or was cancelled.
    #[error("archive task failed: {reason}")]
    Task {
        /// Join failure description.
        reason: String,
    },
}

impl SourceError {
    /// Creates a parse error.
    pub fn parse(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a passphrase-required error.
    pub fn needs_passphrase(path: impl AsRef<Path>) -> Self {
        Self::NeedsPassphrase {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates an archive error.
    pub fn archive(path: impl AsRef<Path>, source: zip::result::ZipError) -> Self {
        Self::Archive {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Creates an unsupported-operation error.
    #[must_use]
    pub fn unsupported(operation: &'static str, kind: &'static str) -> Self {
        Self::Unsupported { operation, kind }
    }

    /// Wraps a failed `spawn_blocking` join.
    #[must_use]
    pub fn task(error: &tokio::task::JoinError) -> Self {
        Self::Task {
            reason: error.to_string(),
        }
    }

    /// Returns true when the error means "ask for a passphrase".
    #[must_use]
    pub fn is_needs_passphrase(&self) -> bool {
        matches!(self, Self::NeedsPassphrase { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let error = SourceError::parse("https://example.org/g/1/abc/", "missing title");
        let msg = error.to_string();
        assert!(msg.contains("https://example.org/g/1/abc/"));
        assert!(msg.contains("missing title"));
    }

    #[test]
    fn test_fetch_error_is_transparent() {
        let error = SourceError::from(FetchError::http_status("https://example.org/x.jpg", 404));
        assert_eq!(error.to_string(), "HTTP 404 fetching https://example.org/x.jpg");
    }

    #[test]
    fn test_needs_passphrase_predicate() {
        assert!(SourceError::needs_passphrase("/tmp/a.zip").is_needs_passphrase());
        assert!(!SourceError::unsupported("unlock", "remote").is_needs_passphrase());
    }

    #[test]
    fn test_unsupported_display() {
        let error = SourceError::unsupported("unlock", "remote");
        assert_eq!(error.to_string(), "unlock is not supported by remote sources");
    }
}
