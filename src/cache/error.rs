//! Error types for the cache layer.
//!
//! Cache failures are never fatal for a page load: callers log them and carry
//! on uncached.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur while reading or writing the disk image cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// File system error in the cache directory.
    #[error("IO error in image cache at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A single entry is larger than the whole cache budget.
    #[error("entry of {len} bytes exceeds image cache budget of {budget} bytes")]
    TooLarge {
        /// Entry size in bytes.
        len: u64,
        /// Configured budget in bytes.
        budget: u64,
    },
}

impl CacheError {
    /// Creates an IO error.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_large_display() {
        let error = CacheError::TooLarge { len: 11, budget: 10 };
        let msg = error.to_string();
        assert!(msg.contains("11"), "Expected size in: {msg}");
        assert!(msg.contains("10"), "Expected budget in: {msg}");
    }

    #[test]
    fn test_io_display_contains_path() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let msg = CacheError::io("/tmp/cache", source).to_string();
        assert!(msg.contains("/tmp/cache"), "Expected path in: {msg}");
    }
}
