//! Error types for the page loader.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::decode::DecodeError;
use crate::source::SourceError;

/// Failure of a single page. Retriable; never affects sibling pages.
#[derive(Debug, Error)]
pub enum PageError {
    /// The source could not deliver the page.
    #[error("page {index}: {source}")]
    Source {
        /// Page index.
        index: usize,
        /// The underlying source error.
        #[source]
        source: SourceError,
    },

    /// The bytes arrived but a decode stage rejected them.
    #[error("page {index}: {source}")]
    Decode {
        /// Page index.
        index: usize,
        /// The underlying decode error.
        #[source]
        source: DecodeError,
    },

    /// The decode task panicked.
    #[error("page {index}: decode task failed: {reason}")]
    Task {
        /// Page index.
        index: usize,
        /// Join failure description.
        reason: String,
    },
}

impl PageError {
    /// Creates a source error for page `index`.
    #[must_use]
    pub fn fetch(index: usize, source: SourceError) -> Self {
        Self::Source { index, source }
    }

    /// Creates a decode error for page `index`.
    #[must_use]
    pub fn decode(index: usize, source: DecodeError) -> Self {
        Self::Decode { index, source }
    }

    /// Page index the error belongs to.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Source { index, .. } | Self::Decode { index, .. } | Self::Task { index, .. } => {
                *index
            }
        }
    }
}

/// Errors reported by [`PageLoader`](super::PageLoader) operations.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The gallery could not be resolved. Fatal for the loader.
    #[error("failed to resolve {gallery}: {source}")]
    Resolve {
        /// Gallery being resolved.
        gallery: String,
        /// The underlying source error.
        #[source]
        source: SourceError,
    },

    /// Nobody answered the passphrase request. Fatal for the loader.
    #[error("passphrase request for {path} was abandoned")]
    PassphraseAbandoned {
        /// Archive path.
        path: PathBuf,
    },

    /// Page index outside `[0, size)`.
    #[error("page {index} is out of bounds (gallery has {size} pages)")]
    OutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of pages.
        size: usize,
    },

    /// The loader has not reached Ready.
    #[error("gallery is not ready")]
    NotReady,

    /// The page load was cut short by `stop()` or `restart()`.
    #[error("load of page {index} was interrupted")]
    Interrupted {
        /// Page index.
        index: usize,
    },

    /// The page failed to load.
    #[error(transparent)]
    Page(Arc<PageError>),
}

impl LoaderError {
    /// Creates a resolve error.
    pub fn resolve(gallery: impl ToString, source: SourceError) -> Self {
        Self::Resolve {
            gallery: gallery.to_string(),
            source,
        }
    }

    /// Creates a passphrase-abandoned error.
    pub fn passphrase_abandoned(path: impl Into<PathBuf>) -> Self {
        Self::PassphraseAbandoned { path: path.into() }
    }
}
