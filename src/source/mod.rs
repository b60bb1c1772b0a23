//! Page sources: where page bytes come from.
//!
//! A [`PageSource`] is either [`RemoteSource`] (gallery site over HTTP) or
//! [`ArchiveSource`] (local ZIP container). Both resolve the page count first,
//! then fetch pages independently by index. Fetches for different indices
//! never affect each other.

mod archive;
mod error;
mod remote;

pub use archive::{ArchiveSource, is_image_entry, natural_cmp};
pub use error::SourceError;
pub use remote::{RemoteSource, filename_from_url};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::gallery::GalleryDetail;

/// Which image variant to fetch from a remote gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    /// Resized image served by the viewer page.
    #[default]
    Resized,
    /// Original upload, when the viewer page links one.
    Original,
}

impl Quality {
    /// Short name used in cache keys and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resized => "resized",
            Self::Original => "original",
        }
    }
}

/// Result of resolving a gallery.
#[derive(Debug, Clone)]
pub struct ResolvedGallery {
    /// Number of pages.
    pub pages: usize,
    /// Filename per page, `None` until the page is fetched.
    pub filenames: Vec<Option<String>>,
    /// Metadata written to the metadata cache, for remote galleries.
    pub detail: Option<Arc<GalleryDetail>>,
}

/// Bytes of one fetched page.
#[derive(Debug, Clone)]
pub struct PageData {
    /// Encoded image parts. More than one means the page arrived split.
    pub parts: Vec<Bytes>,
    /// Filename reported by the source.
    pub filename: Option<String>,
}

impl PageData {
    /// A page delivered as one encoded image.
    #[must_use]
    pub fn single(bytes: Bytes, filename: Option<String>) -> Self {
        Self {
            parts: vec![bytes],
            filename,
        }
    }

    /// Total encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.parts.iter().map(|part| part.len() as u64).sum()
    }

    /// Returns true when no bytes were delivered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Finds archives of galleries that were already downloaded.
pub trait ArchiveLookup: Send + Sync + fmt::Debug {
    /// Returns the archive path for `gid`, if one exists.
    fn find(&self, gid: u64) -> Option<PathBuf>;
}

/// Lookup that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoArchives;

impl ArchiveLookup for NoArchives {
    fn find(&self, _gid: u64) -> Option<PathBuf> {
        None
    }
}

/// Looks for `{gid}.zip` or `{gid}-*.zip` in a download directory.
#[derive(Debug, Clone)]
pub struct DirectoryArchiveLookup {
    dir: PathBuf,
}

impl DirectoryArchiveLookup {
    /// Creates a lookup over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being searched.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArchiveLookup for DirectoryArchiveLookup {
    fn find(&self, gid: u64) -> Option<PathBuf> {
        let exact = format!("{gid}");
        let prefix = format!("{gid}-");
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) => {
                debug!(dir = %self.dir.display(), error = %error, "download directory unreadable");
                return None;
            }
        };
        let mut matches: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
                    && path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .is_some_and(|stem| stem == exact || stem.starts_with(&prefix))
            })
            .collect();
        matches.sort();
        matches.into_iter().next()
    }
}

/// Where a loader gets its pages from.
#[derive(Debug)]
pub enum PageSource {
    /// Gallery site over HTTP.
    Remote(RemoteSource),
    /// Local ZIP container.
    Archive(ArchiveSource),
}

impl PageSource {
    /// Variant name for logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Remote(_) => "remote",
            Self::Archive(_) => "archive",
        }
    }

    /// Resolves the page count.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NeedsPassphrase`] for a locked archive, or the
    /// fetch/parse/archive failure that prevented resolution.
    pub async fn resolve(&self) -> Result<ResolvedGallery, SourceError> {
        match self {
            Self::Remote(source) => source.resolve().await,
            Self::Archive(source) => source.resolve().await,
        }
    }

    /// Fetches the bytes of page `index`.
    ///
    /// # Errors
    ///
    /// Returns the [`SourceError`] for this page only.
    pub async fn fetch_page(&self, index: usize, quality: Quality) -> Result<PageData, SourceError> {
        match self {
            Self::Remote(source) => source.fetch_page(index, quality).await,
            Self::Archive(source) => source.fetch_page(index).await,
        }
    }

    /// Re-fetches page `index` at `quality` after a failure or for an upgrade.
    ///
    /// Remote sources bypass the remembered image URL and ask the viewer for
    /// another mirror. Archives simply read the entry again.
    ///
    /// # Errors
    ///
    /// Returns the [`SourceError`] for this page only.
    pub async fn retry_page(&self, index: usize, quality: Quality) -> Result<PageData, SourceError> {
        match self {
            Self::Remote(source) => source.retry_page(index, quality).await,
            Self::Archive(source) => source.fetch_page(index).await,
        }
    }

    /// Validates `passphrase` against an encrypted archive.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unsupported`] for remote sources, or the archive
    /// failure that prevented validation.
    pub async fn unlock(&self, passphrase: &str) -> Result<bool, SourceError> {
        match self {
            Self::Remote(_) => Err(SourceError::unsupported("unlock", self.kind())),
            Self::Archive(source) => source.unlock(passphrase).await,
        }
    }
}
