//! Gallery references and cached gallery metadata.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

/// Sentinel stored in [`GalleryDetail`] when the gallery is not in any favorite slot.
const NO_FAVORITE_SLOT: i32 = -1;

/// Highest favorite slot index the gallery site exposes (slots 0..=9).
pub const MAX_FAVORITE_SLOT: u8 = 9;

/// Identifies a gallery to read.
///
/// Immutable once a loader has been built from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GalleryRef {
    /// A gallery hosted on the remote site.
    Remote {
        /// Numeric gallery id.
        gid: u64,
        /// Access token paired with the id in every gallery URL.
        token: String,
    },
    /// A local ZIP container, possibly encrypted.
    Archive {
        /// Path of the archive file.
        path: PathBuf,
    },
}

impl GalleryRef {
    /// Creates a remote gallery reference.
    pub fn remote(gid: u64, token: impl Into<String>) -> Self {
        Self::Remote {
            gid,
            token: token.into(),
        }
    }

    /// Creates a local archive reference.
    pub fn archive(path: impl Into<PathBuf>) -> Self {
        Self::Archive { path: path.into() }
    }

    /// Returns the remote gallery id, if any.
    #[must_use]
    pub fn gid(&self) -> Option<u64> {
        match self {
            Self::Remote { gid, .. } => Some(*gid),
            Self::Archive { .. } => None,
        }
    }

    /// Stable prefix used to scope disk cache keys to this gallery.
    #[must_use]
    pub fn cache_scope(&self) -> String {
        match self {
            Self::Remote { gid, .. } => format!("gid:{gid}"),
            Self::Archive { path } => format!("archive:{}", path.display()),
        }
    }
}

impl fmt::Display for GalleryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { gid, token } => write!(f, "{gid}/{token}"),
            Self::Archive { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Gallery metadata cached by gallery id.
///
/// Shared through `Arc` between the metadata cache and its consumers. The
/// favorite slot is the only mutable field; it is patched in place when a
/// favorite status event arrives.
#[derive(Debug)]
pub struct GalleryDetail {
    /// Numeric gallery id.
    pub gid: u64,
    /// Access token.
    pub token: String,
    /// Display title.
    pub title: String,
    /// Tags as `namespace:tag` strings, in page order.
    pub tags: Vec<String>,
    /// Total page count.
    pub pages: usize,
    favorite_slot: AtomicI32,
}

impl GalleryDetail {
    /// Creates gallery metadata with no favorite slot.
    pub fn new(
        gid: u64,
        token: impl Into<String>,
        title: impl Into<String>,
        tags: Vec<String>,
        pages: usize,
    ) -> Self {
        Self {
            gid,
            token: token.into(),
            title: title.into(),
            tags,
            pages,
            favorite_slot: AtomicI32::new(NO_FAVORITE_SLOT),
        }
    }

    /// Returns the favorite slot, or `None` when the gallery is not a favorite.
    #[must_use]
    pub fn favorite_slot(&self) -> Option<u8> {
        u8::try_from(self.favorite_slot.load(Ordering::Acquire)).ok()
    }

    /// Sets or clears the favorite slot.
    pub fn set_favorite_slot(&self, slot: Option<u8>) {
        let raw = slot.map_or(NO_FAVORITE_SLOT, i32::from);
        self.favorite_slot.store(raw, Ordering::Release);
    }
}

/// A favorite status change broadcast by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FavoriteStatusEvent {
    /// Gallery whose status changed.
    pub gid: u64,
    /// New slot, `None` when removed from favorites.
    pub slot: Option<u8>,
}
