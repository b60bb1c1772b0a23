//! Two-tier page cache: gallery metadata in memory, page bytes on disk.
//!
//! Both tiers are explicitly constructed services. The application root opens
//! one [`PageCacheStore`] and hands clones of it to every loader; nothing here
//! is a process global.
//!
//! # Example
//!
//! ```no_run
//! use gallery_core::cache::{CacheBudget, PageCacheStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let budget = CacheBudget::from_disk_mib(640);
//! let store = PageCacheStore::open("/tmp/gallery-cache", budget).await?;
//! println!("{} bytes cached", store.images().size_bytes().await);
//! # Ok(())
//! # }
//! ```

mod disk;
mod error;
mod metadata;

pub use disk::DiskImageCache;
pub use error::CacheError;
pub use metadata::{DEFAULT_METADATA_CAPACITY, MetadataCache};

use std::path::Path;
use std::sync::Arc;

/// Smallest accepted disk cache size in MiB.
pub const MIN_DISK_CACHE_MIB: u64 = 320;

/// Largest accepted disk cache size in MiB.
pub const MAX_DISK_CACHE_MIB: u64 = 5120;

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Clamps a requested disk cache size into the accepted range and returns bytes.
///
/// ```
/// use gallery_core::cache::clamp_disk_cache_bytes;
///
/// assert_eq!(clamp_disk_cache_bytes(100), 320 * 1024 * 1024);
/// ```
#[must_use]
pub fn clamp_disk_cache_bytes(requested_mib: u64) -> u64 {
    requested_mib.clamp(MIN_DISK_CACHE_MIB, MAX_DISK_CACHE_MIB) * BYTES_PER_MIB
}

/// Size limits for both cache tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudget {
    /// Maximum number of gallery details held in memory.
    pub metadata_entries: usize,
    /// Maximum bytes stored on disk.
    pub disk_bytes: u64,
}

impl CacheBudget {
    /// Budget with the default metadata capacity and a clamped disk size.
    #[must_use]
    pub fn from_disk_mib(disk_mib: u64) -> Self {
        Self {
            metadata_entries: DEFAULT_METADATA_CAPACITY,
            disk_bytes: clamp_disk_cache_bytes(disk_mib),
        }
    }
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self::from_disk_mib(MIN_DISK_CACHE_MIB)
    }
}

/// Handle to both cache tiers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PageCacheStore {
    metadata: Arc<MetadataCache>,
    images: Arc<DiskImageCache>,
}

impl PageCacheStore {
    /// Opens the disk tier under `dir` and creates an empty metadata tier.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the cache directory cannot be prepared.
    pub async fn open(dir: impl AsRef<Path>, budget: CacheBudget) -> Result<Self, CacheError> {
        let images = DiskImageCache::open(dir, budget.disk_bytes).await?;
        Ok(Self::from_parts(
            Arc::new(MetadataCache::new(budget.metadata_entries)),
            Arc::new(images),
        ))
    }

    /// Builds a store from already constructed tiers.
    #[must_use]
    pub fn from_parts(metadata: Arc<MetadataCache>, images: Arc<DiskImageCache>) -> Self {
        Self { metadata, images }
    }

    /// Gallery metadata tier.
    #[must_use]
    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    /// Page bytes tier.
    #[must_use]
    pub fn images(&self) -> &Arc<DiskImageCache> {
        &self.images
    }
}
