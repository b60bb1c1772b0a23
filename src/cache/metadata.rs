//! In-memory gallery metadata cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::gallery::{FavoriteStatusEvent, GalleryDetail};

/// Default number of gallery details kept in memory.
pub const DEFAULT_METADATA_CAPACITY: usize = 25;

/// Bounded LRU map from gallery id to shared [`GalleryDetail`].
///
/// `get` and `put` refresh recency. Favorite status patches use `peek` and
/// leave recency untouched.
#[derive(Debug)]
pub struct MetadataCache {
    entries: Mutex<LruCache<u64, Arc<GalleryDetail>>>,
}

impl MetadataCache {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached detail and marks it most recently used.
    #[must_use]
    pub fn get(&self, gid: u64) -> Option<Arc<GalleryDetail>> {
        self.lock().get(&gid).cloned()
    }

    /// Inserts or replaces a detail, evicting the least recently used entry at capacity.
    pub fn put(&self, gid: u64, detail: Arc<GalleryDetail>) {
        if let Some((evicted, _)) = self.lock().push(gid, detail)
            && evicted != gid
        {
            debug!(evicted, "metadata cache evicted gallery");
        }
    }

    /// Removes a detail.
    pub fn remove(&self, gid: u64) -> Option<Arc<GalleryDetail>> {
        self.lock().pop(&gid)
    }

    /// Returns whether a gallery is cached without touching recency.
    #[must_use]
    pub fn contains(&self, gid: u64) -> bool {
        self.lock().contains(&gid)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    /// Patches the favorite slot of a cached gallery in place.
    ///
    /// Returns `false` when the gallery is not cached; nothing is fetched.
    pub fn apply_favorite_status(&self, event: FavoriteStatusEvent) -> bool {
        match self.lock().peek(&event.gid) {
            Some(detail) => {
                detail.set_favorite_slot(event.slot);
                true
            }
            None => false,
        }
    }

    /// Spawns a task applying every event from `events` until the channel closes.
    pub fn subscribe(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<FavoriteStatusEvent>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let patched = cache.apply_favorite_status(event);
                        debug!(gid = event.gid, slot = ?event.slot, patched, "favorite status event");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "favorite status subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<u64, Arc<GalleryDetail>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_CAPACITY)
    }
}
