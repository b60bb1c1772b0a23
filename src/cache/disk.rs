//! Bounded on-disk byte cache for page images.
//!
//! Keys are arbitrary strings hashed with SHA-256 into file names under the
//! cache directory. An in-memory LRU index tracks entry sizes so the total
//! never exceeds the byte budget after a `put` returns.
//!
//! Every change to files and index runs as one job on the blocking pool. A
//! caller that is cancelled mid-`put` only stops waiting; the job still
//! finishes, so files on disk and the index never drift apart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::error::CacheError;

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
struct DiskIndex {
    entries: LruCache<String, u64>,
    total_bytes: u64,
}

impl DiskIndex {
    fn forget(&mut self, name: &str) -> Option<u64> {
        let len = self.entries.pop(name)?;
        self.total_bytes = self.total_bytes.saturating_sub(len);
        Some(len)
    }

    fn evict_over_budget(&mut self, dir: &Path, max_bytes: u64) {
        while self.total_bytes > max_bytes {
            let Some((name, len)) = self.entries.pop_lru() else {
                break;
            };
            self.total_bytes = self.total_bytes.saturating_sub(len);
            debug!(entry = %name, len, "evicting cached image");
            remove_quietly(&dir.join(&name));
        }
    }
}

/// On-disk LRU byte store.
#[derive(Debug)]
pub struct DiskImageCache {
    dir: PathBuf,
    max_bytes: u64,
    index: Arc<Mutex<DiskIndex>>,
}

impl DiskImageCache {
    /// Opens (or creates) a cache under `dir` with a `max_bytes` budget.
    ///
    /// Existing entries are indexed oldest-modified first; stale temp files are
    /// removed and the budget is enforced immediately.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be created or listed.
    #[instrument(skip(dir), fields(dir = %dir.as_ref().display()))]
    pub async fn open(dir: impl AsRef<Path>, max_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;

        let mut found: Vec<(String, u64, SystemTime)> = Vec::new();
        let mut listing = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;
        while let Some(entry) = listing
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&dir, e))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((name, meta.len(), modified));
        }
        found.sort_by_key(|(_, _, modified)| *modified);

        let mut index = DiskIndex {
            entries: LruCache::unbounded(),
            total_bytes: 0,
        };
        for (name, len, _) in found {
            index.total_bytes += len;
            index.entries.push(name, len);
        }

        let cache = Self {
            dir,
            max_bytes,
            index: Arc::new(Mutex::new(index)),
        };
        cache
            .mutate(|dir, max_bytes, index| index.evict_over_budget(dir, max_bytes))
            .await?;
        {
            let index = cache.index.lock().await;
            debug!(
                entries = index.entries.len(),
                total_bytes = index.total_bytes,
                "opened disk image cache"
            );
        }
        Ok(cache)
    }

    /// Cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configured byte budget.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Total bytes currently stored.
    pub async fn size_bytes(&self) -> u64 {
        self.index.lock().await.total_bytes
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.index.lock().await.entries.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether `key` is stored, without touching recency.
    pub async fn contains(&self, key: &str) -> bool {
        self.index.lock().await.entries.contains(&entry_name(key))
    }

    /// Reads an entry and marks it most recently used.
    ///
    /// A missing or unreadable file is treated as a miss and dropped from the index.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let name = entry_name(key);
        if self.index.lock().await.entries.get(&name).is_none() {
            return None;
        }

        match tokio::fs::read(self.dir.join(&name)).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(error) => {
                warn!(key, error = %error, "cached entry unreadable; dropping");
                self.index.lock().await.forget(&name);
                None
            }
        }
    }

    /// Stores `data` under `key`, evicting least recently used entries as needed.
    ///
    /// Dropping the returned future does not abort the write: the entry is
    /// either committed and indexed, or not stored at all.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::TooLarge`] when `data` alone exceeds the budget and
    /// [`CacheError::Io`] when the entry cannot be written.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let len = data.len() as u64;
        if len > self.max_bytes {
            return Err(CacheError::TooLarge {
                len,
                budget: self.max_bytes,
            });
        }

        let name = entry_name(key);
        let data = data.to_vec();
        self.mutate(move |dir, max_bytes, index| store_entry(dir, max_bytes, index, name, &data))
            .await?
    }

    /// Removes an entry. Returns whether it was present.
    pub async fn remove(&self, key: &str) -> bool {
        let name = entry_name(key);
        let removed = self
            .mutate(move |dir, _, index| {
                let present = index.forget(&name).is_some();
                if present {
                    remove_quietly(&dir.join(&name));
                }
                present
            })
            .await;
        removed.unwrap_or_else(|error| {
            warn!(key, error = %error, "cache removal failed");
            false
        })
    }

    /// Removes every entry.
    pub async fn clear(&self) {
        let cleared = self
            .mutate(|dir, _, index| {
                while let Some((name, _)) = index.entries.pop_lru() {
                    remove_quietly(&dir.join(&name));
                }
                index.total_bytes = 0;
            })
            .await;
        if let Err(error) = cleared {
            warn!(error = %error, "cache clear failed");
        }
    }

    /// Runs `job` on the blocking pool with the index locked.
    async fn mutate<T, F>(&self, job: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, u64, &mut DiskIndex) -> T + Send + 'static,
    {
        let dir = self.dir.clone();
        let max_bytes = self.max_bytes;
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || {
            let mut index = index.blocking_lock();
            job(&dir, max_bytes, &mut index)
        })
        .await
        .map_err(|e| CacheError::io(&self.dir, std::io::Error::other(e)))
    }
}

fn store_entry(
    dir: &Path,
    max_bytes: u64,
    index: &mut DiskIndex,
    name: String,
    data: &[u8],
) -> Result<(), CacheError> {
    let final_path = dir.join(&name);
    let temp_path = dir.join(format!("{name}.{:016x}{TEMP_SUFFIX}", rand::random::<u64>()));

    let mut guard = TempFileGuard::new(temp_path.clone());
    std::fs::write(&temp_path, data).map_err(|e| CacheError::io(&temp_path, e))?;
    std::fs::rename(&temp_path, &final_path).map_err(|e| CacheError::io(&final_path, e))?;
    guard.disarm();

    let len = data.len() as u64;
    if let Some((_, previous)) = index.entries.push(name, len) {
        index.total_bytes = index.total_bytes.saturating_sub(previous);
    }
    index.total_bytes += len;
    index.evict_over_budget(dir, max_bytes);
    Ok(())
}

fn entry_name(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn remove_quietly(path: &Path) {
    if let Err(error) = std::fs::remove_file(path)
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %error, "failed to remove cache file");
    }
}

/// Deletes a temp file on drop unless disarmed (covers failed renames).
struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
