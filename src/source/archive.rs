//! Local ZIP container source.
//!
//! Image entries are filtered by extension and ordered by natural filename
//! order. Encrypted containers stay locked until [`ArchiveSource::unlock`]
//! accepts a passphrase. All ZIP access runs on the blocking pool, each task
//! on its own handle, so pages extract in parallel.

use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use super::{PageData, ResolvedGallery, SourceError};

/// Extensions treated as pages.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "avif", "bmp", "jxl"];

#[derive(Debug, Clone)]
struct Entry {
    zip_index: usize,
    name: String,
    size: u64,
    encrypted: bool,
}

impl Entry {
    fn filename(&self) -> String {
        self.name
            .rsplit('/')
            .next()
            .unwrap_or(&self.name)
            .to_string()
    }
}

/// Idle ZIP handles kept for reuse; matches the loader's concurrency cap.
const MAX_IDLE_HANDLES: usize = 16;

/// Shared bookkeeping. ZIP handles are checked out, so no lock is held while
/// an entry is decrypted or read.
#[derive(Default)]
struct State {
    entries: Option<Arc<[Entry]>>,
    passphrase: Option<String>,
    idle: Vec<ZipArchive<File>>,
}

/// A ZIP handle owned by one blocking task, plus a snapshot of the index.
struct Checkout {
    archive: ZipArchive<File>,
    entries: Arc<[Entry]>,
    passphrase: Option<String>,
}

struct Inner {
    path: PathBuf,
    state: Mutex<State>,
    validations: AtomicUsize,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("path", &self.path)
            .field("validations", &self.validations)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes an idle handle or opens a new one, indexing entries on first use.
    fn checkout(&self) -> Result<Checkout, SourceError> {
        let (idle, entries, passphrase) = {
            let mut state = self.state();
            (state.idle.pop(), state.entries.clone(), state.passphrase.clone())
        };
        let mut archive = match idle {
            Some(archive) => archive,
            None => {
                let file = File::open(&self.path).map_err(|e| SourceError::io(&self.path, e))?;
                ZipArchive::new(file).map_err(|e| SourceError::archive(&self.path, e))?
            }
        };
        let entries = match entries {
            Some(entries) => entries,
            None => {
                let indexed: Arc<[Entry]> = index_entries(&mut archive)
                    .map_err(|e| SourceError::archive(&self.path, e))?
                    .into();
                debug!(
                    path = %self.path.display(),
                    entries = indexed.len(),
                    "indexed archive"
                );
                Arc::clone(self.state().entries.get_or_insert(indexed))
            }
        };
        Ok(Checkout {
            archive,
            entries,
            passphrase,
        })
    }

    fn checkin(&self, archive: ZipArchive<File>) {
        let mut state = self.state();
        if state.idle.len() < MAX_IDLE_HANDLES {
            state.idle.push(archive);
        }
    }

    fn resolve(&self) -> Result<ResolvedGallery, SourceError> {
        let Checkout {
            archive,
            entries,
            passphrase,
        } = self.checkout()?;
        self.checkin(archive);
        if passphrase.is_none() && entries.iter().any(|entry| entry.encrypted) {
            return Err(SourceError::needs_passphrase(&self.path));
        }
        Ok(ResolvedGallery {
            pages: entries.len(),
            filenames: entries.iter().map(|entry| Some(entry.filename())).collect(),
            detail: None,
        })
    }

    fn read(&self, index: usize) -> Result<PageData, SourceError> {
        let Checkout {
            mut archive,
            entries,
            passphrase,
        } = self.checkout()?;
        let result = entries
            .get(index)
            .ok_or(SourceError::PageOutOfRange {
                index,
                size: entries.len(),
            })
            .and_then(|entry| self.extract(&mut archive, entry, passphrase.as_deref()));
        self.checkin(archive);
        result
    }

    fn extract(
        &self,
        archive: &mut ZipArchive<File>,
        entry: &Entry,
        passphrase: Option<&str>,
    ) -> Result<PageData, SourceError> {
        let mut file = match (entry.encrypted, passphrase) {
            (false, _) => archive.by_index(entry.zip_index),
            (true, Some(passphrase)) => {
                archive.by_index_decrypt(entry.zip_index, passphrase.as_bytes())
            }
            (true, None) => return Err(SourceError::needs_passphrase(&self.path)),
        }
        .map_err(|e| SourceError::archive(&self.path, e))?;

        let mut buf = Vec::with_capacity(usize::try_from(entry.size).unwrap_or(0));
        file.read_to_end(&mut buf)
            .map_err(|e| SourceError::io(&self.path, e))?;
        Ok(PageData::single(Bytes::from(buf), Some(entry.filename())))
    }

    fn unlock(&self, candidate: &str) -> Result<bool, SourceError> {
        let Checkout {
            mut archive,
            entries,
            ..
        } = self.checkout()?;
        self.validations.fetch_add(1, AtomicOrdering::SeqCst);

        let smallest = entries
            .iter()
            .filter(|entry| entry.encrypted)
            .min_by_key(|entry| entry.size)
            .map(|entry| entry.zip_index);
        let valid = match smallest {
            // Nothing is encrypted; any passphrase works.
            None => Ok(true),
            Some(zip_index) => check_passphrase(&mut archive, zip_index, candidate)
                .map_err(|e| SourceError::archive(&self.path, e)),
        };
        self.checkin(archive);
        let valid = valid?;
        if valid {
            self.state().passphrase = Some(candidate.to_string());
        }
        Ok(valid)
    }
}

/// Decrypts one entry fully with `candidate`. `Ok(false)` means wrong passphrase.
fn check_passphrase(
    archive: &mut ZipArchive<File>,
    zip_index: usize,
    candidate: &str,
) -> Result<bool, ZipError> {
    match archive.by_index_decrypt(zip_index, candidate.as_bytes()) {
        Ok(mut file) => {
            // ZipCrypto only checks one header byte; the CRC check at EOF catches the rest.
            let mut sink = Vec::new();
            match file.read_to_end(&mut sink) {
                Ok(_) => Ok(true),
                Err(error) => {
                    debug!(error = %error, "passphrase failed checksum");
                    Ok(false)
                }
            }
        }
        Err(ZipError::InvalidPassword) => Ok(false),
        Err(error) => Err(error),
    }
}

fn index_entries(archive: &mut ZipArchive<File>) -> Result<Vec<Entry>, ZipError> {
    let mut entries = Vec::new();
    for zip_index in 0..archive.len() {
        let file = archive.by_index_raw(zip_index)?;
        if file.is_dir() || !is_image_entry(file.name()) {
            continue;
        }
        entries.push(Entry {
            zip_index,
            name: file.name().to_string(),
            size: file.size(),
            encrypted: file.encrypted(),
        });
    }
    entries.sort_by(|a, b| natural_cmp(&a.name, &b.name));
    Ok(entries)
}

/// Returns true when `name` has an image extension.
#[must_use]
pub fn is_image_entry(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Compares filenames treating digit runs as numbers (`2.jpg` < `10.jpg`).
#[must_use]
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let l_run = take_digits(&mut left);
                let r_run = take_digits(&mut right);
                let l_trimmed = l_run.trim_start_matches('0');
                let r_trimmed = r_run.trim_start_matches('0');
                let ordering = l_trimmed
                    .len()
                    .cmp(&r_trimmed.len())
                    .then_with(|| l_trimmed.cmp(r_trimmed))
                    .then_with(|| l_run.len().cmp(&r_run.len()));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                let ordering = l.to_ascii_lowercase().cmp(&r.to_ascii_lowercase());
                if ordering != Ordering::Equal {
                    return ordering;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        run.push(c);
    }
    run
}

/// Pages read from a local ZIP file.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    inner: Arc<Inner>,
}

impl ArchiveSource {
    /// Creates a source for the archive at `path`. Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                state: Mutex::new(State::default()),
                validations: AtomicUsize::new(0),
            }),
        }
    }

    /// Archive path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of passphrase validations run against the container.
    #[must_use]
    pub fn validation_attempts(&self) -> usize {
        self.inner.validations.load(AtomicOrdering::SeqCst)
    }

    /// Returns true once a passphrase has been accepted.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.inner.state().passphrase.is_some()
    }

    async fn blocking<T, F>(&self, task: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, SourceError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || task(&inner))
            .await
            .map_err(|e| SourceError::task(&e))?
    }

    /// Reads the container index.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NeedsPassphrase`] when entries are encrypted and
    /// no passphrase has been accepted, or the IO/ZIP failure.
    #[instrument(skip(self), fields(path = %self.inner.path.display()))]
    pub async fn resolve(&self) -> Result<ResolvedGallery, SourceError> {
        let resolved = self.blocking(Inner::resolve).await?;
        info!(pages = resolved.pages, "archive resolved");
        Ok(resolved)
    }

    /// Extracts page `index`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::PageOutOfRange`] past the last entry, or the
    /// IO/ZIP failure for this entry.
    #[instrument(skip(self), fields(path = %self.inner.path.display()))]
    pub async fn fetch_page(&self, index: usize) -> Result<PageData, SourceError> {
        self.blocking(move |inner| inner.read(index)).await
    }

    /// Validates `passphrase` by decrypting the smallest encrypted entry.
    ///
    /// Returns `Ok(false)` for a wrong passphrase.
    ///
    /// # Errors
    ///
    /// Returns the IO/ZIP failure when the container itself is unreadable.
    #[instrument(skip_all, fields(path = %self.inner.path.display()))]
    pub async fn unlock(&self, passphrase: &str) -> Result<bool, SourceError> {
        let passphrase = passphrase.to_string();
        let valid = self.blocking(move |inner| inner.unlock(&passphrase)).await?;
        if valid {
            info!("archive unlocked");
        } else {
            warn!("archive passphrase rejected");
        }
        Ok(valid)
    }
}
