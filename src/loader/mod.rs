//! The page loader: one gallery, many pages, loaded on demand.
//!
//! A [`PageLoader`] owns one [`PageSource`] and drives it through
//! `Idle → Starting → Ready | Failed`, with `Stopped` terminal. Once Ready,
//! pages are requested by index in any order. Each page has its own state
//! (`NotRequested → Loading → Loaded | LoadFailed`) published on a `watch`
//! channel; concurrent requests for a page park on that channel instead of
//! spawning a second fetch.
//!
//! # Concurrency
//!
//! - Resolution and every page fetch run as tasks in the loader's `JoinSet`
//! - A [`CancellationToken`] per generation is observed at every suspension point
//! - A [`Semaphore`] caps concurrent page fetches
//! - `stop()`/`restart()` cancel the token, abort the set and drain it before returning
//! - The internal `Mutex` is never held across `.await`
//!
//! # Example
//!
//! ```no_run
//! use gallery_core::cache::{CacheBudget, PageCacheStore};
//! use gallery_core::gallery::GalleryRef;
//! use gallery_core::loader::{LoaderServices, PageLoader};
//! use gallery_core::net::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let caches = PageCacheStore::open("/tmp/gallery-cache", CacheBudget::default()).await?;
//! let services = LoaderServices::new(HttpClient::new(), caches);
//! let loader = PageLoader::new(GalleryRef::remote(12345, "0123abcd"), None, services);
//!
//! loader.start();
//! if loader.await_ready().await {
//!     let page = loader.request_page(0).await?;
//!     println!("{} bytes, {}", page.bytes.len(), page.mime_type);
//! }
//! loader.stop().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod passphrase;
mod state;

pub use error::{LoaderError, PageError};
pub use passphrase::{PassphraseOutcome, PassphraseRequest, PendingVerdict, is_blank};
pub use state::{LoadedPage, LoaderState, PageEntry, PageEvent, PageState};

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::PageCacheStore;
use crate::decode::{DecodeOptions, DecodePipeline, PageImage};
use crate::gallery::{GalleryDetail, GalleryRef};
use crate::net::{HttpClient, RetryPolicy};
use crate::source::{
    ArchiveLookup, ArchiveSource, NoArchives, PageSource, Quality, RemoteSource, ResolvedGallery,
    SourceError,
};
use self::passphrase::Submission;

/// Default number of concurrent page fetches per loader.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Upper bound for `fetch_concurrency`.
pub const MAX_FETCH_CONCURRENCY: usize = 16;

/// Gallery site used when none is configured.
pub const DEFAULT_BASE_URL: &str = "https://e-hentai.org";

/// Buffered page events per subscriber before old ones are dropped.
const PAGE_EVENT_CAPACITY: usize = 256;

/// Loader tuning.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Gallery site root.
    pub base_url: String,
    /// Image variant fetched by default.
    pub quality: Quality,
    /// Decode pipeline settings.
    pub decode: DecodeOptions,
    /// Maximum concurrent page fetches (clamped to 1..=16).
    pub fetch_concurrency: usize,
    /// Retry policy for remote requests.
    pub retry: RetryPolicy,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            quality: Quality::Resized,
            decode: DecodeOptions::default(),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything a loader borrows from the application root.
#[derive(Debug, Clone)]
pub struct LoaderServices {
    /// Shared HTTP client with the cookie store.
    pub client: HttpClient,
    /// Metadata and page byte caches.
    pub caches: PageCacheStore,
    /// Finds already downloaded archives of remote galleries.
    pub archives: Arc<dyn ArchiveLookup>,
    /// Loader tuning.
    pub options: LoaderOptions,
}

impl LoaderServices {
    /// Services with default options and no archive lookup.
    #[must_use]
    pub fn new(client: HttpClient, caches: PageCacheStore) -> Self {
        Self {
            client,
            caches,
            archives: Arc::new(NoArchives),
            options: LoaderOptions::default(),
        }
    }

    /// Replaces the archive lookup.
    #[must_use]
    pub fn with_archives(mut self, archives: Arc<dyn ArchiveLookup>) -> Self {
        self.archives = archives;
        self
    }

    /// Replaces the loader options.
    #[must_use]
    pub fn with_options(mut self, options: LoaderOptions) -> Self {
        self.options = options;
        self
    }
}

/// Disk cache key for the bytes delivered by a remote source.
#[must_use]
pub fn raw_cache_key(scope: &str, index: usize, quality: Quality) -> String {
    format!("{scope}:{index}:{}", quality.as_str())
}

/// Disk cache key for bytes a decode stage rewrote.
///
/// The key names the settings that produced the bytes, so an entry written
/// under other settings is never served.
#[must_use]
pub fn decoded_cache_key(scope: &str, index: usize, quality: Quality, crop_borders: bool) -> String {
    let variant = if crop_borders { "cropped" } else { "plain" };
    format!("{scope}:{index}:{}:{variant}", quality.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    Normal,
    Retry { want_original: bool },
}

impl FetchMode {
    /// Whether a page in `state` needs a new fetch task.
    fn needs_fetch(self, state: &PageState) -> bool {
        match (state, self) {
            (PageState::NotRequested, _)
            | (PageState::Loaded(_), Self::Retry { want_original: true })
            | (PageState::LoadFailed(_), Self::Retry { .. }) => true,
            (PageState::Loading | PageState::Loaded(_) | PageState::LoadFailed(_), _) => false,
        }
    }
}

/// Full pipeline for fresh bytes, inspection-only pipeline for cached decoded bytes.
#[derive(Debug, Clone)]
struct Pipelines {
    full: Arc<DecodePipeline>,
    cached: Arc<DecodePipeline>,
    crop_borders: bool,
}

impl Pipelines {
    fn new(options: DecodeOptions) -> Self {
        Self {
            crop_borders: options.crop_borders,
            full: Arc::new(DecodePipeline::standard(options)),
            cached: Arc::new(DecodePipeline::standard(DecodeOptions {
                crop_borders: false,
                ..options
            })),
        }
    }
}

#[derive(Debug)]
struct PageSlot {
    tx: watch::Sender<PageState>,
    original_size: Option<u64>,
    decoded_size: Option<u64>,
    filename: Option<String>,
}

impl PageSlot {
    fn new(filename: Option<String>) -> Self {
        Self {
            tx: watch::Sender::new(PageState::NotRequested),
            original_size: None,
            decoded_size: None,
            filename,
        }
    }

    fn entry(&self, index: usize) -> PageEntry {
        PageEntry {
            index,
            state: self.tx.borrow().clone(),
            original_size: self.original_size,
            decoded_size: self.decoded_size,
            filename: self.filename.clone(),
        }
    }
}

#[derive(Debug)]
struct Core {
    generation: u64,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    source: Option<Arc<PageSource>>,
    pages: Vec<PageSlot>,
    start_page: Option<usize>,
    detail: Option<Arc<GalleryDetail>>,
    last_error: Option<Arc<LoaderError>>,
    decode: DecodeOptions,
    pipelines: Pipelines,
    passphrase_rx: Option<mpsc::Receiver<PassphraseRequest>>,
}

/// Result of one successful page load.
struct Fetched {
    page: LoadedPage,
    filename: Option<String>,
    original_size: Option<u64>,
    cache_writes: Vec<(String, Bytes)>,
}

struct FetchJob {
    source: Arc<PageSource>,
    generation: u64,
    cancel: CancellationToken,
    pipelines: Pipelines,
    index: usize,
    mode: FetchMode,
}

struct Inner {
    gallery: GalleryRef,
    scope: String,
    services: LoaderServices,
    semaphore: Arc<Semaphore>,
    state_tx: watch::Sender<LoaderState>,
    events: broadcast::Sender<PageEvent>,
    passphrase_tx: mpsc::Sender<PassphraseRequest>,
    core: Mutex<Core>,
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> LoaderState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: LoaderState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(gallery = %self.gallery, from = ?previous, to = ?state, "loader state");
        }
    }

    fn publish(&self, index: usize, state: PageState) {
        // No subscribers is fine.
        let _ = self.events.send(PageEvent { index, state });
    }

    fn select_source(&self) -> PageSource {
        match &self.gallery {
            GalleryRef::Archive { path } => PageSource::Archive(ArchiveSource::new(path)),
            GalleryRef::Remote { gid, token } => {
                if let Some(path) = self.services.archives.find(*gid) {
                    info!(gid, path = %path.display(), "reading downloaded archive");
                    return PageSource::Archive(ArchiveSource::new(path));
                }
                let options = &self.services.options;
                PageSource::Remote(
                    RemoteSource::new(
                        self.services.client.clone(),
                        options.base_url.clone(),
                        *gid,
                        token.clone(),
                        Arc::clone(self.services.caches.metadata()),
                    )
                    .with_retry_policy(options.retry.clone()),
                )
            }
        }
    }

    /// Moves to Starting and spawns the resolve task. Caller holds the core lock.
    fn launch(self: &Arc<Self>, core: &mut Core) {
        let source = Arc::clone(
            core.source
                .get_or_insert_with(|| Arc::new(self.select_source())),
        );
        core.last_error = None;
        self.set_state(LoaderState::Starting);

        let inner = Arc::clone(self);
        let generation = core.generation;
        let cancel = core.cancel.clone();
        reap(&mut core.tasks);
        core.tasks
            .spawn(async move { inner.run_resolve(source, generation, cancel).await });
    }

    async fn run_resolve(
        self: Arc<Self>,
        source: Arc<PageSource>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let outcome = tokio::select! {
            () = cancel.cancelled() => return,
            outcome = self.resolve_with_unlock(&source) => outcome,
        };
        match outcome {
            Ok(resolved) => self.on_resolved(generation, resolved),
            Err(error) => self.on_failed(generation, error),
        }
    }

    async fn resolve_with_unlock(&self, source: &PageSource) -> Result<ResolvedGallery, LoaderError> {
        loop {
            match source.resolve().await {
                Ok(resolved) => return Ok(resolved),
                Err(SourceError::NeedsPassphrase { path }) => self.unlock(source, &path).await?,
                Err(error) => return Err(LoaderError::resolve(&self.gallery, error)),
            }
        }
    }

    /// Asks for passphrases until one is accepted or the requester gives up.
    async fn unlock(&self, source: &PageSource, path: &Path) -> Result<(), LoaderError> {
        let unattended = self.core().passphrase_rx.is_some();
        if unattended {
            warn!(path = %path.display(), "archive is encrypted and nobody takes passphrase requests");
            return Err(LoaderError::passphrase_abandoned(path));
        }

        let mut attempt: u32 = 0;
        let mut previous = None;
        loop {
            attempt = attempt.saturating_add(1);
            let (request, reply) = PassphraseRequest::new(path.to_path_buf(), attempt, previous);
            if self.passphrase_tx.send(request).await.is_err() {
                return Err(LoaderError::passphrase_abandoned(path));
            }
            let Ok(Submission::Passphrase { text, verdict }) = reply.await else {
                info!(path = %path.display(), attempt, "passphrase request abandoned");
                return Err(LoaderError::passphrase_abandoned(path));
            };

            let outcome = if is_blank(&text) {
                PassphraseOutcome::Empty
            } else {
                match source.unlock(&text).await {
                    Ok(true) => PassphraseOutcome::Accepted,
                    Ok(false) => PassphraseOutcome::Invalid,
                    Err(error) => return Err(LoaderError::resolve(&self.gallery, error)),
                }
            };
            debug!(attempt, ?outcome, "passphrase checked");
            // The requester may have stopped listening; the outcome still applies.
            let _ = verdict.send(outcome);
            if outcome == PassphraseOutcome::Accepted {
                return Ok(());
            }
            previous = Some(outcome);
        }
    }

    fn on_resolved(&self, generation: u64, resolved: ResolvedGallery) {
        let mut core = self.core();
        if core.generation != generation {
            return;
        }
        let pages = resolved.pages;
        if core.pages.len() == pages {
            for (slot, filename) in core.pages.iter_mut().zip(resolved.filenames) {
                if slot.filename.is_none() {
                    slot.filename = filename;
                }
            }
        } else {
            core.pages = resolved
                .filenames
                .into_iter()
                .chain(std::iter::repeat(None))
                .take(pages)
                .map(PageSlot::new)
                .collect();
        }
        core.start_page = core
            .start_page
            .filter(|_| pages > 0)
            .map(|page| page.min(pages - 1));
        core.detail = resolved.detail;
        info!(gallery = %self.gallery, pages, "gallery ready");
        self.set_state(LoaderState::Ready);
    }

    fn on_failed(&self, generation: u64, error: LoaderError) {
        let mut core = self.core();
        if core.generation != generation {
            return;
        }
        warn!(gallery = %self.gallery, error = %error, "gallery failed to load");
        core.last_error = Some(Arc::new(error));
        self.set_state(LoaderState::Failed);
    }

    fn check_index(&self, core: &Core, index: usize) -> Result<(), LoaderError> {
        if self.state() != LoaderState::Ready {
            return Err(LoaderError::NotReady);
        }
        if index >= core.pages.len() {
            return Err(LoaderError::OutOfBounds {
                index,
                size: core.pages.len(),
            });
        }
        Ok(())
    }

    /// Spawns a fetch for `index` unless one is running or the state forbids it.
    fn schedule(
        self: &Arc<Self>,
        index: usize,
        mode: FetchMode,
    ) -> Result<(watch::Receiver<PageState>, CancellationToken), LoaderError> {
        let mut guard = self.core();
        let core = &mut *guard;
        self.check_index(core, index)?;
        let source = core.source.clone().ok_or(LoaderError::NotReady)?;

        let slot = &core.pages[index];
        let receiver = slot.tx.subscribe();
        let needs_fetch = mode.needs_fetch(&slot.tx.borrow());
        if needs_fetch {
            slot.tx.send_replace(PageState::Loading);
            self.publish(index, PageState::Loading);

            let job = FetchJob {
                source,
                generation: core.generation,
                cancel: core.cancel.clone(),
                pipelines: core.pipelines.clone(),
                index,
                mode,
            };
            let inner = Arc::clone(self);
            reap(&mut core.tasks);
            core.tasks.spawn(async move { inner.run_fetch(job).await });
            debug!(index, ?mode, "page fetch scheduled");
        }
        Ok((receiver, core.cancel.clone()))
    }

    async fn run_fetch(self: Arc<Self>, job: FetchJob) {
        let FetchJob {
            source,
            generation,
            cancel,
            pipelines,
            index,
            mode,
        } = job;

        let _permit = tokio::select! {
            () = cancel.cancelled() => return,
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let outcome = tokio::select! {
            () = cancel.cancelled() => return,
            outcome = self.load(&source, &pipelines, index, mode) => outcome,
        };

        let cache_writes = match outcome {
            Ok(mut fetched) => {
                let writes = std::mem::take(&mut fetched.cache_writes);
                if !self.complete(generation, index, Ok(fetched)) {
                    return;
                }
                writes
            }
            Err(error) => {
                self.complete(generation, index, Err(error));
                return;
            }
        };

        let images = self.services.caches.images();
        for (key, bytes) in cache_writes {
            tokio::select! {
                () = cancel.cancelled() => return,
                result = images.put(&key, &bytes) => {
                    if let Err(error) = result {
                        warn!(index, key = %key, error = %error, "cache write failed; page stays uncached");
                    }
                }
            }
        }
    }

    async fn load(
        &self,
        source: &PageSource,
        pipelines: &Pipelines,
        index: usize,
        mode: FetchMode,
    ) -> Result<Fetched, PageError> {
        let images = self.services.caches.images();
        let remote = matches!(source, PageSource::Remote(_));
        let quality = match mode {
            FetchMode::Retry {
                want_original: true,
            } => Quality::Original,
            _ => self.services.options.quality,
        };
        let raw_key = raw_cache_key(&self.scope, index, quality);
        let decoded_key = decoded_cache_key(&self.scope, index, quality, pipelines.crop_borders);

        if mode == FetchMode::Normal {
            if let Some(bytes) = images.get(&decoded_key).await {
                debug!(index, "decoded cache hit");
                let image = decode(&pipelines.cached, index, PageImage::single(bytes)).await?;
                return Ok(Fetched {
                    page: loaded_page(index, image, true)?,
                    filename: None,
                    original_size: None,
                    cache_writes: Vec::new(),
                });
            }
            if remote && let Some(bytes) = images.get(&raw_key).await {
                debug!(index, "raw cache hit");
                let original_size = Some(bytes.len() as u64);
                let image = decode(&pipelines.full, index, PageImage::single(bytes)).await?;
                let transformed = image.transformed;
                let page = loaded_page(index, image, true)?;
                let cache_writes = if transformed {
                    vec![(decoded_key, page.bytes.clone())]
                } else {
                    Vec::new()
                };
                return Ok(Fetched {
                    page,
                    filename: None,
                    original_size,
                    cache_writes,
                });
            }
        }

        let data = match mode {
            FetchMode::Normal => source.fetch_page(index, quality).await,
            FetchMode::Retry { .. } => source.retry_page(index, quality).await,
        }
        .map_err(|e| PageError::fetch(index, e))?;

        let original_size = Some(data.len());
        let mut cache_writes = Vec::new();
        if remote && let [single] = data.parts.as_slice() {
            cache_writes.push((raw_key, single.clone()));
        }
        let image = decode(&pipelines.full, index, PageImage::split(data.parts)).await?;
        let transformed = image.transformed;
        let page = loaded_page(index, image, false)?;
        if transformed {
            cache_writes.push((decoded_key, page.bytes.clone()));
        }
        Ok(Fetched {
            page,
            filename: data.filename,
            original_size,
            cache_writes,
        })
    }

    /// Records the outcome unless the loader moved on. Returns whether it was recorded.
    fn complete(&self, generation: u64, index: usize, outcome: Result<Fetched, PageError>) -> bool {
        let mut core = self.core();
        if core.generation != generation {
            return false;
        }
        let Some(slot) = core.pages.get_mut(index) else {
            return false;
        };
        let state = match outcome {
            Ok(fetched) => {
                if fetched.original_size.is_some() {
                    slot.original_size = fetched.original_size;
                }
                slot.decoded_size = Some(fetched.page.bytes.len() as u64);
                if fetched.filename.is_some() {
                    slot.filename = fetched.filename;
                }
                debug!(index, from_cache = fetched.page.from_cache, "page loaded");
                PageState::Loaded(fetched.page)
            }
            Err(error) => {
                warn!(index, error = %error, "page failed to load");
                PageState::LoadFailed(Arc::new(error))
            }
        };
        slot.tx.send_replace(state.clone());
        self.publish(index, state);
        true
    }
}

async fn decode(
    pipeline: &Arc<DecodePipeline>,
    index: usize,
    image: PageImage,
) -> Result<PageImage, PageError> {
    let pipeline = Arc::clone(pipeline);
    tokio::task::spawn_blocking(move || pipeline.run(image))
        .await
        .map_err(|e| PageError::Task {
            index,
            reason: e.to_string(),
        })?
        .map_err(|e| PageError::decode(index, e))
}

fn loaded_page(index: usize, image: PageImage, from_cache: bool) -> Result<LoadedPage, PageError> {
    let mime_type = image.mime_type();
    let decoder = image.decoder;
    let hardware = image.hardware;
    let dimensions = image.dimensions;
    let bytes = image.into_bytes().map_err(|e| PageError::decode(index, e))?;
    Ok(LoadedPage {
        index,
        bytes,
        mime_type,
        decoder,
        hardware,
        dimensions,
        from_cache,
    })
}

/// Drops finished tasks from the set.
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(error) = result
            && error.is_panic()
        {
            warn!(error = %error, "loader task panicked");
        }
    }
}

async fn drain(mut tasks: JoinSet<()>) -> usize {
    let pending = tasks.len();
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    pending
}

/// Waits for `index` to finish loading.
async fn wait_for_page(
    mut receiver: watch::Receiver<PageState>,
    cancel: CancellationToken,
    index: usize,
) -> Result<LoadedPage, LoaderError> {
    let state = tokio::select! {
        () = cancel.cancelled() => return Err(LoaderError::Interrupted { index }),
        state = receiver.wait_for(|state| !matches!(state, PageState::Loading)) => {
            state.map(|state| PageState::clone(&state))
        }
    };
    match state {
        Ok(PageState::Loaded(page)) => Ok(page),
        Ok(PageState::LoadFailed(error)) => Err(LoaderError::Page(error)),
        Ok(PageState::NotRequested | PageState::Loading) | Err(_) => {
            Err(LoaderError::Interrupted { index })
        }
    }
}

/// Loads the pages of one gallery.
///
/// Cloning is cheap; clones control the same loader. Must be used inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct PageLoader {
    inner: Arc<Inner>,
}

impl fmt::Debug for PageLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageLoader")
            .field("gallery", &self.inner.gallery)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl PageLoader {
    /// Creates an idle loader for `gallery`.
    ///
    /// `start_page` is the initial reading position; `None` means the first page.
    #[must_use]
    pub fn new(gallery: GalleryRef, start_page: Option<usize>, services: LoaderServices) -> Self {
        let permits = services
            .options
            .fetch_concurrency
            .clamp(1, MAX_FETCH_CONCURRENCY);
        let decode = services.options.decode;
        let (passphrase_tx, passphrase_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(PAGE_EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                scope: gallery.cache_scope(),
                gallery,
                services,
                semaphore: Arc::new(Semaphore::new(permits)),
                state_tx: watch::Sender::new(LoaderState::Idle),
                events,
                passphrase_tx,
                core: Mutex::new(Core {
                    generation: 0,
                    cancel: CancellationToken::new(),
                    tasks: JoinSet::new(),
                    source: None,
                    pages: Vec::new(),
                    start_page,
                    detail: None,
                    last_error: None,
                    decode,
                    pipelines: Pipelines::new(decode),
                    passphrase_rx: Some(passphrase_rx),
                }),
            }),
        }
    }

    /// Gallery this loader reads.
    #[must_use]
    pub fn gallery(&self) -> &GalleryRef {
        &self.inner.gallery
    }

    /// Current loader state.
    #[must_use]
    pub fn state(&self) -> LoaderState {
        self.inner.state()
    }

    /// Subscribes to loader state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LoaderState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribes to page state changes.
    #[must_use]
    pub fn subscribe_pages(&self) -> broadcast::Receiver<PageEvent> {
        self.inner.events.subscribe()
    }

    /// Takes the passphrase request channel. Only the first call gets it.
    ///
    /// If nobody takes it, an encrypted archive fails with
    /// [`LoaderError::PassphraseAbandoned`].
    pub fn passphrase_requests(&self) -> Option<mpsc::Receiver<PassphraseRequest>> {
        self.inner.core().passphrase_rx.take()
    }

    /// Starts resolving the gallery. Calling it again does nothing.
    #[instrument(skip(self), fields(gallery = %self.inner.gallery))]
    pub fn start(&self) {
        let mut core = self.inner.core();
        if self.inner.state() != LoaderState::Idle {
            debug!(state = ?self.inner.state(), "start ignored");
            return;
        }
        self.inner.launch(&mut core);
    }

    /// Cancels all work and releases the source. Safe to call repeatedly.
    ///
    /// Every in-flight task has finished when this returns.
    #[instrument(skip(self), fields(gallery = %self.inner.gallery))]
    pub async fn stop(&self) {
        let tasks = {
            let mut core = self.inner.core();
            core.generation += 1;
            core.cancel.cancel();
            core.source = None;
            self.inner.set_state(LoaderState::Stopped);
            std::mem::take(&mut core.tasks)
        };
        let pending = drain(tasks).await;
        debug!(pending, "loader stopped");
    }

    /// Aborts in-flight work, resets every page, drops this gallery's decoded
    /// cache entries and resolves again.
    #[instrument(skip(self), fields(gallery = %self.inner.gallery))]
    pub async fn restart(&self) {
        let (tasks, generation, size) = {
            let mut guard = self.inner.core();
            let core = &mut *guard;
            if self.inner.state() == LoaderState::Stopped {
                debug!("restart ignored on stopped loader");
                return;
            }
            core.generation += 1;
            core.cancel.cancel();
            core.cancel = CancellationToken::new();
            for (index, slot) in core.pages.iter_mut().enumerate() {
                slot.original_size = None;
                slot.decoded_size = None;
                slot.tx.send_replace(PageState::NotRequested);
                self.inner.publish(index, PageState::NotRequested);
            }
            self.inner.set_state(LoaderState::Starting);
            (
                std::mem::take(&mut core.tasks),
                core.generation,
                core.pages.len(),
            )
        };
        let pending = drain(tasks).await;

        let images = self.inner.services.caches.images();
        for index in 0..size {
            for quality in [Quality::Resized, Quality::Original] {
                for crop_borders in [false, true] {
                    let key = decoded_cache_key(&self.inner.scope, index, quality, crop_borders);
                    images.remove(&key).await;
                }
            }
        }

        let mut core = self.inner.core();
        if core.generation == generation {
            self.inner.launch(&mut core);
        }
        info!(pending, pages = size, "loader restarted");
    }

    /// Switches border cropping, restarting when the setting changes.
    pub async fn set_crop_borders(&self, enabled: bool) {
        {
            let mut core = self.inner.core();
            if core.decode.crop_borders == enabled {
                return;
            }
            core.decode.crop_borders = enabled;
            core.pipelines = Pipelines::new(core.decode);
        }
        self.restart().await;
    }

    /// Waits until the loader is Ready (true) or Failed/Stopped (false).
    pub async fn await_ready(&self) -> bool {
        let mut receiver = self.inner.state_tx.subscribe();
        let settled = receiver
            .wait_for(|state| state.is_settled())
            .await
            .map(|state| *state);
        matches!(settled, Ok(LoaderState::Ready))
    }

    /// Returns true once the page count is known.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.state() == LoaderState::Ready
    }

    /// Number of pages, once Ready.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        let core = self.inner.core();
        self.is_ready().then_some(core.pages.len())
    }

    /// Fatal error that moved the loader to Failed.
    #[must_use]
    pub fn last_error(&self) -> Option<Arc<LoaderError>> {
        self.inner.core().last_error.clone()
    }

    /// Gallery metadata, for remote galleries once Ready.
    #[must_use]
    pub fn detail(&self) -> Option<Arc<GalleryDetail>> {
        self.inner.core().detail.clone()
    }

    /// The page source, while one is held.
    #[must_use]
    pub fn source(&self) -> Option<Arc<PageSource>> {
        self.inner.core().source.clone()
    }

    /// Initial reading position, clamped into range once Ready.
    #[must_use]
    pub fn start_page(&self) -> usize {
        self.inner.core().start_page.unwrap_or(0)
    }

    /// Moves the initial reading position.
    pub fn set_start_page(&self, index: usize) {
        let mut core = self.inner.core();
        let index = if self.is_ready() && !core.pages.is_empty() {
            index.min(core.pages.len() - 1)
        } else {
            index
        };
        core.start_page = Some(index);
    }

    /// Current state of page `index`, `None` when the index is unknown.
    #[must_use]
    pub fn page_state(&self, index: usize) -> Option<PageState> {
        self.inner
            .core()
            .pages
            .get(index)
            .map(|slot| slot.tx.borrow().clone())
    }

    /// Bookkeeping snapshot of page `index`.
    #[must_use]
    pub fn page_entry(&self, index: usize) -> Option<PageEntry> {
        self.inner
            .core()
            .pages
            .get(index)
            .map(|slot| slot.entry(index))
    }

    /// Filename of page `index`, when the source reported one.
    #[must_use]
    pub fn image_filename(&self, index: usize) -> Option<String> {
        self.inner
            .core()
            .pages
            .get(index)
            .and_then(|slot| slot.filename.clone())
    }

    /// Number of resolve and fetch tasks still running.
    #[must_use]
    pub fn outstanding_tasks(&self) -> usize {
        let mut core = self.inner.core();
        reap(&mut core.tasks);
        core.tasks.len()
    }

    /// Starts loading page `index` without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::NotReady`] before Ready and
    /// [`LoaderError::OutOfBounds`] outside `[0, size)`.
    pub fn prefetch(&self, index: usize) -> Result<(), LoaderError> {
        self.inner.schedule(index, FetchMode::Normal).map(|_| ())
    }

    /// Loads page `index`, joining a fetch already in flight.
    ///
    /// A page that already failed returns its error; use
    /// [`PageLoader::retry_page`] to try again.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::NotReady`], [`LoaderError::OutOfBounds`],
    /// [`LoaderError::Page`] when the page failed, or
    /// [`LoaderError::Interrupted`] when the loader stopped or restarted meanwhile.
    #[instrument(skip(self), fields(gallery = %self.inner.gallery))]
    pub async fn request_page(&self, index: usize) -> Result<LoadedPage, LoaderError> {
        let (receiver, cancel) = self.inner.schedule(index, FetchMode::Normal)?;
        wait_for_page(receiver, cancel, index).await
    }

    /// Fetches page `index` again.
    ///
    /// Applies to failed pages, or to loaded pages when `want_original` asks
    /// for the original-quality image. Otherwise behaves like
    /// [`PageLoader::request_page`].
    ///
    /// # Errors
    ///
    /// Same as [`PageLoader::request_page`].
    #[instrument(skip(self), fields(gallery = %self.inner.gallery))]
    pub async fn retry_page(
        &self,
        index: usize,
        want_original: bool,
    ) -> Result<LoadedPage, LoaderError> {
        let (receiver, cancel) = self
            .inner
            .schedule(index, FetchMode::Retry { want_original })?;
        wait_for_page(receiver, cancel, index).await
    }
}
