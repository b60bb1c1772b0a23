//! Loader and page state types.

use std::sync::Arc;

use bytes::Bytes;

use super::PageError;
use crate::decode::DecoderKind;

/// Lifecycle of a [`PageLoader`](super::PageLoader).
///
/// `Idle → Starting → Ready | Failed`; `Stopped` is terminal and reachable
/// from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoaderState {
    /// Constructed, not started.
    #[default]
    Idle,
    /// Resolving the page count (including any passphrase exchange).
    Starting,
    /// Page count known; pages can be requested.
    Ready,
    /// Resolution failed; see `last_error()`.
    Failed,
    /// Stopped; no further transitions.
    Stopped,
}

impl LoaderState {
    /// Returns true for states `await_ready()` stops waiting on.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Stopped)
    }
}

/// A page that made it through the decode pipeline.
#[derive(Debug, Clone)]
pub struct LoadedPage {
    /// Page index.
    pub index: usize,
    /// Encoded image bytes ready for the consumer's decoder.
    pub bytes: Bytes,
    /// MIME type sniffed from the bytes.
    pub mime_type: &'static str,
    /// Decoder route.
    pub decoder: DecoderKind,
    /// Whether the bitmap may use hardware memory.
    pub hardware: bool,
    /// Pixel dimensions, when probed.
    pub dimensions: Option<(u32, u32)>,
    /// Whether the bytes came from the disk cache.
    pub from_cache: bool,
}

/// State of one page.
///
/// `Loaded` and `LoadFailed` carry their payloads, so a page is never both.
#[derive(Debug, Clone, Default)]
pub enum PageState {
    /// Nobody asked for the page yet (or the loader restarted).
    #[default]
    NotRequested,
    /// A fetch task is running.
    Loading,
    /// Bytes are available.
    Loaded(LoadedPage),
    /// The last attempt failed; `retry_page` may try again.
    LoadFailed(Arc<PageError>),
}

impl PageState {
    /// Returns true for `Loaded` and `LoadFailed`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Loaded(_) | Self::LoadFailed(_))
    }

    /// Short name for logs and progress output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotRequested => "not-requested",
            Self::Loading => "loading",
            Self::Loaded(_) => "loaded",
            Self::LoadFailed(_) => "failed",
        }
    }
}

/// Snapshot of one page's bookkeeping.
#[derive(Debug, Clone)]
pub struct PageEntry {
    /// Page index, stable for the loader's lifetime.
    pub index: usize,
    /// Current state.
    pub state: PageState,
    /// Size of the bytes delivered by the source.
    pub original_size: Option<u64>,
    /// Size after the decode pipeline.
    pub decoded_size: Option<u64>,
    /// Filename reported by the source.
    pub filename: Option<String>,
}

/// Page state change broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct PageEvent {
    /// Page index.
    pub index: usize,
    /// New state.
    pub state: PageState,
}
