//! Gallery Reader Core Library
//!
//! Lazy, cached, cancellable page loading for image galleries, whether they
//! live on a remote gallery site or in a local (possibly encrypted) archive.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`gallery`] - Gallery references and cached gallery metadata
//! - [`net`] - Shared HTTP client, fetch errors and retry policy
//! - [`source`] - Page sources: remote gallery scraping and ZIP archives
//! - [`cache`] - Two-tier cache: metadata in memory, page bytes on disk
//! - [`decode`] - Ordered decode pipeline (merge, crop, animation, hardware)
//! - [`loader`] - Per-gallery page loader with coalescing and cancellation
//! - [`export`] - Copying loaded pages to files

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod decode;
pub mod export;
pub mod gallery;
pub mod loader;
pub mod net;
pub mod source;
mod user_agent;

// Re-export commonly used types
pub use cache::{CacheBudget, CacheError, PageCacheStore};
pub use decode::{DecodeError, DecodeOptions, DecodePipeline, DeviceProfile};
pub use export::ExportError;
pub use gallery::{FavoriteStatusEvent, GalleryDetail, GalleryRef};
pub use loader::{
    LoadedPage, LoaderError, LoaderOptions, LoaderServices, LoaderState, PageError, PageLoader,
    PageState, PassphraseOutcome, PassphraseRequest,
};
pub use net::{FetchError, HttpClient, RetryPolicy};
pub use source::{PageSource, Quality, SourceError};
