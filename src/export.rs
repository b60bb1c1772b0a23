//! Copies loaded pages to user-chosen files.
//!
//! Bytes are written to a `.part` file next to the destination and renamed
//! into place; a failed write removes the partial file. Export failures never
//! touch loader or page state.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::decode::DEFAULT_IMAGE_MIME;
use crate::loader::{LoaderError, PageLoader, PageState};

const PART_SUFFIX: &str = ".part";

/// Errors that can occur while exporting a page.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The page could not be loaded.
    #[error("cannot export page {index}: {source}")]
    Load {
        /// Page index.
        index: usize,
        /// Why loading failed.
        #[source]
        source: LoaderError,
    },

    /// Writing the destination failed.
    #[error("IO error exporting to {path}: {source}")]
    Io {
        /// Path being written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The destination has no file name component.
    #[error("invalid export destination: {path}")]
    InvalidDestination {
        /// The rejected path.
        path: PathBuf,
    },
}

impl ExportError {
    /// Creates an IO error.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// MIME type for `filename` by extension, defaulting to `image/jpeg`.
#[must_use]
pub fn mime_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("bmp") => "image/bmp",
        Some("jxl") => "image/jxl",
        _ => DEFAULT_IMAGE_MIME,
    }
}

/// File extension matching a MIME type, `jpg` when unknown.
#[must_use]
pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/avif" => "avif",
        "image/bmp" => "bmp",
        "image/jxl" => "jxl",
        _ => "jpg",
    }
}

/// `filename` with its extension swapped for one matching `mime` when the two
/// disagree, as they do for pages re-encoded by the decode pipeline.
#[must_use]
pub fn filename_for_mime(filename: &str, mime: &str) -> String {
    if mime_for_filename(filename) == mime {
        return filename.to_owned();
    }
    Path::new(filename)
        .with_extension(extension_for_mime(mime))
        .to_string_lossy()
        .into_owned()
}

/// Writes `bytes` to `dest` through a sibling `.part` file.
///
/// # Errors
///
/// Returns [`ExportError::InvalidDestination`] when `dest` has no file name
/// and [`ExportError::Io`] when writing or renaming fails.
pub async fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let Some(name) = dest.file_name() else {
        return Err(ExportError::InvalidDestination {
            path: dest.to_path_buf(),
        });
    };
    let mut part_name = name.to_os_string();
    part_name.push(PART_SUFFIX);
    let part_path = dest.with_file_name(part_name);

    let result = write_and_rename(&part_path, dest, bytes).await;
    if result.is_err() {
        debug!(path = %part_path.display(), "cleaning up partial export");
        let _ = tokio::fs::remove_file(&part_path).await;
    }
    result
}

async fn write_and_rename(part_path: &Path, dest: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    let mut file = tokio::fs::File::create(part_path)
        .await
        .map_err(|e| ExportError::io(part_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| ExportError::io(part_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| ExportError::io(part_path, e))?;
    drop(file);
    tokio::fs::rename(part_path, dest)
        .await
        .map_err(|e| ExportError::io(dest, e))
}

impl PageLoader {
    /// Bytes of page `index`, loading it when needed.
    async fn export_bytes(&self, index: usize) -> Result<(Bytes, &'static str), ExportError> {
        if let Some(PageState::Loaded(page)) = self.page_state(index) {
            return Ok((page.bytes, page.mime_type));
        }
        let page = self
            .request_page(index)
            .await
            .map_err(|source| ExportError::Load { index, source })?;
        Ok((page.bytes, page.mime_type))
    }

    /// Copies page `index` to `dest`. Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Load`] when the page cannot be loaded, otherwise
    /// the write failure.
    #[instrument(skip(self, dest), fields(dest = %dest.as_ref().display()))]
    pub async fn export_page(&self, index: usize, dest: impl AsRef<Path>) -> Result<u64, ExportError> {
        let dest = dest.as_ref();
        let (bytes, _) = self.export_bytes(index).await?;
        write_atomically(dest, &bytes).await?;
        info!(index, len = bytes.len(), "page exported");
        Ok(bytes.len() as u64)
    }

    /// Copies page `index` to `dest`. Failures are logged and reported as `false`.
    pub async fn save(&self, index: usize, dest: impl AsRef<Path>) -> bool {
        match self.export_page(index, dest).await {
            Ok(_) => true,
            Err(error) => {
                warn!(index, error = %error, "save failed");
                false
            }
        }
    }

    /// Writes page `index` into `dir` under its own filename, for share or
    /// clipboard hand-off. Returns the written path.
    pub async fn save_to_dir(&self, index: usize, dir: impl AsRef<Path>) -> Option<PathBuf> {
        let dir = dir.as_ref();
        let result = async {
            let (bytes, mime) = self.export_bytes(index).await?;
            let filename = self
                .image_filename(index)
                .and_then(|name| {
                    Path::new(&name)
                        .file_name()
                        .map(|name| filename_for_mime(&name.to_string_lossy(), mime))
                })
                .unwrap_or_else(|| format!("{:04}.{}", index + 1, extension_for_mime(mime)));
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ExportError::io(dir, e))?;
            let dest = dir.join(filename);
            write_atomically(&dest, &bytes).await?;
            Ok::<_, ExportError>(dest)
        }
        .await;

        match result {
            Ok(dest) => {
                info!(index, path = %dest.display(), "page saved to directory");
                Some(dest)
            }
            Err(error) => {
                warn!(index, error = %error, "save to directory failed");
                None
            }
        }
    }
}
