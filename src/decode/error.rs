//! Error types for decode pipeline stages.

use thiserror::Error;

/// Errors produced by a decode stage.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The image codec rejected the bytes.
    #[error("{stage} stage could not process image: {source}")]
    Image {
        /// Stage that failed.
        stage: &'static str,
        /// The underlying codec error.
        #[source]
        source: image::ImageError,
    },

    /// The page has no image data at all.
    #[error("page has no image data")]
    Empty,

    /// The stage cannot handle this combination of inputs.
    #[error("{stage} stage: {reason}")]
    Unsupported {
        /// Stage that refused the input.
        stage: &'static str,
        /// Why.
        reason: String,
    },
}

impl DecodeError {
    /// Creates a codec error for `stage`.
    pub fn image(stage: &'static str, source: image::ImageError) -> Self {
        Self::Image { stage, source }
    }

    /// Creates an unsupported-input error for `stage`.
    pub fn unsupported(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            stage,
            reason: reason.into(),
        }
    }
}
