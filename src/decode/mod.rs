//! Ordered byte-level transformations applied to every fetched page.
//!
//! The standard pipeline runs, in order:
//!
//! 1. [`MergeStage`] - joins split pages into one image
//! 2. [`CropBorderStage`] - trims uniform margins (only when enabled)
//! 3. [`HardwareEligibilityStage`] - decides whether accelerated memory may back the bitmap
//! 4. [`AnimatedDetectionStage`] - routes animated formats to an animation decoder
//!
//! Each stage is pure: a [`PageImage`] goes in, a [`PageImage`] comes out.
//! Pixel decoding for display stays with the consumer.

mod animated;
mod crop;
mod error;
mod hardware;
mod merge;

pub use animated::{AnimatedDetectionStage, is_animated};
pub use crop::CropBorderStage;
pub use error::DecodeError;
pub use hardware::{DEFAULT_MAX_TEXTURE_SIZE, DeviceProfile, HardwareEligibilityStage};
pub use merge::MergeStage;

use std::fmt;
use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageReader};
use tracing::{debug, instrument};

/// MIME type used when the byte signature is not recognised.
pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// Which decoder the consumer should use for the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderKind {
    /// Single-frame bitmap decoder.
    #[default]
    Static,
    /// Animation-capable decoder (GIF, animated WebP, APNG).
    Animated,
}

/// A page travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Encoded image parts. After [`MergeStage`] there is exactly one.
    pub parts: Vec<Bytes>,
    /// Pixel dimensions, once probed.
    pub dimensions: Option<(u32, u32)>,
    /// Decoder route chosen by [`AnimatedDetectionStage`].
    pub decoder: DecoderKind,
    /// Whether the bitmap may live in hardware memory.
    pub hardware: bool,
    /// Whether any stage re-encoded the bytes.
    pub transformed: bool,
}

impl PageImage {
    /// Wraps a single encoded image.
    #[must_use]
    pub fn single(bytes: Bytes) -> Self {
        Self::split(vec![bytes])
    }

    /// Wraps a page the source delivered in several vertical parts.
    #[must_use]
    pub fn split(parts: Vec<Bytes>) -> Self {
        Self {
            parts,
            dimensions: None,
            decoder: DecoderKind::Static,
            hardware: false,
            transformed: false,
        }
    }

    /// Bytes of the first (after merging, the only) part.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Empty`] when there are no parts.
    pub fn bytes(&self) -> Result<&Bytes, DecodeError> {
        self.parts.first().ok_or(DecodeError::Empty)
    }

    /// Consumes the page and returns its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Empty`] when there are no parts.
    pub fn into_bytes(self) -> Result<Bytes, DecodeError> {
        self.parts.into_iter().next().ok_or(DecodeError::Empty)
    }

    /// MIME type sniffed from the byte signature.
    #[must_use]
    pub fn mime_type(&self) -> &'static str {
        self.parts
            .first()
            .and_then(|bytes| infer::get(bytes))
            .map_or(DEFAULT_IMAGE_MIME, |kind| kind.mime_type())
    }

    /// Returns cached dimensions or probes them from the header.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Image`] when the header cannot be read.
    pub fn probe_dimensions(&mut self, stage: &'static str) -> Result<(u32, u32), DecodeError> {
        if let Some(dimensions) = self.dimensions {
            return Ok(dimensions);
        }
        let dimensions = ImageReader::new(Cursor::new(self.bytes()?.as_ref()))
            .with_guessed_format()
            .map_err(|e| DecodeError::image(stage, image::ImageError::IoError(e)))?
            .into_dimensions()
            .map_err(|e| DecodeError::image(stage, e))?;
        self.dimensions = Some(dimensions);
        Ok(dimensions)
    }
}

/// One step of the pipeline.
pub trait DecodeStage: Send + Sync + fmt::Debug {
    /// Stage name for logging.
    fn name(&self) -> &'static str;

    /// Transforms the page or rejects it.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the stage cannot process the page.
    fn apply(&self, page: PageImage) -> Result<PageImage, DecodeError>;
}

/// Pipeline settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Trim uniform-colour margins.
    pub crop_borders: bool,
    /// Capabilities of the display device.
    pub device: DeviceProfile,
}

/// Ordered chain of [`DecodeStage`]s.
#[derive(Debug)]
pub struct DecodePipeline {
    stages: Vec<Box<dyn DecodeStage>>,
}

impl DecodePipeline {
    /// Builds a pipeline from explicit stages.
    #[must_use]
    pub fn new(stages: Vec<Box<dyn DecodeStage>>) -> Self {
        Self { stages }
    }

    /// Builds the standard pipeline for `options`.
    #[must_use]
    pub fn standard(options: DecodeOptions) -> Self {
        let mut stages: Vec<Box<dyn DecodeStage>> = vec![Box::new(MergeStage)];
        if options.crop_borders {
            stages.push(Box::new(CropBorderStage::default()));
        }
        stages.push(Box::new(HardwareEligibilityStage::new(options.device)));
        stages.push(Box::new(AnimatedDetectionStage));
        Self::new(stages)
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Runs every stage in order.
    ///
    /// # Errors
    ///
    /// Returns the first stage error.
    #[instrument(level = "debug", skip_all, fields(parts = page.parts.len()))]
    pub fn run(&self, mut page: PageImage) -> Result<PageImage, DecodeError> {
        for stage in &self.stages {
            page = stage.apply(page)?;
            debug!(stage = stage.name(), transformed = page.transformed, "stage done");
        }
        Ok(page)
    }
}

/// Encodes a decoded image as PNG.
fn encode_png(stage: &'static str, image: &DynamicImage) -> Result<Bytes, DecodeError> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| DecodeError::image(stage, e))?;
    Ok(Bytes::from(buf))
}
