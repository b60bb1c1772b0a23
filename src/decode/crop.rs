//! Trims uniform-colour margins around a page.

use image::{DynamicImage, Rgba, RgbaImage};
use tracing::debug;

use super::{DecodeError, DecodeStage, PageImage, encode_png, is_animated};

const STAGE: &str = "crop-borders";

/// Default per-channel difference still counted as border colour.
const DEFAULT_TOLERANCE: u8 = 24;

/// Crops margins whose pixels all match the top-left corner colour.
#[derive(Debug, Clone, Copy)]
pub struct CropBorderStage {
    tolerance: u8,
}

impl Default for CropBorderStage {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl CropBorderStage {
    /// Creates a stage with a custom colour tolerance.
    #[must_use]
    pub fn with_tolerance(tolerance: u8) -> Self {
        Self { tolerance }
    }

    fn matches(&self, pixel: &Rgba<u8>, border: &Rgba<u8>) -> bool {
        pixel
            .0
            .iter()
            .zip(border.0.iter())
            .all(|(a, b)| a.abs_diff(*b) <= self.tolerance)
    }

    fn row_is_border(&self, image: &RgbaImage, y: u32, border: &Rgba<u8>) -> bool {
        (0..image.width()).all(|x| self.matches(image.get_pixel(x, y), border))
    }

    fn column_is_border(
        &self,
        image: &RgbaImage,
        x: u32,
        mut rows: std::ops::Range<u32>,
        border: &Rgba<u8>,
    ) -> bool {
        rows.all(|y| self.matches(image.get_pixel(x, y), border))
    }

    /// Returns the content rectangle `(x, y, width, height)`, or `None` when
    /// there is nothing to trim or the whole image is border.
    fn content_bounds(&self, image: &RgbaImage) -> Option<(u32, u32, u32, u32)> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return None;
        }
        let border = *image.get_pixel(0, 0);

        let top = (0..height).find(|&y| !self.row_is_border(image, y, &border))?;
        let bottom = (top..height)
            .rev()
            .find(|&y| !self.row_is_border(image, y, &border))?;
        let rows = top..bottom + 1;
        let left = (0..width).find(|&x| !self.column_is_border(image, x, rows.clone(), &border))?;
        let right = (left..width)
            .rev()
            .find(|&x| !self.column_is_border(image, x, rows.clone(), &border))?;

        let bounds = (left, top, right - left + 1, bottom - top + 1);
        if bounds == (0, 0, width, height) {
            None
        } else {
            Some(bounds)
        }
    }
}

impl DecodeStage for CropBorderStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn apply(&self, mut page: PageImage) -> Result<PageImage, DecodeError> {
        let bytes = page.bytes()?;
        if is_animated(bytes) {
            return Ok(page);
        }

        let image = image::load_from_memory(bytes)
            .map_err(|e| DecodeError::image(STAGE, e))?
            .to_rgba8();
        let Some((x, y, width, height)) = self.content_bounds(&image) else {
            return Ok(page);
        };

        debug!(
            from = ?image.dimensions(),
            to = ?(width, height),
            "cropping uniform borders"
        );
        let cropped = DynamicImage::ImageRgba8(image).crop_imm(x, y, width, height);
        page.parts = vec![encode_png(STAGE, &cropped)?];
        page.dimensions = Some((width, height));
        page.transformed = true;
        Ok(page)
    }
}
