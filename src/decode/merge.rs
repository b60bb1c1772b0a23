//! Joins a page delivered in several vertical slices into one image.

use image::{DynamicImage, RgbaImage, imageops};
use tracing::debug;

use super::{DecodeError, DecodeStage, PageImage, encode_png, is_animated};

const STAGE: &str = "merge";

/// Largest merged canvas, in pixels (1 GiB of RGBA).
const MAX_MERGED_PIXELS: u64 = 1 << 28;

/// Stacks split parts top to bottom, centred horizontally.
#[derive(Debug, Default)]
pub struct MergeStage;

impl DecodeStage for MergeStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn apply(&self, mut page: PageImage) -> Result<PageImage, DecodeError> {
        match page.parts.len() {
            0 => return Err(DecodeError::Empty),
            1 => return Ok(page),
            _ => {}
        }
        if page.parts.iter().any(|part| is_animated(part)) {
            return Err(DecodeError::unsupported(
                STAGE,
                "animated parts cannot be merged",
            ));
        }

        let decoded = page
            .parts
            .iter()
            .map(|part| {
                image::load_from_memory(part)
                    .map(|image| image.to_rgba8())
                    .map_err(|e| DecodeError::image(STAGE, e))
            })
            .collect::<Result<Vec<RgbaImage>, _>>()?;

        let width = decoded.iter().map(RgbaImage::width).max().unwrap_or(0);
        let height = canvas_height(width, decoded.iter().map(RgbaImage::height))?;
        let mut canvas = RgbaImage::new(width, height);
        let mut y: i64 = 0;
        for part in &decoded {
            let x = i64::from((width - part.width()) / 2);
            imageops::overlay(&mut canvas, part, x, y);
            y += i64::from(part.height());
        }
        debug!(parts = decoded.len(), width, height, "merged split page");

        page.parts = vec![encode_png(STAGE, &DynamicImage::ImageRgba8(canvas))?];
        page.dimensions = Some((width, height));
        page.transformed = true;
        Ok(page)
    }
}

/// Total height of the stacked parts, refusing canvases that cannot be allocated.
fn canvas_height(width: u32, heights: impl IntoIterator<Item = u32>) -> Result<u32, DecodeError> {
    let height = heights
        .into_iter()
        .try_fold(0u32, u32::checked_add)
        .ok_or_else(|| DecodeError::unsupported(STAGE, "merged height overflows"))?;
    if u64::from(width) * u64::from(height) > MAX_MERGED_PIXELS {
        return Err(DecodeError::unsupported(
            STAGE,
            format!("merged page of {width}x{height} is too large"),
        ));
    }
    Ok(height)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bytes::Bytes;
    use image::Rgba;

    use super::*;
    use crate::decode::animated::tests::animated_gif_bytes;
    use crate::decode::tests::png_bytes;

    #[test]
    fn test_single_part_passes_through() {
        let bytes = Bytes::from(png_bytes(&RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255]))));
        let page = MergeStage.apply(PageImage::single(bytes.clone())).unwrap();
        assert!(!page.transformed);
        assert_eq!(page.parts, vec![bytes]);
    }

    #[test]
    fn test_parts_stacked_vertically() {
        let top = png_bytes(&RgbaImage::from_pixel(4, 3, Rgba([255, 0, 0, 255])));
        let bottom = png_bytes(&RgbaImage::from_pixel(2, 5, Rgba([0, 255, 0, 255])));
        let page = PageImage::split(vec![Bytes::from(top), Bytes::from(bottom)]);

        let merged = MergeStage.apply(page).unwrap();
        assert!(merged.transformed);
        assert_eq!(merged.parts.len(), 1);
        assert_eq!(merged.dimensions, Some((4, 8)));

        let image = image::load_from_memory(&merged.parts[0]).unwrap().to_rgba8();
        assert_eq!(image.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(image.get_pixel(1, 7), &Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn test_canvas_height_sums_parts() {
        assert_eq!(canvas_height(10, [3, 5, 7]).unwrap(), 15);
    }

    #[test]
    fn test_canvas_height_overflow_is_rejected() {
        assert!(matches!(
            canvas_height(1, [u32::MAX, 1]),
            Err(DecodeError::Unsupported { stage: "merge", .. })
        ));
        assert!(matches!(
            canvas_height(1 << 16, [1 << 13, 1 << 13]),
            Err(DecodeError::Unsupported { stage: "merge", .. })
        ));
    }

    #[test]
    fn test_animated_parts_rejected() {
        let page = PageImage::split(vec![
            Bytes::from(animated_gif_bytes()),
            Bytes::from(animated_gif_bytes()),
        ]);
        assert!(matches!(
            MergeStage.apply(page),
            Err(DecodeError::Unsupported { stage: "merge", .. })
        ));
    }
}
