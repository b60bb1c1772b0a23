//! Animated-format detection by byte signature.

use std::io::Cursor;

use image::AnimationDecoder;
use image::codecs::gif::GifDecoder;
use tracing::debug;

use super::{DecodeError, DecodeStage, DecoderKind, PageImage};

const PNG_SIGNATURE_LEN: usize = 8;
const WEBP_VP8X_FLAGS_OFFSET: usize = 20;
const WEBP_ANIMATION_FLAG: u8 = 0x02;

/// Returns whether `bytes` hold an animated GIF, animated WebP or APNG.
#[must_use]
pub fn is_animated(bytes: &[u8]) -> bool {
    if infer::image::is_gif(bytes) {
        gif_has_multiple_frames(bytes)
    } else if infer::image::is_webp(bytes) {
        webp_has_animation_flag(bytes)
    } else if infer::image::is_png(bytes) {
        png_has_animation_control(bytes)
    } else {
        false
    }
}

fn gif_has_multiple_frames(bytes: &[u8]) -> bool {
    let Ok(decoder) = GifDecoder::new(Cursor::new(bytes)) else {
        return false;
    };
    decoder.into_frames().take(2).filter(Result::is_ok).count() > 1
}

fn webp_has_animation_flag(bytes: &[u8]) -> bool {
    bytes.get(12..16) == Some(b"VP8X".as_slice())
        && bytes
            .get(WEBP_VP8X_FLAGS_OFFSET)
            .is_some_and(|flags| flags & WEBP_ANIMATION_FLAG != 0)
}

/// Walks PNG chunks until `acTL` (animated) or `IDAT` (static) shows up.
fn png_has_animation_control(bytes: &[u8]) -> bool {
    let mut offset = PNG_SIGNATURE_LEN;
    while let Some(header) = bytes.get(offset..offset + 8) {
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        match &header[4..8] {
            b"acTL" => return true,
            b"IDAT" | b"IEND" => return false,
            _ => {}
        }
        // length + type + data + crc
        offset = match offset.checked_add(12 + len) {
            Some(next) => next,
            None => return false,
        };
    }
    false
}

/// Routes animated pages to the animation-capable decoder.
#[derive(Debug, Default)]
pub struct AnimatedDetectionStage;

impl DecodeStage for AnimatedDetectionStage {
    fn name(&self) -> &'static str {
        "animated-detection"
    }

    fn apply(&self, mut page: PageImage) -> Result<PageImage, DecodeError> {
        let animated = is_animated(page.bytes()?);
        page.decoder = if animated {
            DecoderKind::Animated
        } else {
            DecoderKind::Static
        };
        debug!(animated, "detected decoder route");
        Ok(page)
    }
}
