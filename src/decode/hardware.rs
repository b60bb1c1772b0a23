//! Decides whether a decoded bitmap may use hardware (GPU) memory.

use tracing::debug;

use super::{DecodeError, DecodeStage, PageImage, is_animated};

/// Common GPU texture limit used when the device doesn't report one.
pub const DEFAULT_MAX_TEXTURE_SIZE: u32 = 4096;

/// Capabilities of the display device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Largest texture edge the GPU accepts.
    pub max_texture_size: u32,
    /// Whether the platform supports hardware-backed bitmaps at all.
    pub hardware_bitmaps: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            max_texture_size: DEFAULT_MAX_TEXTURE_SIZE,
            hardware_bitmaps: true,
        }
    }
}

/// Marks pages that fit in a single GPU texture as hardware eligible.
#[derive(Debug, Clone, Copy)]
pub struct HardwareEligibilityStage {
    device: DeviceProfile,
}

impl HardwareEligibilityStage {
    /// Creates the stage for `device`.
    #[must_use]
    pub fn new(device: DeviceProfile) -> Self {
        Self { device }
    }
}

impl DecodeStage for HardwareEligibilityStage {
    fn name(&self) -> &'static str {
        "hardware-eligibility"
    }

    fn apply(&self, mut page: PageImage) -> Result<PageImage, DecodeError> {
        if !self.device.hardware_bitmaps || is_animated(page.bytes()?) {
            page.hardware = false;
            return Ok(page);
        }
        // An unreadable header isn't fatal here; the consumer's decoder reports it.
        page.hardware = match page.probe_dimensions(self.name()) {
            Ok((width, height)) => {
                width <= self.device.max_texture_size && height <= self.device.max_texture_size
            }
            Err(error) => {
                debug!(error = %error, "could not probe dimensions; using software bitmap");
                false
            }
        };
        Ok(page)
    }
}
