use image::{imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ValidationError;

/// Largest edge, in pixels, an upscale target may request.
pub const MAX_UPSCALE_DIMENSION: u32 = 8192;

/// Resampler used for each 2× upscaling pass.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpscalerKind {
    #[default]
    Lanczos3,
    CatmullRom,
    Nearest,
}

impl UpscalerKind {
    fn filter(self) -> FilterType {
        match self {
            Self::Lanczos3 => FilterType::Lanczos3,
            Self::CatmullRom => FilterType::CatmullRom,
            Self::Nearest => FilterType::Nearest,
        }
    }

    /// Doubles both sides of `image`.
    pub fn upscale(self, image: &DynamicImage) -> DynamicImage {
        image.resize_exact(image.width() * 2, image.height() * 2, self.filter())
    }
}

fn too_large() -> ValidationError {
    ValidationError::new("Scaling factor or image is too large")
}

fn fits(side: u32) -> bool {
    side <= MAX_UPSCALE_DIMENSION
}

/// Upscales until `image` covers the target, then resizes to it exactly unless `maximize`.
///
/// Every intermediate pass, and so the result, stays within [`MAX_UPSCALE_DIMENSION`].
pub fn upscale_to(
    mut image: DynamicImage,
    target_width: u32,
    target_height: u32,
    maximize: bool,
    upscaler: UpscalerKind,
) -> Result<DynamicImage, ValidationError> {
    if target_width == 0
        || target_height == 0
        || !fits(target_width)
        || !fits(target_height)
        || image.width() == 0
        || image.height() == 0
        || !fits(image.width())
        || !fits(image.height())
    {
        return Err(too_large());
    }

    while image.width() < target_width || image.height() < target_height {
        if !fits(image.width() * 2) || !fits(image.height() * 2) {
            return Err(too_large());
        }
        image = upscaler.upscale(&image);
        debug!(width = image.width(), height = image.height(), "Upscaled pass");
    }

    if !maximize && (image.width() != target_width || image.height() != target_height) {
        image = image.resize_exact(target_width, target_height, upscaler.filter());
    }
    Ok(image)
}
