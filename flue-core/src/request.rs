//! Request shapes for the streaming endpoints and their validation.

use image::{imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};

use crate::{
    alpha_mask, combine_masks, luminance_mask, GenerationMode, UpscalerKind, ValidationError,
    MAX_UPSCALE_DIMENSION,
};

/// Short side (grow) or long side (shrink) of generated images.
pub const BASE_SIZE: usize = 512;
const SIZE_STEP: usize = 64;

fn default_count() -> usize {
    1
}

fn default_steps() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_aspect_ratio() -> f64 {
    1.0
}

fn default_strength() -> f64 {
    0.75
}

fn default_gobig_strength() -> f64 {
    0.3
}

fn default_overlap() -> u32 {
    64
}

/// Fields shared by every batched generation endpoint.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_count")]
    pub num_variants: usize,
    #[serde(default = "default_count")]
    pub batch_size: usize,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default)]
    pub guidance_scale: f64,
    #[serde(default = "default_true")]
    pub try_smaller_batch_on_fail: bool,
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.num_variants == 0 {
            return Err(ValidationError::new("num_variants must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ValidationError::new("batch_size must be at least 1"));
        }
        if self.num_inference_steps == 0 {
            return Err(ValidationError::new("num_inference_steps must be at least 1"));
        }
        if !self.guidance_scale.is_finite() {
            return Err(ValidationError::new("guidance_scale must be a finite number"));
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// The short side is [`BASE_SIZE`] and the long side grows with the ratio.
    #[default]
    Grow,
    /// The long side is [`BASE_SIZE`] and the short side shrinks with the ratio.
    Shrink,
}

/// Output `(width, height)` for an aspect ratio (width / height), in multiples of 64.
///
/// Ratios whose long side would exceed [`MAX_UPSCALE_DIMENSION`] are rejected.
pub fn size_from_aspect_ratio(
    aspect_ratio: f64,
    scaling_mode: ScalingMode,
) -> Result<(usize, usize), ValidationError> {
    validate_aspect_ratio(aspect_ratio)?;
    let base = BASE_SIZE as f64;
    let (width, height) = match (scaling_mode, aspect_ratio >= 1.0) {
        (ScalingMode::Grow, true) => (base * aspect_ratio, base),
        (ScalingMode::Grow, false) => (base, base / aspect_ratio),
        (ScalingMode::Shrink, true) => (base, base / aspect_ratio),
        (ScalingMode::Shrink, false) => (base * aspect_ratio, base),
    };
    let (width, height) = (round_to_step(width), round_to_step(height));
    if width > MAX_UPSCALE_DIMENSION as usize || height > MAX_UPSCALE_DIMENSION as usize {
        return Err(ValidationError::new(format!(
            "aspect_ratio is too extreme, a side would exceed {MAX_UPSCALE_DIMENSION} pixels"
        )));
    }
    Ok((width, height))
}

/// Saturates instead of overflowing; callers bound the result.
fn round_to_step(value: f64) -> usize {
    let steps = (value / SIZE_STEP as f64).round().clamp(1.0, (usize::MAX / SIZE_STEP) as f64);
    (steps as usize).saturating_mul(SIZE_STEP)
}

fn validate_aspect_ratio(aspect_ratio: f64) -> Result<(), ValidationError> {
    if aspect_ratio.is_finite() && aspect_ratio > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("aspect_ratio must be a positive number"))
    }
}

fn validate_strength(strength: f64) -> Result<(), ValidationError> {
    if strength > 0.0 && strength <= 1.0 {
        Ok(())
    } else {
        Err(ValidationError::new("strength must be in (0, 1]"))
    }
}

/// Resizes a client image to the generation size implied by its own aspect ratio.
fn fit_source(source: &DynamicImage, scaling_mode: ScalingMode) -> Result<DynamicImage, ValidationError> {
    if source.width() == 0 || source.height() == 0 {
        return Err(ValidationError::new("source image is empty"));
    }
    let aspect_ratio = source.width() as f64 / source.height() as f64;
    let (width, height) = size_from_aspect_ratio(aspect_ratio, scaling_mode)?;
    if (source.width(), source.height()) == (width as u32, height as u32) {
        return Ok(source.clone());
    }
    Ok(source.resize_exact(width as u32, height as u32, FilterType::Lanczos3))
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TextToImageRequest {
    #[serde(flatten)]
    pub generation: GenerationRequest,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: f64,
    #[serde(default)]
    pub scaling_mode: ScalingMode,
}

impl TextToImageRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.generation.validate()?;
        size_from_aspect_ratio(self.aspect_ratio, self.scaling_mode).map(|_| ())
    }

    pub fn mode(&self) -> Result<GenerationMode, ValidationError> {
        let (width, height) = size_from_aspect_ratio(self.aspect_ratio, self.scaling_mode)?;
        Ok(GenerationMode::TextToImage { width, height })
    }
}

/// `source_image` carries a base64 PNG/JPEG, optionally as a data URL.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ImageToImageRequest {
    #[serde(flatten)]
    pub generation: GenerationRequest,
    pub source_image: String,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default)]
    pub scaling_mode: ScalingMode,
}

impl ImageToImageRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.generation.validate()?;
        validate_strength(self.strength)
    }

    pub fn mode(&self, source: DynamicImage) -> Result<GenerationMode, ValidationError> {
        let source = fit_source(&source, self.scaling_mode)?;
        let mask = alpha_mask(&source);
        Ok(GenerationMode::ImageToImage {
            source,
            strength: self.strength,
            mask,
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct InpaintingRequest {
    #[serde(flatten)]
    pub generation: GenerationRequest,
    pub source_image: String,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default)]
    pub scaling_mode: ScalingMode,
}

impl InpaintingRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.generation.validate()?;
        validate_strength(self.strength)
    }

    pub fn mode(
        &self,
        source: DynamicImage,
        mask: Option<DynamicImage>,
    ) -> Result<GenerationMode, ValidationError> {
        let source = fit_source(&source, self.scaling_mode)?;
        let explicit = mask.and_then(|mask| luminance_mask(&mask, source.width(), source.height()));
        let mask = combine_masks(explicit, alpha_mask(&source));
        Ok(GenerationMode::Inpainting {
            source,
            strength: self.strength,
            mask,
        })
    }
}

/// Large upscale: upscale, then refine overlapping tiles with image-to-image.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GoBigRequest {
    pub prompt: String,
    #[serde(default)]
    pub seed: Option<u64>,
    pub image: String,
    pub target_width: u32,
    pub target_height: u32,
    #[serde(default)]
    pub maximize: bool,
    #[serde(default = "default_overlap")]
    pub overlap: u32,
    #[serde(default)]
    pub upscaler: UpscalerKind,
    #[serde(default = "default_gobig_strength")]
    pub strength: f64,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default)]
    pub guidance_scale: f64,
}

impl GoBigRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_strength(self.strength)?;
        if self.num_inference_steps == 0 {
            return Err(ValidationError::new("num_inference_steps must be at least 1"));
        }
        if !self.guidance_scale.is_finite() {
            return Err(ValidationError::new("guidance_scale must be a finite number"));
        }
        if self.target_width < 64 || self.target_height < 64 {
            return Err(ValidationError::new("target size must be at least 64x64"));
        }
        if self.overlap as usize >= crate::gobig::TILE_SIZE / 2 {
            return Err(ValidationError::new(format!(
                "overlap must be smaller than {}",
                crate::gobig::TILE_SIZE / 2
            )));
        }
        Ok(())
    }
}

/// Synchronous upscale without diffusion.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct UpscaleRequest {
    pub image: String,
    pub target_width: u32,
    pub target_height: u32,
    #[serde(default)]
    pub maximize: bool,
    #[serde(default)]
    pub upscaler: UpscalerKind,
}
