//! Large upscale: resample past the model's native size, then refine
//! overlapping tiles with image-to-image and feather them back together.

use std::sync::Arc;

use image::{imageops, DynamicImage, Rgb, RgbImage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    upscale_to, GenerationMode, GoBigRequest, Invocation, PipelineError, ProgressAggregator,
    ProgressSender, ScheduleError, SharedModel, ValidationError,
};

/// Largest tile side handed to the model.
pub const TILE_SIZE: usize = 512;
const TILE_STEP: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Start offsets covering `length` with windows of `tile` overlapping by at least `overlap`.
fn tile_starts(length: u32, tile: u32, overlap: u32) -> Vec<u32> {
    if length <= tile {
        return vec![0];
    }
    let stride = (tile - overlap).max(1);
    let mut starts = Vec::new();
    let mut pos = 0;
    while pos + tile < length {
        starts.push(pos);
        pos += stride;
    }
    starts.push(length - tile);
    starts
}

fn tile_side(length: u32) -> u32 {
    let side = length.min(TILE_SIZE as u32);
    if side < TILE_STEP {
        side
    } else {
        side / TILE_STEP * TILE_STEP
    }
}

/// Tiles of an image of `width` × `height`, row by row.
pub fn tile_grid(width: u32, height: u32, overlap: u32) -> Vec<Tile> {
    let (tile_width, tile_height) = (tile_side(width), tile_side(height));
    let xs = tile_starts(width, tile_width, overlap.min(tile_width / 2));
    let ys = tile_starts(height, tile_height, overlap.min(tile_height / 2));
    ys.iter()
        .flat_map(|&y| {
            xs.iter().map(move |&x| Tile {
                x,
                y,
                width: tile_width,
                height: tile_height,
            })
        })
        .collect()
}

/// Upscales the client image to the requested size.
pub fn prepare(request: &GoBigRequest, input: DynamicImage) -> Result<DynamicImage, ValidationError> {
    upscale_to(
        input,
        request.target_width,
        request.target_height,
        request.maximize,
        request.upscaler,
    )
}

/// Refines every tile of `upscaled` and blends the results.
pub async fn refine(
    model: &SharedModel,
    request: &GoBigRequest,
    upscaled: &DynamicImage,
    progress: &ProgressSender,
    cancel: &CancellationToken,
) -> Result<DynamicImage, ScheduleError> {
    let source = upscaled.to_rgb8();
    let tiles = tile_grid(source.width(), source.height(), request.overlap);
    info!(
        width = source.width(),
        height = source.height(),
        tiles = tiles.len(),
        "Refining upscaled image"
    );

    let mut canvas = Canvas::new(source.width(), source.height());
    let mut aggregator =
        ProgressAggregator::new(tiles.len(), request.num_inference_steps, progress.clone());

    for (index, tile) in tiles.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ScheduleError::Cancelled);
        }
        let crop = imageops::crop_imm(&source, tile.x, tile.y, tile.width, tile.height).to_image();
        let invocation = Invocation {
            prompt: request.prompt.clone(),
            num_images: 1,
            num_inference_steps: request.num_inference_steps,
            guidance_scale: request.guidance_scale,
            seed: request.seed.map(|seed| seed.wrapping_add(index as u64)),
            mode: Arc::new(GenerationMode::ImageToImage {
                source: DynamicImage::ImageRgb8(crop),
                strength: request.strength,
                mask: None,
            }),
            cancel: cancel.clone(),
        };

        let refined = match model.run(invocation, aggregator.reporter()).await {
            Ok(mut images) => images.remove(0).to_rgb8(),
            Err(PipelineError::ResourceExhausted) => {
                return Err(ScheduleError::InfeasibleConfiguration)
            }
            Err(PipelineError::Cancelled) => return Err(ScheduleError::Cancelled),
            Err(PipelineError::Failed(e)) => return Err(ScheduleError::Pipeline(e)),
        };
        aggregator.finish_invocation();
        debug!(index, x = tile.x, y = tile.y, "Tile refined");

        let refined = if refined.dimensions() != (tile.width, tile.height) {
            imageops::resize(&refined, tile.width, tile.height, imageops::FilterType::Lanczos3)
        } else {
            refined
        };
        canvas.blend(&refined, tile, request.overlap);
    }

    Ok(DynamicImage::ImageRgb8(canvas.finish()))
}

/// Weighted accumulation buffer for overlapping tiles.
struct Canvas {
    width: u32,
    height: u32,
    sums: Vec<[f32; 3]>,
    weights: Vec<f32>,
}

impl Canvas {
    fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            sums: vec![[0.0; 3]; len],
            weights: vec![0.0; len],
        }
    }

    /// Weights ramp up across the overlap on every edge shared with a neighbour.
    fn edge_weight(pos: u32, start: u32, len: u32, total: u32, overlap: u32) -> f32 {
        let ramp = (overlap + 1) as f32;
        let leading = if start > 0 { (pos + 1) as f32 / ramp } else { 1.0 };
        let trailing = if start + len < total {
            (len - pos) as f32 / ramp
        } else {
            1.0
        };
        leading.min(trailing).min(1.0)
    }

    fn blend(&mut self, image: &RgbImage, tile: &Tile, overlap: u32) {
        for (x, y, pixel) in image.enumerate_pixels() {
            let weight = Self::edge_weight(x, tile.x, tile.width, self.width, overlap)
                .min(Self::edge_weight(y, tile.y, tile.height, self.height, overlap));
            let index = (tile.y + y) as usize * self.width as usize + (tile.x + x) as usize;
            for (sum, value) in self.sums[index].iter_mut().zip(pixel.0) {
                *sum += weight * value as f32;
            }
            self.weights[index] += weight;
        }
    }

    fn finish(self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let index = y as usize * self.width as usize + x as usize;
            let weight = self.weights[index].max(f32::EPSILON);
            let [r, g, b] = self.sums[index].map(|sum| (sum / weight).round().clamp(0.0, 255.0) as u8);
            Rgb([r, g, b])
        })
    }
}
