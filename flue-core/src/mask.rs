//! Inpainting masks. White (255) marks pixels the model may regenerate.

use image::{imageops, DynamicImage, GrayImage, Luma};

/// Mask derived from transparency: fully transparent pixels become 255.
///
/// Returns `None` for images without an alpha channel or when every pixel is opaque.
pub fn alpha_mask(source: &DynamicImage) -> Option<GrayImage> {
    if !source.color().has_alpha() {
        return None;
    }
    let rgba = source.to_rgba8();
    let mask = GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        Luma([255 - rgba.get_pixel(x, y).0[3]])
    });
    non_empty(mask)
}

/// Explicit mask from a client image, resized to `width` × `height`.
pub fn luminance_mask(mask: &DynamicImage, width: u32, height: u32) -> Option<GrayImage> {
    let mut luma = mask.to_luma8();
    if luma.dimensions() != (width, height) {
        luma = imageops::resize(&luma, width, height, imageops::FilterType::Triangle);
    }
    non_empty(luma)
}

/// Element-wise maximum of two optional masks of the same size.
pub fn combine_masks(a: Option<GrayImage>, b: Option<GrayImage>) -> Option<GrayImage> {
    match (a, b) {
        (Some(mut a), Some(b)) => {
            for (dst, src) in a.pixels_mut().zip(b.pixels()) {
                dst.0[0] = dst.0[0].max(src.0[0]);
            }
            Some(a)
        }
        (a, b) => a.or(b),
    }
}

fn non_empty(mask: GrayImage) -> Option<GrayImage> {
    mask.pixels().any(|p| p.0[0] > 0).then_some(mask)
}
