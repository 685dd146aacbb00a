//! Base64 image transport and response bodies.

use std::io::Cursor;

use anyhow::Result;
use base64::{prelude::BASE64_STANDARD, Engine};
use flue_core::ValidationError;
use image::DynamicImage;
use serde::Serialize;

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

#[derive(Serialize, Debug)]
pub struct ImageArrayResponse {
    pub images: Vec<String>,
}

#[derive(Serialize, Debug)]
pub struct ImageResponse {
    pub image: String,
}

/// Decodes a base64 PNG/JPEG, with or without a `data:` URL prefix.
pub fn decode_image(data: &str) -> Result<DynamicImage, ValidationError> {
    let payload = data.split_once(";base64,").map_or(data, |(_, payload)| payload);
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|_| ValidationError::new("image is not valid base64"))?;
    image::load_from_memory(&bytes)
        .map_err(|e| ValidationError::new(format!("could not decode image: {e}")))
}

/// Encodes an image as a PNG data URL.
pub fn encode_image(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(format!("{PNG_DATA_URL_PREFIX}{}", BASE64_STANDARD.encode(&bytes)))
}
