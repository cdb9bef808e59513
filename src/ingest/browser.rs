//! Frames pushed by a browser as base64 JPEG data URLs, and the JPEG
//! encoding used to send frames back.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;

use crate::frame::Frame;

/// JPEG quality for frames sent to clients.
pub const JPEG_QUALITY: u8 = 80;

/// Decode `data:image/jpeg;base64,...` (or bare base64) into a frame.
pub fn decode_data_url(data_url: &str, index: u64, timestamp: f64) -> Result<Frame> {
    let payload = match data_url.split_once(',') {
        Some((header, payload)) => {
            if !header.contains("base64") {
                return Err(anyhow!("data URL is not base64 encoded"));
            }
            payload
        }
        None => data_url,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .context("decode base64 frame payload")?;
    let image = image::load_from_memory(&bytes).context("decode jpeg")?;
    Ok(Frame::from_rgb_image(image.into_rgb8(), timestamp, index))
}

/// Encode a frame as JPEG and return it base64 encoded (no data-URL prefix).
pub fn encode_jpeg_base64(frame: &Frame) -> Result<String> {
    let rgb = frame.to_rgb_image()?;
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut bytes), JPEG_QUALITY)
        .encode_image(&rgb)
        .context("encode jpeg")?;
    Ok(STANDARD.encode(bytes))
}
