//! YOLO-style detector output decoding.
//!
//! Kept free of any inference runtime so the box math can be tested without
//! a model file.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::detect::result::RawDetection;

/// Letterbox padding value used by YOLO exporters.
const PAD: u8 = 114;

/// Resize `image` into a `size`×`size` canvas, keeping aspect ratio and
/// padding right/bottom. Returns the canvas and the scale applied.
pub fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, f32) {
    let (w, h) = image.dimensions();
    let ratio = (size as f32 / w as f32).min(size as f32 / h as f32);
    let new_w = ((w as f32 * ratio).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * ratio).round() as u32).clamp(1, size);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD, PAD, PAD]));
    imageops::replace(&mut canvas, &resized, 0, 0);
    (canvas, ratio)
}

/// Decode a `(4 + classes) × anchors` row-major prediction block.
///
/// Each anchor column holds `cx, cy, w, h` followed by per-class scores.
/// Boxes are divided by `ratio` to land in source-frame pixels and clipped
/// to the source bounds. Candidates scoring below `min_confidence` are skipped.
pub fn decode_predictions(
    preds: &[f32],
    channels: usize,
    anchors: usize,
    ratio: f32,
    source: (u32, u32),
    min_confidence: f32,
) -> Result<Vec<RawDetection>> {
    if channels <= 4 {
        return Err(anyhow!("prediction block has {} channels, need > 4", channels));
    }
    if preds.len() != channels * anchors {
        return Err(anyhow!(
            "prediction block length {} does not match {}x{}",
            preds.len(),
            channels,
            anchors
        ));
    }
    if ratio <= 0.0 || !ratio.is_finite() {
        return Err(anyhow!("invalid letterbox ratio {}", ratio));
    }

    let at = |c: usize, a: usize| preds[c * anchors + a];
    let (max_x, max_y) = (source.0 as f32, source.1 as f32);
    let mut out = Vec::new();
    for a in 0..anchors {
        let (class_id, confidence) = (4..channels)
            .map(|c| (c - 4, at(c, a)))
            .fold((0usize, f32::NEG_INFINITY), |best, x| {
                if x.1 > best.1 {
                    x
                } else {
                    best
                }
            });
        if !confidence.is_finite() || confidence < min_confidence {
            continue;
        }
        let cx = at(0, a) / ratio;
        let cy = at(1, a) / ratio;
        let w = at(2, a) / ratio;
        let h = at(3, a) / ratio;
        out.push(RawDetection {
            x1: (cx - w / 2.0).clamp(0.0, max_x),
            y1: (cy - h / 2.0).clamp(0.0, max_y),
            x2: (cx + w / 2.0).clamp(0.0, max_x),
            y2: (cy + h / 2.0).clamp(0.0, max_y),
            confidence,
            class_id: class_id as u32,
        });
    }
    Ok(out)
}

/// Greedy per-class non-maximum suppression, highest confidence first.
pub fn non_max_suppression(detections: &mut Vec<RawDetection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections.drain(..) {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }
    *detections = kept;
}
