#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{ObjectDetector, SequenceClassifier};
use crate::detect::postprocess::{decode_predictions, letterbox, non_max_suppression};
use crate::detect::result::RawDetection;
use crate::frame::{PixelOrder, PreprocessedFrame};

type Plan = TypedSimplePlan<TypedModel>;

/// Edge of the square detector input.
const DETECTOR_EDGE: u32 = 640;
/// Candidates below this never reach NMS; fusion applies the real threshold.
const DETECTOR_FLOOR: f32 = 0.25;
const NMS_IOU: f32 = 0.45;

/// Sequence classifier over an ONNX model taking `(1, N, E, E, 3)` input.
///
/// Loads a local model file only; no network I/O.
pub struct TractClassifier {
    model: Plan,
    sequence_len: usize,
    edge: u32,
}

impl TractClassifier {
    pub fn new<P: AsRef<Path>>(model_path: P, sequence_len: usize, edge: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                f32::fact([1, sequence_len, edge as usize, edge as usize, 3]).into(),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            sequence_len,
            edge,
        })
    }
}

impl SequenceClassifier for TractClassifier {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn sequence_len(&self) -> usize {
        self.sequence_len
    }

    fn input_edge(&self) -> u32 {
        self.edge
    }

    fn predict(&self, window: &[&PreprocessedFrame]) -> Result<Vec<f32>> {
        if window.len() != self.sequence_len {
            return Err(anyhow!(
                "expected {} frames, received {}",
                self.sequence_len,
                window.len()
            ));
        }
        let edge = self.edge as usize;
        let per_frame = edge * edge * 3;
        let mut data = Vec::with_capacity(per_frame * window.len());
        for frame in window {
            if frame.values().len() != per_frame {
                return Err(anyhow!("preprocessed frame does not match {}x{}", edge, edge));
            }
            data.extend_from_slice(frame.values());
        }
        let input = tract_ndarray::Array5::from_shape_vec((1, self.sequence_len, edge, edge, 3), data)
            .context("failed to shape classifier input")?
            .into_tensor();
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let probs = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        Ok(probs.iter().copied().collect())
    }
}

/// YOLOv8-style object detector over an ONNX model.
///
/// Input is letterboxed to 640×640 RGB; output `(1, 4 + classes, anchors)`
/// is decoded back to source pixels with per-class NMS.
pub struct TractDetector {
    model: Plan,
}

impl TractDetector {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let edge = DETECTOR_EDGE as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, edge, edge]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        Ok(Self { model })
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<(Tensor, f32)> {
        let image = RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("expected {}x{} RGB bytes, received {}", width, height, pixels.len()))?;
        let (canvas, ratio) = letterbox(&image, DETECTOR_EDGE);
        let edge = DETECTOR_EDGE as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, edge, edge), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
        });
        Ok((input.into_tensor(), ratio))
    }
}

impl ObjectDetector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_order(&self) -> PixelOrder {
        PixelOrder::Rgb
    }

    fn infer(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>> {
        let (input, ratio) = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let preds: Vec<f32> = view.iter().copied().collect();
        let mut found = decode_predictions(
            &preds,
            shape[1],
            shape[2],
            ratio,
            (width, height),
            DETECTOR_FLOOR,
        )?;
        non_max_suppression(&mut found, NMS_IOU);
        Ok(found)
    }
}
