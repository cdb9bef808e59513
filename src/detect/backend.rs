use anyhow::Result;
use std::fmt;

use crate::detect::result::RawDetection;
use crate::frame::{PixelOrder, PreprocessedFrame};

/// Detection capabilities the orchestrator fuses.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelCapability {
    ViolenceClassifier,
    WeaponDetector,
}

impl fmt::Display for ModelCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelCapability::ViolenceClassifier => f.write_str("violence classifier"),
            ModelCapability::WeaponDetector => f.write_str("weapon detector"),
        }
    }
}

/// Temporal classifier over a fixed-length run of frames.
///
/// Implementations are constructed once at startup and shared between
/// sessions, so inference takes `&self`. Per-session state (the frame window)
/// lives in `DetectionFusion`, never in the model.
pub trait SequenceClassifier: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Number of frames one prediction consumes.
    fn sequence_len(&self) -> usize;

    /// Edge length of the square per-frame input.
    fn input_edge(&self) -> u32;

    /// Channel order the model was trained on.
    fn input_order(&self) -> PixelOrder {
        PixelOrder::Bgr
    }

    /// Class probabilities for the window, oldest frame first.
    fn predict(&self, window: &[&PreprocessedFrame]) -> Result<Vec<f32>>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-frame object detector.
///
/// Returns every candidate it finds; class and confidence filtering happens
/// in fusion so "nothing detected" stays distinguishable from a failed call.
pub trait ObjectDetector: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Channel order `infer` expects.
    fn input_order(&self) -> PixelOrder {
        PixelOrder::Rgb
    }

    /// Run detection on packed pixels. Box coordinates are source-frame pixels.
    ///
    /// Implementations must treat the pixel slice as read-only and ephemeral.
    fn infer(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
