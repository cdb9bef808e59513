//! Per-frame fusion of the violence and weapon paths.
//!
//! One `DetectionFusion` belongs to exactly one session: it owns that
//! session's `SequenceWindow`, while the models themselves are shared.

use anyhow::Result;

use crate::detect::backend::ModelCapability;
use crate::detect::registry::ModelSet;
use crate::detect::result::{DetectionBox, FrameAssessment, RawDetection, ViolenceVerdict};
use crate::error::VigilError;
use crate::frame::{Frame, PreprocessedFrame, SequenceWindow, DEFAULT_SEQUENCE_LENGTH};

/// Decision thresholds for fusion.
#[derive(Clone, Debug, PartialEq)]
pub struct FusionSettings {
    /// Violence is asserted only above this probability.
    pub violence_threshold: f32,
    /// Index of the "fight" class in the classifier output.
    pub fight_class: usize,
    /// Weapon boxes must score strictly above this.
    pub weapon_threshold: f32,
    /// Detector class id that means "weapon".
    pub weapon_class: u32,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            violence_threshold: 0.70,
            fight_class: 0,
            weapon_threshold: 0.50,
            weapon_class: 1,
        }
    }
}

/// Apply the violence rule to a class distribution.
///
/// Violence holds iff the argmax is the fight class and its probability is
/// strictly above `threshold`. The argmax probability is always returned as
/// the confidence. Fewer than two classes or any non-finite value is an error.
pub fn judge_violence(probs: &[f32], fight_class: usize, threshold: f32) -> Result<ViolenceVerdict> {
    if probs.len() < 2 {
        anyhow::bail!("expected a class distribution, got {} values", probs.len());
    }
    if probs.iter().any(|p| !p.is_finite()) {
        anyhow::bail!("classifier output contains non-finite values");
    }
    let (argmax, confidence) = probs
        .iter()
        .copied()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });
    Ok(ViolenceVerdict {
        detected: argmax == fight_class && confidence > threshold,
        confidence,
    })
}

/// Keep only weapon-class boxes strictly above the threshold.
pub fn filter_weapons(
    raw: &[RawDetection],
    settings: &FusionSettings,
    timestamp: f64,
) -> Vec<DetectionBox> {
    raw.iter()
        .filter(|d| d.class_id == settings.weapon_class && d.confidence > settings.weapon_threshold)
        .map(|d| DetectionBox::from_raw(d, timestamp))
        .collect()
}

pub struct DetectionFusion {
    models: ModelSet,
    settings: FusionSettings,
    window: SequenceWindow,
}

impl DetectionFusion {
    pub fn new(models: ModelSet, settings: FusionSettings) -> Result<Self> {
        let capacity = models
            .violence()
            .map(|m| m.sequence_len())
            .unwrap_or(DEFAULT_SEQUENCE_LENGTH);
        Ok(Self {
            window: SequenceWindow::new(capacity)?,
            models,
            settings,
        })
    }

    pub fn settings(&self) -> &FusionSettings {
        &self.settings
    }

    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    pub fn window(&self) -> &SequenceWindow {
        &self.window
    }

    /// Evaluate one frame with both detection paths.
    ///
    /// `timestamp` stamps the weapon boxes; `None` uses wall-clock epoch
    /// seconds. A model fault is returned as `DetectionFault`, never folded
    /// into an empty result.
    pub fn evaluate(
        &mut self,
        frame: &Frame,
        timestamp: Option<f64>,
    ) -> Result<FrameAssessment, VigilError> {
        let stamp = timestamp.unwrap_or_else(crate::epoch_seconds);
        let violence = self.violence_path(frame)?;
        let weapons = self.weapon_path(frame, stamp)?;
        Ok(FrameAssessment {
            frame_index: frame.index,
            timestamp: frame.timestamp,
            violence,
            weapons,
        })
    }

    fn violence_path(&mut self, frame: &Frame) -> Result<ViolenceVerdict, VigilError> {
        let Some(model) = self.models.violence() else {
            return Ok(ViolenceVerdict::default());
        };
        let capability = ModelCapability::ViolenceClassifier;
        let pre = PreprocessedFrame::from_frame(frame, model.input_edge(), model.input_order())
            .map_err(|e| VigilError::detection(capability, e))?;
        self.window.push(pre);
        let Some(snapshot) = self.window.snapshot() else {
            return Ok(ViolenceVerdict::default());
        };
        let probs = model
            .predict(&snapshot)
            .map_err(|e| VigilError::detection(capability, e))?;
        let verdict = judge_violence(
            &probs,
            self.settings.fight_class,
            self.settings.violence_threshold,
        )
        .map_err(|e| VigilError::detection(capability, e))?;
        log::debug!(
            "frame {}: violence={} confidence={:.3}",
            frame.index,
            verdict.detected,
            verdict.confidence
        );
        Ok(verdict)
    }

    fn weapon_path(&self, frame: &Frame, stamp: f64) -> Result<Vec<DetectionBox>, VigilError> {
        let Some(model) = self.models.weapons() else {
            return Ok(Vec::new());
        };
        let pixels = frame.pixels_in(model.input_order());
        let raw = model
            .infer(&pixels, frame.width, frame.height)
            .map_err(|e| VigilError::detection(ModelCapability::WeaponDetector, e))?;
        let kept = filter_weapons(&raw, &self.settings, stamp);
        if !kept.is_empty() {
            log::debug!("frame {}: {} weapon box(es) kept", frame.index, kept.len());
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::detect::backends::{StubClassifier, StubDetector};
    use crate::frame::PixelOrder;

    fn frame(index: u64) -> Frame {
        Frame::new(vec![128u8; 8 * 8 * 3], 8, 8, PixelOrder::Bgr, index as f64 * 0.1, index).unwrap()
    }

    fn raw(confidence: f32, class_id: u32) -> RawDetection {
        RawDetection {
            x1: 1.7,
            y1: 2.2,
            x2: 5.9,
            y2: 6.1,
            confidence,
            class_id,
        }
    }

    fn fusion_with(classifier: StubClassifier, detector: StubDetector) -> DetectionFusion {
        let models = ModelSet::new()
            .with_violence(Arc::new(classifier.with_edge(4)))
            .with_weapons(Arc::new(detector));
        DetectionFusion::new(models, FusionSettings::default()).unwrap()
    }

    #[test]
    fn violence_rule_matches_thresholds() {
        assert!(judge_violence(&[0.9, 0.1], 0, 0.7).unwrap().detected);
        let near = judge_violence(&[0.6, 0.4], 0, 0.7).unwrap();
        assert!(!near.detected);
        assert_eq!(near.confidence, 0.6);
        let calm = judge_violence(&[0.2, 0.8], 0, 0.7).unwrap();
        assert!(!calm.detected);
        assert_eq!(calm.confidence, 0.8);
        assert!(!judge_violence(&[0.7, 0.3], 0, 0.7).unwrap().detected);
    }

    #[test]
    fn malformed_distribution_is_a_fault() {
        assert!(judge_violence(&[1.0], 0, 0.7).is_err());
        assert!(judge_violence(&[f32::NAN, 0.1], 0, 0.7).is_err());
        assert!(judge_violence(&[], 0, 0.7).is_err());
    }

    #[test]
    fn weapon_filter_is_strict() {
        let settings = FusionSettings::default();
        let kept = filter_weapons(
            &[raw(0.49, 1), raw(0.50, 1), raw(0.95, 0), raw(0.51, 1)],
            &settings,
            3.0,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.51);
        assert_eq!(kept[0].coordinates(), [1, 2, 5, 6]);
        assert_eq!(kept[0].timestamp, 3.0);
    }

    #[test]
    fn cold_window_reports_no_violence() {
        let mut fusion = fusion_with(StubClassifier::constant(vec![0.99, 0.01]), StubDetector::empty());
        for i in 0..9 {
            let out = fusion.evaluate(&frame(i), Some(0.0)).unwrap();
            assert_eq!(out.violence, ViolenceVerdict::default());
        }
        let out = fusion.evaluate(&frame(9), Some(0.0)).unwrap();
        assert!(out.violence.detected);
    }

    #[test]
    fn classifier_runs_once_per_ready_frame() {
        let classifier = Arc::new(StubClassifier::constant(vec![0.1, 0.9]).with_sequence_len(3).with_edge(4));
        let models = ModelSet::new().with_violence(classifier.clone());
        let mut fusion = DetectionFusion::new(models, FusionSettings::default()).unwrap();
        for i in 0..5 {
            fusion.evaluate(&frame(i), None).unwrap();
        }
        assert_eq!(classifier.calls(), 3);
        assert_eq!(fusion.window().len(), 3);
    }

    #[test]
    fn detector_failure_is_a_fault_not_empty() {
        let mut fusion = fusion_with(
            StubClassifier::constant(vec![0.1, 0.9]),
            StubDetector::scripted(vec![Err("tensor shape".into())], vec![]),
        );
        let err = fusion.evaluate(&frame(0), Some(0.0)).unwrap_err();
        assert!(matches!(
            err,
            VigilError::DetectionFault {
                model: ModelCapability::WeaponDetector,
                ..
            }
        ));
        assert!(fusion.evaluate(&frame(1), Some(0.0)).is_ok());
    }

    #[test]
    fn missing_timestamp_uses_wall_clock() {
        let mut fusion = fusion_with(
            StubClassifier::constant(vec![0.1, 0.9]),
            StubDetector::constant(vec![raw(0.9, 1)]),
        );
        let before = crate::epoch_seconds();
        let out = fusion.evaluate(&frame(0), None).unwrap();
        assert!(out.weapons[0].timestamp >= before);
        assert!(out.is_dangerous());
    }

    #[test]
    fn disabled_paths_yield_quiet_results() {
        let mut fusion = DetectionFusion::new(ModelSet::new(), FusionSettings::default()).unwrap();
        for i in 0..12 {
            let out = fusion.evaluate(&frame(i), Some(0.0)).unwrap();
            assert!(!out.is_dangerous());
            assert_eq!(out.violence.confidence, 0.0);
        }
    }
}
