mod backend;
pub mod backends;
mod fusion;
pub mod postprocess;
mod registry;
mod result;

pub use backend::{ModelCapability, ObjectDetector, SequenceClassifier};
pub use backends::{StubClassifier, StubDetector};
pub use fusion::{filter_weapons, judge_violence, DetectionFusion, FusionSettings};
pub use registry::{ModelSet, ModelSettings};
pub use result::{
    DetectionBox, DetectionEvent, DetectionRecord, EventKind, FrameAssessment, RawDetection,
    ViolenceVerdict,
};
