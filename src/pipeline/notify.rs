//! Messages exchanged with a live client over the WebSocket control channel.
//!
//! Both directions use `{"event": <name>, "data": <payload>}` envelopes.

use serde::{Deserialize, Serialize};

use crate::detect::{DetectionBox, FrameAssessment};

/// Status word used by control commands and their replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Active,
    Inactive,
    Error,
}

/// Client to server.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    CameraControl(ControlStatus),
    DetectionControl(ControlStatus),
    /// Browser-captured frame as a JPEG data URL.
    VideoFrame { frame: String },
}

/// Server to client.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Notification {
    ConnectionStatus { status: String },
    CameraStatus(ControlStatus),
    DetectionStatus(ControlStatus),
    DetectionData(DetectionSummary),
    VideoFrame {
        frame: String,
        detection: FrameDetection,
        frame_num: u64,
    },
    VideoFrameProcessed { frame: String },
    FrameError { error: String },
    DetectionError { error: String },
}

impl Notification {
    pub fn connected() -> Self {
        Notification::ConnectionStatus {
            status: "connected".to_string(),
        }
    }

    /// Event name as sent on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            Notification::ConnectionStatus { .. } => "connection_status",
            Notification::CameraStatus(_) => "camera_status",
            Notification::DetectionStatus(_) => "detection_status",
            Notification::DetectionData(_) => "detection_data",
            Notification::VideoFrame { .. } => "video_frame",
            Notification::VideoFrameProcessed { .. } => "video_frame_processed",
            Notification::FrameError { .. } => "frame_error",
            Notification::DetectionError { .. } => "detection_error",
        }
    }
}

/// Per-tick detection report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub violence_detected: bool,
    pub weapons_detected: bool,
    pub violence_confidence: f32,
    pub weapon_confidence: f32,
    pub boxes: Vec<DetectionBox>,
    pub frame_index: u64,
    /// Local wall-clock time, RFC 3339.
    pub timestamp: String,
}

impl DetectionSummary {
    pub fn from_assessment(assessment: &FrameAssessment) -> Self {
        Self {
            violence_detected: assessment.violence_detected(),
            weapons_detected: assessment.weapons_detected(),
            violence_confidence: assessment.violence.confidence,
            weapon_confidence: assessment.weapon_confidence(),
            boxes: assessment.weapons.clone(),
            frame_index: assessment.frame_index,
            timestamp: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// Detection flags attached to an outgoing camera frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameDetection {
    pub violence_detected: bool,
    pub weapons_detected: bool,
    pub boxes: Vec<DetectionBox>,
}

impl From<&FrameAssessment> for FrameDetection {
    fn from(assessment: &FrameAssessment) -> Self {
        Self {
            violence_detected: assessment.violence_detected(),
            weapons_detected: assessment.weapons_detected(),
            boxes: assessment.weapons.clone(),
        }
    }
}
