//! Vigilant Eye
//!
//! Streaming orchestrator for violence and weapon detection on video.
//!
//! # Architecture
//!
//! Every frame goes through the same contract, whether it comes from an
//! uploaded file or a live camera:
//!
//! 1. **Fusion**: the frame is pushed into the session's sequence window for
//!    the violence classifier and handed to the weapon detector.
//! 2. **Events**: asserted violence and kept weapon boxes become
//!    `DetectionEvent`s on the session's append-only list.
//! 3. **Annotation**: overlays are drawn on a copy of the frame.
//! 4. **Alerting**: a per-session cooldown gate decides whether to send an SMS.
//!
//! Model faults are reported, never folded into "nothing detected".
//!
//! # Module Structure
//!
//! - `frame`: frames, preprocessing and the sequence window
//! - `detect`: model capabilities, backends and fusion
//! - `ingest`: file, camera, browser and scripted frame sources
//! - `pipeline`: batch and live processing loops
//! - `annotate`, `sink`, `transcode`, `media`: output side
//! - `alert`: throttle, alert text and gateways
//! - `api`: HTTP and WebSocket surface of `vigild`

use std::time::{SystemTime, UNIX_EPOCH};

pub mod alert;
pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod media;
pub mod pipeline;
pub mod sink;
pub mod transcode;
pub mod ui;

pub use alert::{Alert, AlertDispatcher, AlertGateway, AlertThrottle, ThreatKind};
pub use annotate::Annotator;
pub use config::VigilConfig;
pub use detect::{
    DetectionBox, DetectionEvent, DetectionFusion, DetectionRecord, FrameAssessment,
    FusionSettings, ModelSet, ModelSettings,
};
pub use error::{Stage, VigilError};
pub use frame::{Frame, PixelOrder, SequenceWindow};
pub use ingest::{CameraConfig, CameraSource, CaptureGuard, FileSource, FrameSource, StreamInfo};
pub use pipeline::{BatchProcessor, BatchReport, LiveContext, LiveSession, Notification};

/// Wall-clock seconds since the Unix epoch.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
