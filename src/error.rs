//! Failure taxonomy for detection sessions.
//!
//! Plumbing code (backends, sources, sinks) returns `anyhow::Result`; the
//! orchestration layer classifies failures into `VigilError` so callers can
//! tell "nothing detected" apart from "detector unavailable", and so batch
//! failures can name the stage that broke.

use serde::Serialize;
use std::fmt;

use crate::detect::ModelCapability;

/// Processing stage a failure is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Open,
    Detect,
    Write,
    Convert,
    Alert,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Input => "input",
            Stage::Open => "open",
            Stage::Detect => "detect",
            Stage::Write => "write",
            Stage::Convert => "convert",
            Stage::Alert => "alert",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// A file or capture device could not be opened. Terminal for the session.
    #[error("unreadable source {source_name}: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// One frame could not be read or decoded. Recoverable.
    #[error("frame unavailable: {0}")]
    TransientFrameFault(String),

    /// A model capability failed to load; its detection path is disabled.
    #[error("{model} model unavailable: {reason}")]
    ModelUnavailable {
        model: ModelCapability,
        reason: String,
    },

    /// A loaded model failed on a specific call.
    #[error("{model} detection failed: {reason}")]
    DetectionFault {
        model: ModelCapability,
        reason: String,
    },

    /// Alert gateway or transcoder failure.
    #[error("{channel} failed: {reason}")]
    TransportFault {
        channel: &'static str,
        reason: String,
    },

    /// The annotated output could not be written.
    #[error("output sink failed: {0}")]
    SinkFault(String),

    /// Rejected request input (bad file type, oversized upload, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl VigilError {
    pub fn source_unavailable(source_name: impl Into<String>, err: impl fmt::Display) -> Self {
        VigilError::SourceUnavailable {
            source_name: source_name.into(),
            reason: format!("{err:#}"),
        }
    }

    pub fn detection(model: ModelCapability, err: impl fmt::Display) -> Self {
        VigilError::DetectionFault {
            model,
            reason: format!("{err:#}"),
        }
    }

    pub fn transport(channel: &'static str, err: impl fmt::Display) -> Self {
        VigilError::TransportFault {
            channel,
            reason: format!("{err:#}"),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            VigilError::SourceUnavailable { .. } => Stage::Open,
            VigilError::TransientFrameFault(_) => Stage::Open,
            VigilError::ModelUnavailable { .. } => Stage::Detect,
            VigilError::DetectionFault { .. } => Stage::Detect,
            VigilError::TransportFault { channel, .. } if *channel == "transcoder" => {
                Stage::Convert
            }
            VigilError::TransportFault { .. } => Stage::Alert,
            VigilError::SinkFault(_) => Stage::Write,
            VigilError::InvalidInput(_) => Stage::Input,
        }
    }

    /// Faults confined to a single frame; a live session survives them.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            VigilError::TransientFrameFault(_) | VigilError::DetectionFault { .. }
        )
    }
}
