//! Frame ingestion sources.
//!
//! This module provides the sources a session can read from:
//! - Local video files (synthetic `stub://`, FFmpeg with feature `ingest-file-ffmpeg`)
//! - Capture devices (synthetic `stub://`, V4L2 with feature `ingest-v4l2`)
//! - Browser-pushed JPEG data URLs (`browser`)
//! - Scripted sources for tests (`scripted`)
//!
//! Sources decode in memory and hand each `Frame` to the session loop; they
//! never write frames to disk and never log pixel content.

pub mod browser;
pub mod camera;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod scripted;

use anyhow::Result;

use crate::frame::Frame;

pub use camera::{CameraConfig, CameraSource};
pub use file::FileSource;
pub use scripted::{ScriptedSource, SourceStep};

/// Geometry and rate of an opened stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Frame count when the container reports one.
    pub frame_count: Option<u64>,
}

/// Frame rate assumed when a source does not report one.
pub const FALLBACK_FPS: f64 = 30.0;

impl StreamInfo {
    /// Frame rate to encode with: the reported one, or `FALLBACK_FPS`.
    pub fn effective_fps(&self) -> f64 {
        if self.fps.is_finite() && self.fps > 0.0 {
            self.fps
        } else {
            FALLBACK_FPS
        }
    }
}

/// A lazily read sequence of decoded frames.
///
/// `next_frame` returns `Ok(None)` at end of stream and `Err` for a read or
/// decode failure. Callers decide whether a failure is worth a retry.
pub trait FrameSource: Send {
    /// Human-readable identity for logs (path or device, never pixels).
    fn describe(&self) -> String;

    /// Acquire the underlying file or device.
    fn open(&mut self) -> Result<StreamInfo>;

    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Info of the opened stream, `None` before `open`.
    fn info(&self) -> Option<StreamInfo>;

    /// Give the file or device back. Must be safe to call more than once.
    fn release(&mut self);
}

impl FrameSource for Box<dyn FrameSource> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn open(&mut self) -> Result<StreamInfo> {
        (**self).open()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn info(&self) -> Option<StreamInfo> {
        (**self).info()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Owns a capture handle and releases it exactly once: on `release` or on drop.
pub struct CaptureGuard {
    source: Option<Box<dyn FrameSource>>,
}

impl CaptureGuard {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    pub fn describe(&self) -> String {
        self.source
            .as_ref()
            .map(|s| s.describe())
            .unwrap_or_else(|| "released".to_string())
    }

    pub fn is_released(&self) -> bool {
        self.source.is_none()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.source.as_mut() {
            Some(source) => source.next_frame(),
            None => anyhow::bail!("capture handle already released"),
        }
    }

    pub fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            log::info!("releasing capture {}", source.describe());
            source.release();
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.release();
    }
}
