//! Annotated-frame writers.
//!
//! The batch loop writes every annotated frame to a `FrameSink`. The
//! encoder in `transcode` is the one that produces files; `NullSink` keeps
//! only the count.

use std::path::PathBuf;

use anyhow::Result;

use crate::frame::Frame;
use crate::ingest::StreamInfo;

/// What a finished sink produced.
#[derive(Clone, Debug, PartialEq)]
pub struct SinkSummary {
    pub frames_written: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// File holding the output, when the sink writes one.
    pub path: Option<PathBuf>,
}

pub trait FrameSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. Further writes are an error.
    fn finish(&mut self) -> Result<SinkSummary>;
}

/// Counts frames and discards them.
pub struct NullSink {
    info: StreamInfo,
    frames_written: u64,
}

impl NullSink {
    pub fn new(info: StreamInfo) -> Self {
        Self {
            info,
            frames_written: 0,
        }
    }
}

impl FrameSink for NullSink {
    fn write(&mut self, _frame: &Frame) -> Result<()> {
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<SinkSummary> {
        Ok(SinkSummary {
            frames_written: self.frames_written,
            width: self.info.width,
            height: self.info.height,
            fps: self.info.effective_fps(),
            path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelOrder;

    #[test]
    fn null_sink_counts_frames() -> Result<()> {
        let info = StreamInfo {
            width: 2,
            height: 1,
            fps: 0.0,
            frame_count: None,
        };
        let mut sink = NullSink::new(info);
        let frame = Frame::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelOrder::Bgr, 0.0, 0)?;
        sink.write(&frame)?;
        sink.write(&frame)?;
        let summary = sink.finish()?;
        assert_eq!(summary.frames_written, 2);
        assert_eq!(summary.fps, info.effective_fps());
        assert!(summary.path.is_none());
        Ok(())
    }
}
