//! Offline processing of one finite source.
//!
//! `Opening → Running → Draining → Closed`, or `Failed` from any state. The
//! source is released on every path out of `run`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::alert::{Alert, ThreatKind};
use crate::annotate::Annotator;
use crate::detect::{DetectionEvent, DetectionFusion, DetectionRecord, EventKind};
use crate::error::VigilError;
use crate::ingest::{FrameSource, StreamInfo};
use crate::sink::{FrameSink, SinkSummary};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchState {
    Opening,
    Running,
    Draining,
    Closed,
    Failed,
}

/// What a closed batch produced.
#[derive(Clone, Debug)]
pub struct BatchReport {
    /// Every event in presentation order.
    pub events: Vec<DetectionEvent>,
    pub frames_processed: u64,
    pub stream: StreamInfo,
    pub sink: SinkSummary,
    /// The stop flag ended the run before end of stream.
    pub stopped_early: bool,
    /// A mid-stream read error that ended the run with partial results.
    pub read_fault: Option<String>,
}

impl BatchReport {
    pub fn records(&self) -> Vec<DetectionRecord> {
        self.events.iter().map(DetectionRecord::from).collect()
    }

    pub fn violence_detected(&self) -> bool {
        self.events.iter().any(|e| e.kind() == EventKind::Violence)
    }

    pub fn weapons_detected(&self) -> bool {
        self.events.iter().any(|e| e.kind() == EventKind::Weapon)
    }

    /// One alert summarizing the run: violence outranks weapons, confidence
    /// is the highest over all events. `None` when nothing was detected.
    pub fn alert(&self) -> Option<Alert> {
        let kind = if self.violence_detected() {
            ThreatKind::Violence
        } else if self.weapons_detected() {
            ThreatKind::Weapon
        } else {
            return None;
        };
        let confidence = self
            .events
            .iter()
            .map(DetectionEvent::confidence)
            .fold(0.0, f32::max);
        Some(Alert::new(kind, confidence))
    }
}

/// Sink errors keep their own stage when they carry one (an encoder fails
/// at `convert`); anything else is a write failure.
fn sink_fault(err: anyhow::Error) -> VigilError {
    match err.downcast::<VigilError>() {
        Ok(typed) => typed,
        Err(other) => VigilError::SinkFault(format!("{other:#}")),
    }
}

type ProgressFn<'a> = Box<dyn FnMut(u64, Option<u64>) + Send + 'a>;

/// Drives fusion, annotation and the sink over one source.
pub struct BatchProcessor<'a> {
    fusion: DetectionFusion,
    annotator: &'a Annotator,
    stop: Option<Arc<AtomicBool>>,
    progress: Option<ProgressFn<'a>>,
    state: BatchState,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(fusion: DetectionFusion, annotator: &'a Annotator) -> Self {
        Self {
            fusion,
            annotator,
            stop: None,
            progress: None,
            state: BatchState::Opening,
        }
    }

    /// Checked at every frame boundary; when set the run drains early.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Called after each frame with (frames processed, frames expected).
    pub fn with_progress(mut self, progress: impl FnMut(u64, Option<u64>) + Send + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Process `source` to completion, writing annotated frames to the sink
    /// `make_sink` builds from the opened stream.
    pub fn run<F>(&mut self, source: &mut dyn FrameSource, make_sink: F) -> Result<BatchReport, VigilError>
    where
        F: FnOnce(&StreamInfo) -> Result<Box<dyn FrameSink>>,
    {
        let result = self.drive(source, make_sink);
        source.release();
        match &result {
            Ok(report) => {
                self.transition(BatchState::Closed);
                log::info!(
                    "batch {} closed: {} frames, {} events",
                    source.describe(),
                    report.frames_processed,
                    report.events.len()
                );
            }
            Err(err) => {
                self.transition(BatchState::Failed);
                log::error!("batch {} failed at {}: {}", source.describe(), err.stage(), err);
            }
        }
        result
    }

    fn drive<F>(&mut self, source: &mut dyn FrameSource, make_sink: F) -> Result<BatchReport, VigilError>
    where
        F: FnOnce(&StreamInfo) -> Result<Box<dyn FrameSink>>,
    {
        self.transition(BatchState::Opening);
        let stream = source
            .open()
            .map_err(|e| VigilError::source_unavailable(source.describe(), e))?;
        let mut sink = make_sink(&stream).map_err(sink_fault)?;

        self.transition(BatchState::Running);
        let mut events = Vec::new();
        let mut frames_processed = 0u64;
        let mut stopped_early = false;
        let mut read_fault = None;

        loop {
            if self.stop.as_ref().is_some_and(|s| s.load(Ordering::SeqCst)) {
                log::info!("stop requested after {} frames", frames_processed);
                stopped_early = true;
                break;
            }
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    log::warn!(
                        "read failed after {} frames, keeping partial results: {:#}",
                        frames_processed,
                        err
                    );
                    read_fault = Some(format!("{err:#}"));
                    break;
                }
            };

            let assessment = self.fusion.evaluate(&frame, Some(frame.timestamp))?;
            let frame_events = assessment.events();
            let annotated = self
                .annotator
                .annotate(&frame, &frame_events)
                .map_err(|e| VigilError::SinkFault(format!("annotate frame {}: {e:#}", frame.index)))?;
            sink.write(&annotated).map_err(sink_fault)?;

            events.extend(frame_events);
            frames_processed += 1;
            if let Some(progress) = self.progress.as_mut() {
                progress(frames_processed, stream.frame_count);
            }
        }

        self.transition(BatchState::Draining);
        let sink_summary = sink.finish().map_err(sink_fault)?;

        Ok(BatchReport {
            events,
            frames_processed,
            stream,
            sink: sink_summary,
            stopped_early,
            read_fault,
        })
    }

    fn transition(&mut self, next: BatchState) {
        if self.state != next {
            log::debug!("batch state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
