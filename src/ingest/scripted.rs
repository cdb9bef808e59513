//! Scripted frame source for tests and demos.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::{FrameSource, StreamInfo};
use crate::frame::Frame;

/// One step a `ScriptedSource` plays back.
#[derive(Clone, Debug)]
pub enum SourceStep {
    Frame(Frame),
    /// A read that fails with this message.
    Fault(String),
    /// A read that blocks for this long, then plays the next step.
    Stall(Duration),
    /// End of stream.
    End,
}

/// Replays a fixed list of steps. An exhausted script reports end of stream.
pub struct ScriptedSource {
    name: String,
    steps: VecDeque<SourceStep>,
    info: StreamInfo,
    fail_open: Option<String>,
    opened: bool,
    reads: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<SourceStep>) -> Self {
        let (width, height) = steps
            .iter()
            .find_map(|s| match s {
                SourceStep::Frame(f) => Some((f.width, f.height)),
                _ => None,
            })
            .unwrap_or((4, 4));
        Self {
            name: "scripted".to_string(),
            steps: steps.into(),
            info: StreamInfo {
                width,
                height,
                fps: 30.0,
                frame_count: None,
            },
            fail_open: None,
            opened: false,
            reads: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A source whose `open` fails with `reason`.
    pub fn unopenable(reason: impl Into<String>) -> Self {
        let mut source = Self::new(Vec::new());
        source.fail_open = Some(reason.into());
        source
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.info.fps = fps;
        self
    }

    /// Shared counter of `next_frame` calls.
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }

    /// Shared counter of `release` calls.
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        self.releases.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn open(&mut self) -> Result<StreamInfo> {
        if let Some(reason) = &self.fail_open {
            return Err(anyhow!("{}", reason));
        }
        self.opened = true;
        Ok(self.info)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        loop {
            match self.steps.pop_front() {
                Some(SourceStep::Frame(frame)) => return Ok(Some(frame)),
                Some(SourceStep::Fault(reason)) => return Err(anyhow!("{}", reason)),
                Some(SourceStep::Stall(pause)) => std::thread::sleep(pause),
                Some(SourceStep::End) | None => return Ok(None),
            }
        }
    }

    fn info(&self) -> Option<StreamInfo> {
        self.opened.then_some(self.info)
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.opened = false;
    }
}
