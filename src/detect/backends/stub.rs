//! Scripted backends for tests and demos.
//!
//! Both stubs replay a queue of scripted outputs and fall back to a constant
//! once the queue is drained. They can be built directly or from a
//! `stub://` model path:
//!
//! - `stub://violence?probs=0.9,0.1&frames=10&edge=224`
//! - `stub://weapons?boxes=10,10,50,50,0.8,1;0,0,5,5,0.3,2`
//! - `stub://unavailable` always fails to load

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::detect::backend::{ObjectDetector, SequenceClassifier};
use crate::detect::result::RawDetection;
use crate::frame::{PixelOrder, PreprocessedFrame, DEFAULT_CLASSIFIER_EDGE, DEFAULT_SEQUENCE_LENGTH};

/// One scripted reply. `Err` carries the message the call fails with.
pub type Scripted<T> = std::result::Result<T, String>;

pub struct StubClassifier {
    script: Mutex<VecDeque<Scripted<Vec<f32>>>>,
    fallback: Vec<f32>,
    sequence_len: usize,
    edge: u32,
    calls: AtomicUsize,
}

impl StubClassifier {
    /// Always answers `probs`.
    pub fn constant(probs: Vec<f32>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: probs,
            sequence_len: DEFAULT_SEQUENCE_LENGTH,
            edge: DEFAULT_CLASSIFIER_EDGE,
            calls: AtomicUsize::new(0),
        }
    }

    /// Replays `script` in order, then answers `fallback`.
    pub fn scripted(script: Vec<Scripted<Vec<f32>>>, fallback: Vec<f32>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::constant(fallback)
        }
    }

    pub fn with_sequence_len(mut self, sequence_len: usize) -> Self {
        self.sequence_len = sequence_len;
        self
    }

    pub fn with_edge(mut self, edge: u32) -> Self {
        self.edge = edge;
        self
    }

    /// Number of `predict` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let mut stub = Self::constant(vec![0.1, 0.9]);
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "probs" => stub.fallback = parse_floats(&value)?,
                "frames" => {
                    stub.sequence_len = value.parse().context("invalid stub frames")?;
                }
                "edge" => stub.edge = value.parse().context("invalid stub edge")?,
                other => return Err(anyhow!("unknown stub classifier option '{}'", other)),
            }
        }
        Ok(stub)
    }
}

impl SequenceClassifier for StubClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn sequence_len(&self) -> usize {
        self.sequence_len
    }

    fn input_edge(&self) -> u32 {
        self.edge
    }

    fn predict(&self, window: &[&PreprocessedFrame]) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if window.len() != self.sequence_len {
            return Err(anyhow!(
                "expected {} frames, received {}",
                self.sequence_len,
                window.len()
            ));
        }
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("stub script lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(probs)) => Ok(probs),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Ok(self.fallback.clone()),
        }
    }
}

pub struct StubDetector {
    script: Mutex<VecDeque<Scripted<Vec<RawDetection>>>>,
    fallback: Vec<RawDetection>,
    order: PixelOrder,
    calls: AtomicUsize,
}

impl StubDetector {
    pub fn constant(detections: Vec<RawDetection>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: detections,
            order: PixelOrder::Rgb,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::constant(Vec::new())
    }

    pub fn scripted(
        script: Vec<Scripted<Vec<RawDetection>>>,
        fallback: Vec<RawDetection>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::constant(fallback)
        }
    }

    pub fn with_input_order(mut self, order: PixelOrder) -> Self {
        self.order = order;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let mut stub = Self::empty();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "boxes" => {
                    stub.fallback = value
                        .split(';')
                        .filter(|s| !s.is_empty())
                        .map(parse_box)
                        .collect::<Result<_>>()?;
                }
                other => return Err(anyhow!("unknown stub detector option '{}'", other)),
            }
        }
        Ok(stub)
    }
}

impl ObjectDetector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_order(&self) -> PixelOrder {
        self.order
    }

    fn infer(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if pixels.len() != (width as usize) * (height as usize) * 3 {
            return Err(anyhow!("pixel buffer does not match {}x{}", width, height));
        }
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("stub script lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(detections)) => Ok(detections),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Ok(self.fallback.clone()),
        }
    }
}

fn parse_floats(raw: &str) -> Result<Vec<f32>> {
    raw.split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .with_context(|| format!("invalid number '{}'", v))
        })
        .collect()
}

fn parse_box(raw: &str) -> Result<RawDetection> {
    let values = parse_floats(raw)?;
    if values.len() != 6 {
        return Err(anyhow!(
            "stub box needs x1,y1,x2,y2,confidence,class; got '{}'",
            raw
        ));
    }
    Ok(RawDetection {
        x1: values[0],
        y1: values[1],
        x2: values[2],
        y2: values[3],
        confidence: values[4],
        class_id: values[5] as u32,
    })
}
