//! Frame types and the temporal window.
//!
//! - `Frame`: decoded H×W×3 pixels with a channel-order tag, a presentation
//!   timestamp and a sequence index. Immutable once produced.
//! - `PreprocessedFrame`: square, normalized `f32` tensor for the sequence classifier.
//! - `SequenceWindow`: bounded FIFO of preprocessed frames. Owned by one session.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::collections::VecDeque;

/// Default number of frames the violence classifier consumes per prediction.
pub const DEFAULT_SEQUENCE_LENGTH: usize = 10;

/// Default edge length of the classifier's square input.
pub const DEFAULT_CLASSIFIER_EDGE: u32 = 224;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Interleaved channel order of a packed 3-channel buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// One decoded video frame.
///
/// The pixel buffer is private so a frame cannot be mutated after it has been
/// handed to the loop; consumers that need to draw take a copy.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub order: PixelOrder,
    /// Presentation time in seconds, monotonic within a session.
    pub timestamp: f64,
    /// Position of the frame in its source.
    pub index: u64,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        order: PixelOrder,
        timestamp: f64,
        index: u64,
    ) -> Result<Self> {
        let expected = packed_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            order,
            timestamp,
            index,
        })
    }

    /// Wrap an RGB image, keeping its geometry.
    pub fn from_rgb_image(image: RgbImage, timestamp: f64, index: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            order: PixelOrder::Rgb,
            timestamp,
            index,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Pixels in the requested channel order. Copies only when a swap is needed.
    pub fn pixels_in(&self, order: PixelOrder) -> std::borrow::Cow<'_, [u8]> {
        if order == self.order {
            std::borrow::Cow::Borrowed(&self.data)
        } else {
            std::borrow::Cow::Owned(swap_red_blue(&self.data))
        }
    }

    /// Copy of this frame with its channels rearranged into `order`.
    pub fn to_order(&self, order: PixelOrder) -> Frame {
        Frame {
            data: self.pixels_in(order).into_owned(),
            width: self.width,
            height: self.height,
            order,
            timestamp: self.timestamp,
            index: self.index,
        }
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        let rgb = self.pixels_in(PixelOrder::Rgb).into_owned();
        RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Mean over every channel sample, 0..=255.
    pub fn mean_brightness(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|&p| p as u64).sum();
        sum as f64 / self.data.len() as f64
    }
}

fn packed_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn swap_red_blue(pixels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len());
    for px in pixels.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    out
}

// ----------------------------------------------------------------------------
// PreprocessedFrame
// ----------------------------------------------------------------------------

/// Square HWC tensor with values in [0, 1].
#[derive(Clone, Debug, PartialEq)]
pub struct PreprocessedFrame {
    edge: u32,
    order: PixelOrder,
    values: Vec<f32>,
}

impl PreprocessedFrame {
    /// Resize `frame` to `edge`×`edge`, convert to `order` and scale to [0, 1].
    pub fn from_frame(frame: &Frame, edge: u32, order: PixelOrder) -> Result<Self> {
        if edge == 0 {
            return Err(anyhow!("preprocess edge must be > 0"));
        }
        let source = frame.to_rgb_image()?;
        let resized = if source.dimensions() == (edge, edge) {
            source
        } else {
            imageops::resize(&source, edge, edge, FilterType::Triangle)
        };

        let mut values = Vec::with_capacity((edge * edge * 3) as usize);
        for px in resized.pixels() {
            let [r, g, b] = px.0;
            let ordered = match order {
                PixelOrder::Rgb => [r, g, b],
                PixelOrder::Bgr => [b, g, r],
            };
            values.extend(ordered.iter().map(|&c| c as f32 / 255.0));
        }

        Ok(Self {
            edge,
            order,
            values,
        })
    }

    pub fn edge(&self) -> u32 {
        self.edge
    }

    pub fn order(&self) -> PixelOrder {
        self.order
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

// ----------------------------------------------------------------------------
// SequenceWindow
// ----------------------------------------------------------------------------

/// Bounded FIFO feeding the sequence classifier.
///
/// Size never exceeds the capacity; a push into a full window evicts exactly
/// the oldest entry. The window is ready exactly when it is full.
#[derive(Debug)]
pub struct SequenceWindow {
    frames: VecDeque<PreprocessedFrame>,
    capacity: usize,
}

impl SequenceWindow {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("sequence window capacity must be > 0"));
        }
        Ok(Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Insert a frame, evicting the oldest if full. Returns readiness.
    pub fn push(&mut self, frame: PreprocessedFrame) -> bool {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        self.is_ready()
    }

    pub fn is_ready(&self) -> bool {
        self.frames.len() == self.capacity
    }

    /// Oldest-first view of a full window. `None` until ready.
    pub fn snapshot(&self) -> Option<Vec<&PreprocessedFrame>> {
        if !self.is_ready() {
            return None;
        }
        Some(self.frames.iter().collect())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
