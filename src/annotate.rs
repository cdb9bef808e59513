//! Detection overlays for visual review.
//!
//! `Annotator::annotate` never touches its input: it draws on a copy and
//! returns that copy in the input's channel order.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detect::{DetectionBox, DetectionEvent};
use crate::frame::{Frame, PixelOrder};

const VIOLENCE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const WEAPON_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const VIOLENCE_BORDER: u32 = 5;
const WEAPON_BORDER: u32 = 3;
const VIOLENCE_LABEL_AT: (i32, i32) = (50, 50);
const VIOLENCE_SCALE: f32 = 36.0;
const WEAPON_SCALE: f32 = 18.0;

pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// Annotator without a font: labels are marked with a filled tab.
    pub fn new() -> Self {
        Self { font: None }
    }

    /// Load a TTF/OTF font for label text.
    pub fn with_font_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("read font file {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .with_context(|| format!("parse font file {}", path.display()))?;
        Ok(Self { font: Some(font) })
    }

    /// Font when `path` is set and loads, plain annotator otherwise.
    pub fn from_optional_font(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::with_font_file(path).unwrap_or_else(|err| {
                log::warn!("label font unavailable, drawing tabs only: {:#}", err);
                Self::new()
            }),
            None => Self::new(),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn annotate(&self, frame: &Frame, events: &[DetectionEvent]) -> Result<Frame> {
        if events.is_empty() {
            return Ok(frame.clone());
        }
        let mut canvas = frame.to_rgb_image()?;
        for event in events {
            match event {
                DetectionEvent::Violence { confidence, .. } => {
                    self.draw_violence(&mut canvas, *confidence)
                }
                DetectionEvent::Weapon { detection, .. } => self.draw_weapon(&mut canvas, detection),
            }
        }
        let annotated = Frame::from_rgb_image(canvas, frame.timestamp, frame.index);
        Ok(match frame.order {
            PixelOrder::Rgb => annotated,
            order => annotated.to_order(order),
        })
    }

    fn draw_violence(&self, canvas: &mut RgbImage, confidence: f32) {
        let (width, height) = canvas.dimensions();
        for inset in 0..VIOLENCE_BORDER {
            if width <= inset * 2 || height <= inset * 2 {
                break;
            }
            let rect = Rect::at(inset as i32, inset as i32)
                .of_size(width - inset * 2, height - inset * 2);
            draw_hollow_rect_mut(canvas, rect, VIOLENCE_COLOR);
        }
        let label = format!("VIOLENCE DETECTED ({:.2}%)", confidence * 100.0);
        let (x, y) = VIOLENCE_LABEL_AT;
        self.draw_label(canvas, &label, x, y - VIOLENCE_SCALE as i32, VIOLENCE_SCALE, VIOLENCE_COLOR);
    }

    fn draw_weapon(&self, canvas: &mut RgbImage, detection: &DetectionBox) {
        let (x1, y1) = (detection.x1.min(detection.x2), detection.y1.min(detection.y2));
        let w = detection.x1.abs_diff(detection.x2);
        let h = detection.y1.abs_diff(detection.y2);
        for inset in 0..WEAPON_BORDER {
            let grow = inset as i32;
            let rect = Rect::at(x1 - grow, y1 - grow).of_size(w + inset * 2 + 1, h + inset * 2 + 1);
            draw_hollow_rect_mut(canvas, rect, WEAPON_COLOR);
        }
        self.draw_label(canvas, "WEAPON", x1, y1 - 10 - WEAPON_SCALE as i32, WEAPON_SCALE, WEAPON_COLOR);
    }

    fn draw_label(&self, canvas: &mut RgbImage, text: &str, x: i32, y: i32, scale: f32, color: Rgb<u8>) {
        match &self.font {
            Some(font) => draw_text_mut(canvas, color, x, y, PxScale::from(scale), font, text),
            None => {
                let tab_w = (text.len() as f32 * scale * 0.25).max(4.0) as u32;
                let tab_h = (scale * 0.4).max(2.0) as u32;
                draw_filled_rect_mut(canvas, Rect::at(x, y.max(0)).of_size(tab_w, tab_h), color);
            }
        }
    }
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(order: PixelOrder) -> Frame {
        Frame::new(vec![60u8; 120 * 90 * 3], 120, 90, order, 0.5, 3).unwrap()
    }

    fn violence(confidence: f32) -> DetectionEvent {
        DetectionEvent::Violence {
            confidence,
            frame_index: 3,
            timestamp: 0.5,
        }
    }

    #[test]
    fn no_events_returns_identical_copy() {
        let frame = gray(PixelOrder::Bgr);
        let out = Annotator::new().annotate(&frame, &[]).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn violence_draws_red_border_on_a_copy() {
        let frame = gray(PixelOrder::Rgb);
        let out = Annotator::new().annotate(&frame, &[violence(0.91)]).unwrap();
        assert_eq!(&out.pixels()[..3], &[255, 0, 0]);
        let inner = ((10 * 120 + 100) * 3) as usize;
        assert_eq!(&out.pixels()[inner..inner + 3], &[60, 60, 60]);
        assert!(frame.pixels().iter().all(|&p| p == 60));
    }

    #[test]
    fn output_keeps_channel_order() {
        let frame = gray(PixelOrder::Bgr);
        let out = Annotator::new().annotate(&frame, &[violence(0.8)]).unwrap();
        assert_eq!(out.order, PixelOrder::Bgr);
        assert_eq!(&out.pixels()[..3], &[0, 0, 255]);
    }

    #[test]
    fn weapon_box_outline_is_drawn() {
        let frame = gray(PixelOrder::Rgb);
        let event = DetectionEvent::Weapon {
            detection: DetectionBox {
                x1: 40,
                y1: 40,
                x2: 80,
                y2: 70,
                confidence: 0.7,
                class_id: 1,
                timestamp: 0.5,
            },
            frame_index: 3,
            timestamp: 0.5,
        };
        let out = Annotator::new().annotate(&frame, &[event]).unwrap();
        let corner = ((40 * 120 + 40) * 3) as usize;
        assert_eq!(&out.pixels()[corner..corner + 3], &[0, 0, 255]);
        let centre = ((55 * 120 + 60) * 3) as usize;
        assert_eq!(&out.pixels()[centre..centre + 3], &[60, 60, 60]);
    }

    #[test]
    fn missing_font_file_falls_back() {
        let annotator = Annotator::from_optional_font(Some(Path::new("/nonexistent/font.ttf")));
        assert!(!annotator.has_font());
    }
}
