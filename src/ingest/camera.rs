//! Capture device frame source.
//!
//! `CameraSource` opens a local capture device (e.g. `/dev/video0`), applies
//! the requested geometry and rate, discards a few warm-up frames, and then
//! yields frames stamped with seconds since open. `stub://` devices produce a
//! synthetic feed:
//!
//! `stub://camera?frames=100&brightness=120`
//!
//! `stub://absent` fails to open. Real devices need the `ingest-v4l2` feature.

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::{FrameSource, StreamInfo};
use crate::frame::{Frame, PixelOrder};

/// Configuration for a capture device.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraConfig {
    /// Device path (e.g. "/dev/video0") or a `stub://` feed.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frames read and dropped right after opening.
    pub warmup_frames: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            warmup_frames: 5,
        }
    }
}

/// Capture device frame source.
pub struct CameraSource {
    config: CameraConfig,
    backend: Option<CameraBackend>,
    opened_at: Option<Instant>,
    frame_count: u64,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "ingest-v4l2")]
    Device(device::DeviceCamera),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            backend: None,
            opened_at: None,
            frame_count: 0,
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    fn read_raw(&mut self) -> Result<Option<(Vec<u8>, u32, u32)>> {
        match self.backend.as_mut() {
            Some(CameraBackend::Synthetic(camera)) => Ok(camera.capture()),
            #[cfg(feature = "ingest-v4l2")]
            Some(CameraBackend::Device(camera)) => camera.capture().map(Some),
            None => Err(anyhow!("camera {} not opened", self.config.device)),
        }
    }
}

impl FrameSource for CameraSource {
    fn describe(&self) -> String {
        self.config.device.clone()
    }

    fn open(&mut self) -> Result<StreamInfo> {
        let backend = if self.config.device.starts_with("stub://") {
            CameraBackend::Synthetic(SyntheticCamera::open(&self.config)?)
        } else {
            #[cfg(feature = "ingest-v4l2")]
            {
                CameraBackend::Device(device::DeviceCamera::open(&self.config)?)
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                return Err(anyhow!(
                    "capturing from {} requires the ingest-v4l2 feature",
                    self.config.device
                ));
            }
        };
        self.backend = Some(backend);
        self.opened_at = Some(Instant::now());
        self.frame_count = 0;

        for _ in 0..self.config.warmup_frames {
            if let Err(err) = self.read_raw() {
                log::debug!("CameraSource: warm-up read failed: {:#}", err);
            }
        }

        let info = self
            .info()
            .ok_or_else(|| anyhow!("camera opened without stream info"))?;
        log::info!(
            "CameraSource: opened {} ({}x{} @ {} fps)",
            self.config.device,
            info.width,
            info.height,
            self.config.fps
        );
        Ok(info)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some((pixels, width, height)) = self.read_raw()? else {
            return Ok(None);
        };
        let timestamp = self
            .opened_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();
        let index = self.frame_count;
        self.frame_count += 1;
        Frame::new(pixels, width, height, PixelOrder::Rgb, timestamp, index)
            .context("camera produced a malformed frame")
            .map(Some)
    }

    fn info(&self) -> Option<StreamInfo> {
        let (width, height) = match self.backend.as_ref()? {
            CameraBackend::Synthetic(camera) => (camera.width, camera.height),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(camera) => camera.geometry(),
        };
        Some(StreamInfo {
            width,
            height,
            fps: self.config.fps as f64,
            frame_count: None,
        })
    }

    fn release(&mut self) {
        if self.backend.take().is_some() {
            log::info!("CameraSource: released {}", self.config.device);
        }
        self.opened_at = None;
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticCamera {
    width: u32,
    height: u32,
    brightness: Option<u8>,
    remaining: Option<u64>,
    tick: u64,
}

impl SyntheticCamera {
    fn open(config: &CameraConfig) -> Result<Self> {
        let url = Url::parse(&config.device)
            .with_context(|| format!("invalid stub device '{}'", config.device))?;
        if url.host_str() == Some("absent") {
            return Err(anyhow!("no capture device at {}", config.device));
        }
        let mut camera = Self {
            width: config.width,
            height: config.height,
            brightness: None,
            remaining: None,
            tick: 0,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => {
                    let frames: u64 = value.parse().context("invalid stub frames")?;
                    camera.remaining = Some(frames + config.warmup_frames as u64);
                }
                "brightness" => {
                    camera.brightness = Some(value.parse().context("invalid stub brightness")?);
                }
                other => return Err(anyhow!("unknown stub camera option '{}'", other)),
            }
        }
        Ok(camera)
    }

    fn capture(&mut self) -> Option<(Vec<u8>, u32, u32)> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        self.tick += 1;
        let pixels = match self.brightness {
            Some(level) => vec![level; (self.width as usize) * (self.height as usize) * 3],
            None => super::file::synthetic_pixels(self.width, self.height, self.tick),
        };
        Some((pixels, self.width, self.height))
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 source using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
mod device {
    use anyhow::{anyhow, Context, Result};
    use ouroboros::self_referencing;

    use super::super::normalize::{normalize_to_rgb, PixelFormat};
    use super::CameraConfig;

    /// A dequeue that waits longer than this fails instead of blocking forever.
    const CAPTURE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

    pub(super) struct DeviceCamera {
        state: DeviceState,
        format: PixelFormat,
        width: u32,
        height: u32,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl DeviceCamera {
        pub(super) fn open(config: &CameraConfig) -> Result<Self> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let mut device = v4l::Device::with_path(&config.device)
                .with_context(|| format!("open v4l2 device {}", config.device))?;
            let mut requested = device.format().context("read v4l2 format")?;
            requested.width = config.width;
            requested.height = config.height;
            requested.fourcc = v4l::FourCC::new(b"RGB3");

            let active = match device.set_format(&requested) {
                Ok(format) => format,
                Err(err) => {
                    log::warn!(
                        "CameraSource: failed to set format on {}: {}",
                        config.device,
                        err
                    );
                    device
                        .format()
                        .context("read v4l2 format after set failure")?
                }
            };
            let format = PixelFormat::from_fourcc(&active.fourcc.repr).ok_or_else(|| {
                anyhow!(
                    "unsupported pixel format {} on {}",
                    active.fourcc,
                    config.device
                )
            })?;

            if config.fps > 0 {
                let params = v4l::video::capture::Parameters::with_fps(config.fps);
                if let Err(err) = device.set_params(&params) {
                    log::warn!("CameraSource: failed to set fps on {}: {}", config.device, err);
                }
            }

            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map(|mut stream| {
                            stream.set_timeout(CAPTURE_TIMEOUT);
                            stream
                        })
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;

            Ok(Self {
                state,
                format,
                width: active.width,
                height: active.height,
            })
        }

        pub(super) fn geometry(&self) -> (u32, u32) {
            (self.width, self.height)
        }

        pub(super) fn capture(&mut self) -> Result<(Vec<u8>, u32, u32)> {
            use v4l::io::traits::CaptureStream;

            let (width, height, format) = (self.width, self.height, self.format);
            let rgb = self.state.with_mut(|fields| -> Result<Vec<u8>> {
                let (buf, _meta) = fields.stream.next().context("capture v4l2 frame")?;
                normalize_to_rgb(buf, width, height, format)
            })?;
            Ok((rgb, width, height))
        }
    }
}
