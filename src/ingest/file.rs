//! Local file frame source.
//!
//! `FileSource` reads frames from a local video file in presentation order.
//! Paths starting with `stub://` produce a synthetic clip:
//!
//! `stub://clip?frames=30&fps=25&width=64&height=48`
//!
//! `stub://missing` fails to open. Any other path needs the
//! `ingest-file-ffmpeg` feature.

use anyhow::{anyhow, Context, Result};
use url::Url;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::{FrameSource, StreamInfo};
use crate::frame::{Frame, PixelOrder};

/// Local file frame source.
pub struct FileSource {
    path: String,
    backend: Option<FileBackend>,
}

enum FileBackend {
    Synthetic(SyntheticFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !is_local_file_path(&path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        Ok(Self {
            path,
            backend: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn open(&mut self) -> Result<StreamInfo> {
        let backend = if self.path.starts_with("stub://") {
            FileBackend::Synthetic(SyntheticFileSource::open(&self.path)?)
        } else {
            #[cfg(feature = "ingest-file-ffmpeg")]
            {
                FileBackend::Ffmpeg(FfmpegFileSource::open(&self.path)?)
            }
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            {
                return Err(anyhow!(
                    "decoding {} requires the ingest-file-ffmpeg feature",
                    self.path
                ));
            }
        };
        self.backend = Some(backend);
        let info = self
            .info()
            .ok_or_else(|| anyhow!("file source opened without stream info"))?;
        log::info!(
            "FileSource: opened {} ({}x{} @ {:.2} fps)",
            self.path,
            info.width,
            info.height,
            info.effective_fps()
        );
        Ok(info)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.backend.as_mut() {
            Some(FileBackend::Synthetic(source)) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            Some(FileBackend::Ffmpeg(source)) => source.next_frame(),
            None => Err(anyhow!("file source not opened; call open() first")),
        }
    }

    fn info(&self) -> Option<StreamInfo> {
        match self.backend.as_ref()? {
            FileBackend::Synthetic(source) => Some(source.info),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => Some(source.info()),
        }
    }

    fn release(&mut self) {
        if self.backend.take().is_some() {
            log::debug!("FileSource: released {}", self.path);
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticFileSource {
    info: StreamInfo,
    total: u64,
    produced: u64,
}

impl SyntheticFileSource {
    fn open(path: &str) -> Result<Self> {
        let url = Url::parse(path).with_context(|| format!("invalid stub path '{}'", path))?;
        if url.host_str() == Some("missing") {
            return Err(anyhow!("no such file: {}", path));
        }
        let mut info = StreamInfo {
            width: 64,
            height: 48,
            fps: 25.0,
            frame_count: None,
        };
        let mut total = 30;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => total = value.parse().context("invalid stub frames")?,
                "fps" => info.fps = value.parse().context("invalid stub fps")?,
                "width" => info.width = value.parse().context("invalid stub width")?,
                "height" => info.height = value.parse().context("invalid stub height")?,
                other => return Err(anyhow!("unknown stub file option '{}'", other)),
            }
        }
        if info.width == 0 || info.height == 0 {
            return Err(anyhow!("stub clip dimensions must be non-zero"));
        }
        info.frame_count = Some(total);
        Ok(Self {
            info,
            total,
            produced: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.produced >= self.total {
            return Ok(None);
        }
        let index = self.produced;
        self.produced += 1;
        let pixels = synthetic_pixels(self.info.width, self.info.height, index);
        let timestamp = index as f64 / self.info.effective_fps();
        Frame::new(
            pixels,
            self.info.width,
            self.info.height,
            PixelOrder::Rgb,
            timestamp,
            index,
        )
        .map(Some)
    }
}

/// Moving gradient; bright enough to pass the live loop's blank-frame check.
pub(crate) fn synthetic_pixels(width: u32, height: u32, index: u64) -> Vec<u8> {
    let len = (width as usize) * (height as usize) * 3;
    (0..len)
        .map(|i| (64 + ((i as u64 + index * 7) % 128)) as u8)
        .collect()
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}
