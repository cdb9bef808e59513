//! Local file frame source using FFmpeg.
//!
//! Decodes the best video stream in memory, converting every frame to RGB24.
//! Timestamps come from the frame's presentation time in stream time base,
//! falling back to `index / fps` when a frame carries none.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::StreamInfo;
use crate::frame::{Frame, PixelOrder};

pub(crate) struct FfmpegFileSource {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    time_base: f64,
    info: StreamInfo,
    frame_count: u64,
    eof_sent: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let time_base = f64::from(input_stream.time_base());
        let fps = f64::from(input_stream.avg_frame_rate());
        let frames = input_stream.frames();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;
        if decoder.width() == 0 || decoder.height() == 0 {
            return Err(anyhow!("video track reports zero dimensions"));
        }

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let info = StreamInfo {
            width: decoder.width(),
            height: decoder.height(),
            fps: if fps.is_finite() { fps } else { 0.0 },
            frame_count: (frames > 0).then_some(frames as u64),
        };

        Ok(Self {
            path: path.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            time_base,
            info,
            frame_count: 0,
            eof_sent: false,
        })
    }

    pub(crate) fn info(&self) -> StreamInfo {
        self.info
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map(Some);
            }
            if self.eof_sent {
                log::debug!("FileSource: {} drained after {} frames", self.path, self.frame_count);
                return Ok(None);
            }
            let next = self.input.packets().next();
            match next {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;

        let index = self.frame_count;
        self.frame_count += 1;
        let timestamp = match decoded.timestamp() {
            Some(pts) if self.time_base > 0.0 => pts as f64 * self.time_base,
            _ => index as f64 / self.info.effective_fps(),
        };

        Frame::new(pixels, width, height, PixelOrder::Rgb, timestamp, index)
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame buffer is too short")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
