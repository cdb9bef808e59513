//! External `ffmpeg` encoder turning annotated frames into a web-playable
//! H.264 MP4.
//!
//! Frames are piped to the child's stdin as packed RGB24 while the batch
//! runs, so no uncompressed intermediate ever touches the disk. Closing
//! stdin ends the stream; the child then has `timeout` to finish writing.

use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::error::VigilError;
use crate::frame::{Frame, PixelOrder};
use crate::ingest::StreamInfo;
use crate::sink::{FrameSink, SinkSummary};

pub const DEFAULT_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(300);

const CHANNEL: &str = "transcoder";
const WAIT_POLL: Duration = Duration::from_millis(50);

fn fault(err: impl std::fmt::Display) -> anyhow::Error {
    VigilError::transport(CHANNEL, err).into()
}

/// Spawns `ffmpeg` encoders. Failures are reported, never retried.
#[derive(Clone, Debug)]
pub struct Transcoder {
    program: PathBuf,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TRANSCODE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments reading RGB24 frames of `info` from stdin into an MP4 at `output`.
    pub fn build_args(info: &StreamInfo, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into(), "-v".into(), "error".into()];
        args.extend([
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgb24".to_string(),
            "-s".to_string(),
            format!("{}x{}", info.width, info.height),
            "-r".to_string(),
            format!("{:.3}", info.effective_fps()),
            "-i".to_string(),
            "pipe:0".to_string(),
        ]);
        args.extend(
            [
                "-c:v",
                "libx264",
                "-profile:v",
                "main",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
                "-preset",
                "fast",
                "-crf",
                "23",
                "-vf",
                "scale=trunc(iw/2)*2:trunc(ih/2)*2",
                "-an",
                "-f",
                "mp4",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(output.to_string_lossy().to_string());
        args
    }

    /// Start an encoder writing to `output`. Errors carry a
    /// `TransportFault` from the transcoder channel.
    pub fn start(&self, info: &StreamInfo, output: &Path) -> Result<EncoderSink> {
        if info.width == 0 || info.height == 0 {
            return Err(fault(format!("cannot encode {}x{} frames", info.width, info.height)));
        }
        let args = Self::build_args(info, output);
        log::info!("encoding {}x{} frames to {}", info.width, info.height, output.display());
        log::debug!("{} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fault(format!("spawn {}: {}", self.program.display(), e)))?;

        let stdin = child.stdin.take().ok_or_else(|| fault("ffmpeg stdin unavailable"))?;
        // Drained on its own thread so a chatty encoder never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        Ok(EncoderSink {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stderr,
            output: output.to_path_buf(),
            info: *info,
            frames_written: 0,
            timeout: self.timeout,
        })
    }
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

/// A running `ffmpeg` child fed through its stdin.
///
/// Dropping an unfinished sink kills the child.
pub struct EncoderSink {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr: Option<JoinHandle<String>>,
    output: PathBuf,
    info: StreamInfo,
    frames_written: u64,
    timeout: Duration,
}

impl EncoderSink {
    pub fn output(&self) -> &Path {
        &self.output
    }

    fn stderr_tail(&mut self) -> String {
        let Some(reader) = self.stderr.take() else {
            return String::new();
        };
        let text = reader.join().unwrap_or_default();
        let tail: Vec<&str> = text.lines().rev().take(5).collect();
        tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn wait(&mut self) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait().map_err(fault)? {
                return Ok(status);
            }
            if started.elapsed() >= self.timeout {
                log::warn!(
                    "ffmpeg timed out after {} seconds, killing process",
                    self.timeout.as_secs()
                );
                self.kill();
                return Err(fault(format!("timed out after {}s", self.timeout.as_secs())));
            }
            std::thread::sleep(WAIT_POLL);
        }
    }
}

impl FrameSink for EncoderSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder already finished"))?;
        if (frame.width, frame.height) != (self.info.width, self.info.height) {
            return Err(anyhow!(
                "frame {} is {}x{}, encoder expects {}x{}",
                frame.index,
                frame.width,
                frame.height,
                self.info.width,
                self.info.height
            ));
        }
        if let Err(err) = stdin.write_all(&frame.pixels_in(PixelOrder::Rgb)) {
            self.kill();
            self.stdin = None;
            let detail = self.stderr_tail();
            return Err(fault(format!(
                "ffmpeg stopped accepting frames at frame {}: {} {}",
                frame.index, err, detail
            )));
        }
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<SinkSummary> {
        let stdin = self
            .stdin
            .take()
            .ok_or_else(|| anyhow!("encoder already finished"))?;
        if self.frames_written == 0 {
            drop(stdin);
            self.kill();
            return Err(fault("no frames to encode"));
        }
        // Flushing and dropping the writer closes the pipe: end of stream.
        if let Err(err) = stdin.into_inner() {
            self.kill();
            return Err(fault(format!("flush frames to ffmpeg: {}", err.error())));
        }

        let status = self.wait()?;
        let detail = self.stderr_tail();
        if !status.success() {
            log::error!("ffmpeg failed ({}): {}", status, detail);
            return Err(fault(format!("ffmpeg exited with {}: {}", status, detail)));
        }
        log::info!(
            "encoded {} frames to {}",
            self.frames_written,
            self.output.display()
        );
        Ok(SinkSummary {
            frames_written: self.frames_written,
            width: self.info.width,
            height: self.info.height,
            fps: self.info.effective_fps(),
            path: Some(self.output.clone()),
        })
    }
}

impl Drop for EncoderSink {
    fn drop(&mut self) {
        if let Some(stdin) = self.stdin.take() {
            log::debug!("encoder for {} dropped unfinished", self.output.display());
            // Kill first: flushing the buffer into a live child could block.
            self.kill();
            drop(stdin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;

    fn info() -> StreamInfo {
        StreamInfo {
            width: 4,
            height: 2,
            fps: 29.97,
            frame_count: None,
        }
    }

    fn stage(err: anyhow::Error) -> Stage {
        err.downcast::<VigilError>().expect("vigil error").stage()
    }

    /// Stand-in encoder that copies stdin to its last argument.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, "#!/bin/sh\nfor last; do :; done\nexec cat > \"$last\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn args_read_frames_from_stdin() {
        let args = Transcoder::build_args(&info(), Path::new("/tmp/out.mp4"));
        let joined = args.join(" ");
        assert!(joined.starts_with("-y -v error -f rawvideo -pix_fmt rgb24 -s 4x2 -r 29.970 -i pipe:0"));
        assert!(joined.contains("-c:v libx264 -profile:v main -pix_fmt yuv420p -movflags +faststart"));
        assert!(joined.contains("-preset fast -crf 23"));
        assert!(joined.contains("scale=trunc(iw/2)*2:trunc(ih/2)*2"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn missing_program_is_a_convert_failure() {
        let err = Transcoder::new("/nonexistent/ffmpeg-binary")
            .start(&info(), Path::new("/tmp/out.mp4"))
            .err()
            .unwrap();
        assert_eq!(stage(err), Stage::Convert);
    }

    #[cfg(unix)]
    #[test]
    fn frames_stream_straight_to_the_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("clip.mp4");
        let mut sink = Transcoder::new(fake_ffmpeg(dir.path())).start(&info(), &output)?;
        let frame = Frame::new(vec![7u8; 4 * 2 * 3], 4, 2, PixelOrder::Bgr, 0.0, 0)?;
        for _ in 0..3 {
            sink.write(&frame)?;
        }
        let summary = sink.finish()?;
        assert_eq!(summary.frames_written, 3);
        assert_eq!(summary.path.as_deref(), Some(output.as_path()));
        assert_eq!(std::fs::metadata(&output)?.len(), 3 * 4 * 2 * 3);
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 2);
        assert!(sink.write(&frame).is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn empty_stream_is_a_convert_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink =
            Transcoder::new(fake_ffmpeg(dir.path())).start(&info(), &dir.path().join("clip.mp4"))?;
        assert_eq!(stage(sink.finish().err().unwrap()), Stage::Convert);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn geometry_change_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink =
            Transcoder::new(fake_ffmpeg(dir.path())).start(&info(), &dir.path().join("clip.mp4"))?;
        let frame = Frame::new(vec![0; 3], 1, 1, PixelOrder::Rgb, 0.0, 0)?;
        assert!(sink.write(&frame).is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failing_encoder_reports_exit_status() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("broken-ffmpeg");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\necho 'Unknown encoder' >&2\nexit 1\n")?;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
        }
        let mut sink = Transcoder::new(script).start(&info(), &dir.path().join("clip.mp4"))?;
        sink.write(&Frame::new(vec![1u8; 4 * 2 * 3], 4, 2, PixelOrder::Rgb, 0.0, 0)?)?;
        let err = sink.finish().err().unwrap();
        assert!(err.to_string().contains("Unknown encoder"));
        assert_eq!(stage(err), Stage::Convert);
        Ok(())
    }
}
