//! Output container writing and timestamp correction.
//!
//! The track opens lazily on the encoder's first format-change event.
//! Written presentation timestamps are never taken from the encoder; they
//! are recomputed from the count of samples that actually reached the muxer
//! so the output is strictly increasing and frame-rate locked regardless of
//! upstream jitter or drops.

use crate::error::{KaleidoError, Result};
use crate::frame::EncodedAccessUnit;
use crate::source::{spawn_stderr_logger, StreamDescriptor};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info, warn};

/// Timestamp for the n-th written sample: `index * 1_000_000 / frameRate`
/// microseconds, expressed with rational frame rates kept exact.
pub fn pts_for_index(index: u64, fps_num: u32, fps_den: u32) -> i64 {
    if fps_num == 0 {
        return 0;
    }
    (index as i64) * 1_000_000 * fps_den as i64 / fps_num as i64
}

/// Accepts encoded access-units and writes the output container.
pub trait ContainerSink {
    /// True once the format-change event opened the track.
    fn is_open(&self) -> bool;

    /// Open the output track. Called exactly once, with the codec
    /// configuration unit that announced the output format.
    fn open_track(&mut self, desc: &StreamDescriptor, config: &EncodedAccessUnit) -> Result<()>;

    /// Write one unit. Returns the corrected timestamp assigned to it, or
    /// `None` for ancillary units that carry no picture.
    fn write_sample(&mut self, unit: &EncodedAccessUnit) -> Result<Option<i64>>;

    /// Frames written so far (ancillary units excluded).
    fn samples_written(&self) -> u64;

    /// Finalize the container. The output file exists only after this
    /// succeeds.
    fn finish(&mut self) -> Result<()>;

    /// Discard the output: stop the writer and delete any partial file.
    /// Idempotent; a no-op after a successful finish.
    fn abort(&mut self);
}

/// MP4 writer delegating container assembly to an ffmpeg subprocess that
/// stream-copies the already-encoded H.264 units at the corrected rate.
pub struct FfmpegMuxer {
    output: PathBuf,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    fps_num: u32,
    fps_den: u32,
    frames_written: u64,
    finished: bool,
}

impl FfmpegMuxer {
    pub fn new(output: &Path) -> Self {
        Self {
            output: output.to_path_buf(),
            child: None,
            stdin: None,
            fps_num: 0,
            fps_den: 1,
            frames_written: 0,
            finished: false,
        }
    }

    fn stdin_mut(&mut self) -> Result<&mut ChildStdin> {
        self.stdin
            .as_mut()
            .ok_or_else(|| KaleidoError::stage("mux", "container writer is not running"))
    }
}

impl ContainerSink for FfmpegMuxer {
    fn is_open(&self) -> bool {
        self.child.is_some()
    }

    fn open_track(&mut self, desc: &StreamDescriptor, config: &EncodedAccessUnit) -> Result<()> {
        if self.is_open() {
            return Err(KaleidoError::Protocol(
                "track opened twice; duplicate format-change event".into(),
            ));
        }

        let rate = format!("{}/{}", desc.fps_num, desc.fps_den);
        let mut child = Command::new("ffmpeg")
            .args([
                "-loglevel", "error", "-y", "-f", "h264", "-r", &rate, "-i", "pipe:0", "-an",
                "-c:v", "copy", "-movflags", "+faststart",
            ])
            .arg(&self.output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| KaleidoError::stage("mux", format!("failed to spawn muxer: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| KaleidoError::stage("mux", "muxer stdin unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger("mux", stderr);
        }

        stdin
            .write_all(&config.data)
            .map_err(|e| KaleidoError::stage("mux", format!("config write failed: {e}")))?;

        self.fps_num = desc.fps_num;
        self.fps_den = desc.fps_den;
        self.child = Some(child);
        self.stdin = Some(stdin);
        info!("output track opened: '{}' @ {rate} fps", self.output.display());
        Ok(())
    }

    fn write_sample(&mut self, unit: &EncodedAccessUnit) -> Result<Option<i64>> {
        if !self.is_open() {
            return Err(KaleidoError::Protocol(
                "sample written before track start".into(),
            ));
        }
        let stdin = self.stdin_mut()?;
        stdin
            .write_all(&unit.data)
            .map_err(|e| KaleidoError::stage("mux", format!("sample write failed: {e}")))?;

        if unit.is_frame {
            let pts = pts_for_index(self.frames_written, self.fps_num, self.fps_den);
            self.frames_written += 1;
            Ok(Some(pts))
        } else {
            Ok(None)
        }
    }

    fn samples_written(&self) -> u64 {
        self.frames_written
    }

    fn finish(&mut self) -> Result<()> {
        // Closing stdin lets the writer finalize the moov atom.
        self.stdin = None;
        let Some(mut child) = self.child.take() else {
            return Err(KaleidoError::stage("mux", "track was never opened"));
        };
        let status = child
            .wait()
            .map_err(|e| KaleidoError::stage("mux", format!("muxer wait failed: {e}")))?;
        if !status.success() {
            return Err(KaleidoError::stage(
                "mux",
                format!("muxer exited with status {status}"),
            ));
        }
        self.finished = true;
        info!(
            "container finalized: {} frames at '{}'",
            self.frames_written,
            self.output.display()
        );
        Ok(())
    }

    fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("muxer already exited: {e}");
            }
            let _ = child.wait();
        }
        // Never leave a partial container behind.
        match std::fs::remove_file(&self.output) {
            Ok(()) => debug!("removed partial output '{}'", self.output.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove partial output: {e}"),
        }
    }
}

impl Drop for FfmpegMuxer {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrected_timestamps_are_rate_locked() {
        assert_eq!(pts_for_index(0, 30, 1), 0);
        assert_eq!(pts_for_index(1, 30, 1), 33_333);
        assert_eq!(pts_for_index(60, 30, 1), 2_000_000);
    }

    #[test]
    fn corrected_timestamps_are_strictly_increasing() {
        let mut last = -1;
        for i in 0..300 {
            let pts = pts_for_index(i, 30_000, 1001);
            assert!(pts > last);
            last = pts;
        }
    }

    #[test]
    fn writing_before_open_is_a_protocol_error() {
        let mut muxer = FfmpegMuxer::new(Path::new("/tmp/kaleido-never-written.mp4"));
        let unit = EncodedAccessUnit {
            data: vec![0, 0, 0, 1, 0x65],
            is_config: false,
            is_keyframe: true,
            is_frame: true,
            eos: false,
        };
        assert!(matches!(
            muxer.write_sample(&unit),
            Err(KaleidoError::Protocol(_))
        ));
    }

    #[test]
    fn abort_is_idempotent() {
        let mut muxer = FfmpegMuxer::new(Path::new("/tmp/kaleido-aborted.mp4"));
        muxer.abort();
        muxer.abort();
    }
}
