//! Input probing and sample extraction.
//!
//! Demuxing is delegated to the platform media toolkit (`ffprobe`/`ffmpeg`
//! subprocesses). The source yields encoded access-units in presentation
//! order through a bounded queue and owns no GPU resources.

use crate::codec::annexb::AnnexBSplitter;
use crate::error::{KaleidoError, Result};
use crate::frame::AccessUnit;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many extracted units may sit between the demuxer and the decoder
/// before the demux thread blocks.
const UNIT_QUEUE_DEPTH: usize = 32;

/// Immutable description of the single video track, derived once at setup.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub width: u32,
    pub height: u32,
    /// Frame rate as a rational, e.g. 30000/1001.
    pub fps_num: u32,
    pub fps_den: u32,
    /// Track duration in microseconds; zero when the container does not say.
    pub duration_us: i64,
}

impl StreamDescriptor {
    pub fn fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            self.fps_num as f64 / self.fps_den as f64
        }
    }

    /// Microseconds between frames at the nominal rate.
    pub fn frame_interval_us(&self) -> i64 {
        if self.fps_num == 0 {
            0
        } else {
            1_000_000 * self.fps_den as i64 / self.fps_num as i64
        }
    }

    /// `duration * fps`, rounded. An estimate only: the real frame count is
    /// discovered by iterating the stream.
    pub fn total_frames_estimate(&self) -> u64 {
        let secs = self.duration_us as f64 / 1_000_000.0;
        (secs * self.fps()).round().max(0.0) as u64
    }
}

/// Yields encoded access-units in presentation order.
pub trait SampleSource {
    fn descriptor(&self) -> &StreamDescriptor;

    /// Non-blocking poll with a short timeout. The final unit has its
    /// end-of-stream flag set.
    fn next_unit(&mut self, timeout: Duration) -> Result<Poll<AccessUnit>>;

    /// Idempotent resource release.
    fn teardown(&mut self);
}

/// Outcome of a non-blocking queue poll.
#[derive(Debug)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// True when the media toolkit is reachable on PATH.
pub fn toolkit_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Probe the first video track of `path`. Fails fast with
/// [`KaleidoError::NoVideoTrack`] when the container has none, before any
/// decoder or encoder is constructed.
pub fn probe(path: &Path) -> Result<StreamDescriptor> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,duration",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .map_err(|e| KaleidoError::Setup(format!("failed to run ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(KaleidoError::Setup(format!(
            "ffprobe failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let desc = parse_probe_output(&stdout, path)?;
    info!(
        "probed '{}': {}x{} @ {:.3} fps, {:.2}s",
        path.display(),
        desc.width,
        desc.height,
        desc.fps(),
        desc.duration_us as f64 / 1_000_000.0
    );
    Ok(desc)
}

/// Parse one csv line of `width,height,...` where the remaining fields are a
/// rational frame rate and an optional duration in whichever order ffprobe
/// chose to emit them.
fn parse_probe_output(stdout: &str, path: &Path) -> Result<StreamDescriptor> {
    let line = stdout.trim();
    if line.is_empty() {
        return Err(KaleidoError::NoVideoTrack {
            path: path.to_path_buf(),
        });
    }

    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 3 {
        return Err(KaleidoError::Setup(format!(
            "unexpected ffprobe output: {line}"
        )));
    }

    let width: u32 = parts[0]
        .parse()
        .map_err(|_| KaleidoError::Setup(format!("bad width in probe output: {line}")))?;
    let height: u32 = parts[1]
        .parse()
        .map_err(|_| KaleidoError::Setup(format!("bad height in probe output: {line}")))?;

    let mut fps = (0u32, 1u32);
    let mut duration_us = 0i64;
    for field in &parts[2..] {
        if let Some((num, den)) = field.split_once('/') {
            let n: u32 = num.parse().unwrap_or(0);
            let d: u32 = den.parse().unwrap_or(1);
            if n > 0 && d > 0 {
                fps = (n, d);
            }
        } else if let Ok(secs) = field.parse::<f64>() {
            duration_us = (secs * 1_000_000.0) as i64;
        }
    }

    if fps.0 == 0 {
        return Err(KaleidoError::Setup(format!(
            "could not determine frame rate from probe output: {line}"
        )));
    }

    Ok(StreamDescriptor {
        width,
        height,
        fps_num: fps.0,
        fps_den: fps.1,
        duration_us,
    })
}

/// Extracts the H.264 elementary stream of the first video track via an
/// ffmpeg subprocess and splits it into access-units on a reader thread.
pub struct FfmpegSampleSource {
    desc: StreamDescriptor,
    child: Option<Child>,
    rx: Receiver<AccessUnit>,
    reader: Option<JoinHandle<()>>,
    eos_seen: bool,
}

impl FfmpegSampleSource {
    pub fn open(path: &Path, desc: StreamDescriptor) -> Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-loglevel", "error", "-i"])
            .arg(path)
            .args([
                "-map",
                "0:v:0",
                "-c:v",
                "copy",
                "-bsf:v",
                "h264_mp4toannexb",
                "-f",
                "h264",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| KaleidoError::Setup(format!("failed to spawn demuxer: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KaleidoError::Setup("demuxer stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger("demux", stderr);
        }

        let (tx, rx) = bounded(UNIT_QUEUE_DEPTH);
        let reader = std::thread::spawn(move || {
            let mut stdout = stdout;
            let mut splitter = AnnexBSplitter::new();
            let mut buf = [0u8; 64 * 1024];
            let mut count = 0u64;
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for unit in splitter.push(&buf[..n]) {
                            count += 1;
                            if tx.send(AccessUnit::new(unit)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("demux read error: {e}");
                        break;
                    }
                }
            }
            if let Some(tail) = splitter.finish() {
                count += 1;
                let _ = tx.send(AccessUnit::new(tail));
            }
            debug!("demuxer drained after {count} units");
            let _ = tx.send(AccessUnit::end_of_stream());
        });

        Ok(Self {
            desc,
            child: Some(child),
            rx,
            reader: Some(reader),
            eos_seen: false,
        })
    }
}

impl SampleSource for FfmpegSampleSource {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.desc
    }

    fn next_unit(&mut self, timeout: Duration) -> Result<Poll<AccessUnit>> {
        match self.rx.recv_timeout(timeout) {
            Ok(unit) => {
                if unit.eos {
                    self.eos_seen = true;
                }
                Ok(Poll::Ready(unit))
            }
            Err(RecvTimeoutError::Timeout) => Ok(Poll::Pending),
            Err(RecvTimeoutError::Disconnected) => {
                if self.eos_seen {
                    Ok(Poll::Pending)
                } else {
                    Err(KaleidoError::stage("source", "demuxer terminated unexpectedly"))
                }
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("demuxer already exited: {e}");
            }
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            // Keep freeing queue slots until the reader notices the closed
            // pipe; it may be blocked on a full queue.
            while !reader.is_finished() {
                while self.rx.try_recv().is_ok() {}
                std::thread::yield_now();
            }
            if reader.join().is_err() {
                warn!("demux reader thread panicked");
            }
        }
    }
}

impl Drop for FfmpegSampleSource {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Forward a subprocess's stderr into the log without blocking the stage.
pub(crate) fn spawn_stderr_logger(tag: &'static str, mut stderr: impl Read + Send + 'static) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 1024];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let msg = String::from_utf8_lossy(&buf[..n]);
                    for line in msg.lines() {
                        warn!("{tag}: {line}");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_parse_rejects_missing_video_track() {
        let err = parse_probe_output("", Path::new("clip.mp4")).unwrap_err();
        assert!(matches!(err, KaleidoError::NoVideoTrack { .. }));
    }

    #[test]
    fn probe_parse_handles_field_order_variants() {
        let a = parse_probe_output("1280,720,30/1,2.000000", Path::new("x")).unwrap();
        let b = parse_probe_output("1280,720,2.000000,30/1", Path::new("x")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fps_num, 30);
        assert_eq!(a.duration_us, 2_000_000);
    }

    #[test]
    fn probe_parse_tolerates_missing_duration() {
        let d = parse_probe_output("640,480,30000/1001,N/A", Path::new("x")).unwrap();
        assert_eq!(d.duration_us, 0);
        assert!((d.fps() - 29.97).abs() < 0.01);
    }

    #[test]
    fn frame_estimate_is_duration_times_rate() {
        let d = StreamDescriptor {
            width: 1280,
            height: 720,
            fps_num: 30,
            fps_den: 1,
            duration_us: 2_000_000,
        };
        assert_eq!(d.total_frames_estimate(), 60);
        assert_eq!(d.frame_interval_us(), 33_333);
    }
}
