//! Hardware-encoder wrapper over an ffmpeg subprocess.
//!
//! The encoder's input surface is a CPU pipe: drawn RGBA frames are queued
//! to a writer thread feeding stdin, and the H.264 elementary stream coming
//! back on stdout is split into classified access-units by a reader thread.
//! The first SPS/PPS unit plays the role of the output-format-changed event.

use super::{annexb, EncoderStage, SurfaceKind};
use crate::error::{KaleidoError, Result};
use crate::frame::EncodedAccessUnit;
use crate::source::{spawn_stderr_logger, Poll, StreamDescriptor};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const INPUT_QUEUE_DEPTH: usize = 4;
const OUTPUT_QUEUE_DEPTH: usize = 16;

enum EncoderInput {
    Frame(Vec<u8>),
    Eos,
}

/// H.264 encoder consuming RGBA frames.
pub struct FfmpegEncoder {
    child: Option<Child>,
    input_tx: Option<Sender<EncoderInput>>,
    output_rx: Receiver<EncodedAccessUnit>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    eos_delivered: bool,
}

impl FfmpegEncoder {
    pub fn open(desc: &StreamDescriptor) -> Result<Self> {
        let size = format!("{}x{}", desc.width, desc.height);
        let rate = format!("{}/{}", desc.fps_num, desc.fps_den);
        let mut child = Command::new("ffmpeg")
            .args([
                "-loglevel",
                "error",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &size,
                "-r",
                &rate,
                "-i",
                "pipe:0",
                "-an",
                "-c:v",
                "libx264",
                "-preset",
                "fast",
                "-pix_fmt",
                "yuv420p",
                "-f",
                "h264",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| KaleidoError::Setup(format!("failed to spawn encoder: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| KaleidoError::Setup("encoder stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| KaleidoError::Setup("encoder stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger("encode", stderr);
        }

        let (input_tx, input_rx) = bounded::<EncoderInput>(INPUT_QUEUE_DEPTH);
        let writer = std::thread::spawn(move || {
            while let Ok(input) = input_rx.recv() {
                match input {
                    EncoderInput::Frame(pixels) => {
                        if let Err(e) = stdin.write_all(&pixels) {
                            warn!("encoder input write failed: {e}");
                            break;
                        }
                    }
                    EncoderInput::Eos => break,
                }
            }
            // Dropping stdin flushes the encoder.
        });

        let (output_tx, output_rx) = bounded::<EncodedAccessUnit>(OUTPUT_QUEUE_DEPTH);
        let reader = std::thread::spawn(move || {
            let mut splitter = annexb::AnnexBSplitter::new();
            let mut buf = [0u8; 64 * 1024];
            let mut count = 0u64;
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for unit in splitter.push(&buf[..n]) {
                            count += 1;
                            if output_tx.send(annexb::classify_unit(unit)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("encoder output read failed: {e}");
                        break;
                    }
                }
            }
            if let Some(tail) = splitter.finish() {
                count += 1;
                let _ = output_tx.send(annexb::classify_unit(tail));
            }
            debug!("encoder drained after {count} units");
            let _ = output_tx.send(EncodedAccessUnit::end_of_stream());
        });

        info!("encoder started ({} @ {} fps)", size, rate);
        Ok(Self {
            child: Some(child),
            input_tx: Some(input_tx),
            output_rx,
            writer: Some(writer),
            reader: Some(reader),
            eos_delivered: false,
        })
    }
}

impl EncoderStage for FfmpegEncoder {
    fn input_surface(&self) -> SurfaceKind {
        SurfaceKind::CpuPipe
    }

    fn try_get_input_slot(&mut self, timeout: Duration) -> bool {
        let Some(tx) = &self.input_tx else {
            return false;
        };
        if !tx.is_full() {
            return true;
        }
        std::thread::sleep(timeout);
        !tx.is_full()
    }

    fn push_frame(&mut self, pixels: Vec<u8>) -> Result<()> {
        let tx = self
            .input_tx
            .as_ref()
            .ok_or_else(|| KaleidoError::stage("encode", "input already closed"))?;
        match tx.try_send(EncoderInput::Frame(pixels)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(KaleidoError::stage("encode", "input queue full after slot poll"))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(KaleidoError::stage("encode", "input writer terminated"))
            }
        }
    }

    fn push_eos(&mut self) -> Result<()> {
        if let Some(tx) = self.input_tx.take() {
            let _ = tx.send(EncoderInput::Eos);
        }
        Ok(())
    }

    fn try_get_output(&mut self, timeout: Duration) -> Result<Poll<EncodedAccessUnit>> {
        match self.output_rx.recv_timeout(timeout) {
            Ok(unit) => {
                if unit.eos {
                    self.eos_delivered = true;
                }
                Ok(Poll::Ready(unit))
            }
            Err(RecvTimeoutError::Timeout) => Ok(Poll::Pending),
            Err(RecvTimeoutError::Disconnected) => {
                if self.eos_delivered {
                    Ok(Poll::Pending)
                } else {
                    Err(KaleidoError::stage("encode", "encoder terminated unexpectedly"))
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.input_tx = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("encoder already exited: {e}");
            }
            let _ = child.wait();
        }
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("encoder writer thread panicked");
            }
        }
        if let Some(reader) = self.reader.take() {
            while !reader.is_finished() {
                while self.output_rx.try_recv().is_ok() {}
                std::thread::yield_now();
            }
            if reader.join().is_err() {
                warn!("encoder reader thread panicked");
            }
        }
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.teardown();
    }
}
