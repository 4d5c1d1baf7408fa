//! Hardware-decoder wrapper over an ffmpeg subprocess.
//!
//! Encoded access-units are queued to a writer thread feeding the decoder's
//! stdin; raw RGBA frames come back from a reader thread draining stdout.
//! Both queues are bounded so neither side can outrun the orchestrator.

use super::DecoderStage;
use crate::error::{KaleidoError, Result};
use crate::frame::{AccessUnit, DecodedFrame};
use crate::mux::pts_for_index;
use crate::source::{spawn_stderr_logger, Poll, StreamDescriptor};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const INPUT_QUEUE_DEPTH: usize = 8;
const OUTPUT_QUEUE_DEPTH: usize = 4;

/// H.264 decoder producing RGBA frames.
pub struct FfmpegDecoder {
    child: Option<Child>,
    input_tx: Option<Sender<AccessUnit>>,
    output_rx: Receiver<DecodedFrame>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    eos_delivered: bool,
}

impl FfmpegDecoder {
    pub fn open(desc: &StreamDescriptor) -> Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-loglevel",
                "error",
                "-f",
                "h264",
                "-i",
                "pipe:0",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| KaleidoError::Setup(format!("failed to spawn decoder: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| KaleidoError::Setup("decoder stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| KaleidoError::Setup("decoder stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger("decode", stderr);
        }

        let (input_tx, input_rx) = bounded::<AccessUnit>(INPUT_QUEUE_DEPTH);
        let writer = std::thread::spawn(move || {
            while let Ok(unit) = input_rx.recv() {
                if unit.eos {
                    break;
                }
                if let Err(e) = stdin.write_all(&unit.data) {
                    warn!("decoder input write failed: {e}");
                    break;
                }
            }
            // Dropping stdin is the end-of-stream signal to the subprocess.
        });

        let frame_size = (desc.width * desc.height * 4) as usize;
        let (width, height) = (desc.width, desc.height);
        let (fps_num, fps_den) = (desc.fps_num, desc.fps_den);
        let (output_tx, output_rx) = bounded::<DecodedFrame>(OUTPUT_QUEUE_DEPTH);
        let reader = std::thread::spawn(move || {
            let mut index = 0u64;
            loop {
                let mut data = vec![0u8; frame_size];
                match stdout.read_exact(&mut data) {
                    Ok(()) => {
                        let frame = DecodedFrame {
                            width,
                            height,
                            pts_us: pts_for_index(index, fps_num, fps_den),
                            eos: false,
                            data,
                        };
                        index += 1;
                        if output_tx.send(frame).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            warn!("decoder output read failed: {e}");
                        }
                        break;
                    }
                }
            }
            debug!("decoder drained after {index} frames");
            let _ = output_tx.send(DecodedFrame::end_of_stream());
        });

        info!("decoder started ({}x{} RGBA)", desc.width, desc.height);
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

impl DecoderStage for FfmpegDecoder {
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

    fn push_input(&mut self, unit: AccessUnit) -> Result<()> {
        let tx = self
            .input_tx
            .as_ref()
            .ok_or_else(|| KaleidoError::stage("decode", "input already closed"))?;
        match tx.try_send(unit) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(KaleidoError::stage("decode", "input queue full after slot poll"))
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(KaleidoError::stage("decode", "input writer terminated"))
            }
        }
    }

    fn push_eos(&mut self) -> Result<()> {
        if let Some(tx) = self.input_tx.take() {
            // Blocking send is fine: the writer drains this queue unconditionally.
            let _ = tx.send(AccessUnit::end_of_stream());
        }
        Ok(())
    }

    fn try_get_output(&mut self, timeout: Duration) -> Result<Poll<DecodedFrame>> {
        match self.output_rx.recv_timeout(timeout) {
            Ok(frame) => {
                if frame.eos {
                    self.eos_delivered = true;
                }
                Ok(Poll::Ready(frame))
            }
            Err(RecvTimeoutError::Timeout) => Ok(Poll::Pending),
            Err(RecvTimeoutError::Disconnected) => {
                if self.eos_delivered {
                    Ok(Poll::Pending)
                } else {
                    Err(KaleidoError::stage("decode", "decoder terminated unexpectedly"))
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.input_tx = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("decoder already exited: {e}");
            }
            let _ = child.wait();
        }
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("decoder writer thread panicked");
            }
        }
        if let Some(reader) = self.reader.take() {
            while !reader.is_finished() {
                while self.output_rx.try_recv().is_ok() {}
                std::thread::yield_now();
            }
            if reader.join().is_err() {
                warn!("decoder reader thread panicked");
            }
        }
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.teardown();
    }
}
