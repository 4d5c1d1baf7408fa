//! The pipeline orchestrator.
//!
//! A single worker drives source, decoder, bridge, encoder, and muxer in
//! lock-step: every loop iteration polls each stage with a bounded timeout
//! and advances whichever has ready work, so no stage blocks indefinitely
//! and no buffer outlives its required window. Exactly one terminal outcome
//! is produced and teardown runs on every exit path.

use crate::bridge::FrameBridge;
use crate::codec::{DecoderStage, EncoderStage};
use crate::error::{KaleidoError, Result};
use crate::frame::EncodedAccessUnit;
use crate::mux::ContainerSink;
use crate::source::{Poll, SampleSource, StreamDescriptor};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cooperative cancellation flag shared with the caller. Requesting
/// cancellation is idempotent and safe from any thread; the pipeline polls
/// it once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Orchestrator states between start and a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Idle,
    /// Pulling access-units from the source while feeding the decoder.
    Extracting,
    /// Source exhausted; draining the decoder.
    Draining,
    /// Decoder exhausted; draining the encoder until its end-of-stream.
    Finalizing,
}

/// Terminal outcome of a run. The orchestrator reaches exactly one of
/// these and then always runs teardown.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Success { output: PathBuf, elapsed: Duration },
    Cancelled,
    Failed { message: String },
}

/// Best-effort progress snapshot. Published, never consumed internally.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineProgress {
    pub frames_processed: u64,
    pub total_frames_estimate: u64,
    pub elapsed: Duration,
}

/// Events crossing to the caller: progress updates terminated by exactly
/// one terminal outcome.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Progress(PipelineProgress),
    Finished(RunResult),
}

/// Publishing side of the event channel. Never blocks the pipeline: when
/// the queue is full the oldest pending update is dropped to make room.
pub struct EventPublisher {
    tx: Sender<PipelineEvent>,
    gc: Receiver<PipelineEvent>,
}

impl EventPublisher {
    pub fn publish(&self, event: PipelineEvent) {
        if self.tx.is_full() {
            let _ = self.gc.try_recv();
        }
        let _ = self.tx.try_send(event);
    }
}

/// Bounded one-way notification channel for progress and the terminal
/// outcome.
pub fn event_channel(capacity: usize) -> (EventPublisher, Receiver<PipelineEvent>) {
    let (tx, rx) = bounded(capacity.max(1));
    let gc = rx.clone();
    (EventPublisher { tx, gc }, rx)
}

/// Tuning knobs. None of these affect correctness.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Timeout for queue polls while streaming.
    pub poll_timeout: Duration,
    /// Longer timeout used while draining the encoder in finalization.
    pub finalize_timeout: Duration,
    /// Publish progress every this many processed frames. Zero behaves
    /// as one.
    pub progress_interval: u64,
    /// How many decoded frames may be bridged per iteration before the
    /// encoder output is drained. One bounds peak GPU memory to a single
    /// extra frame; raising it trades memory for throughput.
    pub in_flight_frames: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(10),
            finalize_timeout: Duration::from_millis(250),
            progress_interval: 15,
            in_flight_frames: 1,
        }
    }
}

/// Outcome of the drive loop, before teardown.
enum Drive {
    Completed,
    Cancelled,
}

/// The frame pipeline engine. Owns every stage exclusively for one run;
/// stages are never shared between runs.
pub struct Pipeline<S, D, B, E, M>
where
    S: SampleSource,
    D: DecoderStage,
    B: FrameBridge,
    E: EncoderStage,
    M: ContainerSink,
{
    desc: StreamDescriptor,
    source: S,
    decoder: D,
    bridge: B,
    encoder: E,
    muxer: M,
    output: PathBuf,
    config: PipelineConfig,
    cancel: CancelToken,
    events: Option<EventPublisher>,
    state: PipelineState,
    frames_processed: u64,
    /// Parameter-set units seen so far; in-band repeats of these are normal.
    config_units: Vec<Vec<u8>>,
    encoder_eos: bool,
    started: Instant,
    last_publish: Instant,
    frames_at_last_publish: u64,
    torn_down: bool,
}

impl<S, D, B, E, M> Pipeline<S, D, B, E, M>
where
    S: SampleSource,
    D: DecoderStage,
    B: FrameBridge,
    E: EncoderStage,
    M: ContainerSink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: S,
        decoder: D,
        bridge: B,
        encoder: E,
        muxer: M,
        output: PathBuf,
        config: PipelineConfig,
        cancel: CancelToken,
    ) -> Self {
        let desc = source.descriptor().clone();
        Self {
            desc,
            source,
            decoder,
            bridge,
            encoder,
            muxer,
            output,
            config,
            cancel,
            events: None,
            state: PipelineState::Idle,
            frames_processed: 0,
            config_units: Vec::new(),
            encoder_eos: false,
            started: Instant::now(),
            last_publish: Instant::now(),
            frames_at_last_publish: 0,
            torn_down: false,
        }
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    /// Run to a terminal outcome. Consumes the pipeline; a fresh instance
    /// is required for any retry.
    pub fn run(mut self) -> RunResult {
        self.started = Instant::now();
        info!(
            "pipeline starting: ~{} frames estimated",
            self.desc.total_frames_estimate()
        );

        let result = match self.drive() {
            Ok(Drive::Completed) => match self.muxer.finish() {
                Ok(()) => RunResult::Success {
                    output: self.output.clone(),
                    elapsed: self.started.elapsed(),
                },
                Err(e) => RunResult::Failed {
                    message: e.to_string(),
                },
            },
            Ok(Drive::Cancelled) => RunResult::Cancelled,
            Err(e) => RunResult::Failed {
                message: e.to_string(),
            },
        };

        self.teardown(!matches!(result, RunResult::Success { .. }));

        match &result {
            RunResult::Success { output, elapsed } => {
                info!(
                    "pipeline succeeded: {} frames to '{}' in {:.1}s",
                    self.frames_processed,
                    output.display(),
                    elapsed.as_secs_f64()
                );
            }
            RunResult::Cancelled => info!("pipeline cancelled after {} frames", self.frames_processed),
            RunResult::Failed { message } => warn!("pipeline failed: {message}"),
        }

        if let Some(events) = &self.events {
            events.publish(PipelineEvent::Finished(result.clone()));
        }
        result
    }

    /// The cooperative loop. Every iteration polls cancellation once, then
    /// advances whichever stages have ready work.
    fn drive(&mut self) -> Result<Drive> {
        self.state = PipelineState::Extracting;
        self.last_publish = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Drive::Cancelled);
            }

            // Feed the decoder while the source has unread units.
            if self.state == PipelineState::Extracting
                && self.decoder.try_get_input_slot(self.config.poll_timeout)
            {
                match self.source.next_unit(self.config.poll_timeout)? {
                    Poll::Ready(unit) if unit.eos => {
                        debug!("source exhausted; draining decoder");
                        self.decoder.push_eos()?;
                        self.state = PipelineState::Draining;
                    }
                    Poll::Ready(unit) => self.decoder.push_input(unit)?,
                    Poll::Pending => {}
                }
            }

            if self.state == PipelineState::Finalizing {
                // Keep draining with the longer timeout until the encoder
                // reports end-of-stream.
                self.drain_encoder(self.config.finalize_timeout, usize::MAX)?;
                if self.encoder_eos {
                    return Ok(Drive::Completed);
                }
                continue;
            }

            // Move decoded frames across the bridge, bounded per iteration.
            for _ in 0..self.config.in_flight_frames.max(1) {
                match self.decoder.try_get_output(self.config.poll_timeout)? {
                    Poll::Ready(frame) if frame.eos => {
                        debug!("decoder exhausted; flushing encoder");
                        self.encoder.push_eos()?;
                        self.state = PipelineState::Finalizing;
                        break;
                    }
                    Poll::Ready(frame) => {
                        let pixels = self.bridge.process(&frame)?;
                        // Release the decoder buffer before touching the
                        // encoder; holding it would starve the decoder pool.
                        drop(frame);

                        while !self.encoder.try_get_input_slot(self.config.poll_timeout) {
                            if self.cancel.is_cancelled() {
                                return Ok(Drive::Cancelled);
                            }
                            // The encoder is usually full because its output
                            // side needs draining.
                            self.drain_encoder(self.config.poll_timeout, 1)?;
                        }
                        self.encoder.push_frame(pixels)?;

                        self.frames_processed += 1;
                        if self.frames_processed % self.config.progress_interval.max(1) == 0 {
                            self.publish_progress();
                        }

                        // Always drain at least one encoder output so its
                        // buffer pool cannot fill up and deadlock.
                        self.drain_encoder(self.config.poll_timeout, 1)?;
                    }
                    Poll::Pending => break,
                }
            }
        }
    }

    /// Pull up to `max` units from the encoder and route them to the muxer.
    /// Stops early when the queue is momentarily empty.
    fn drain_encoder(&mut self, timeout: Duration, max: usize) -> Result<()> {
        for _ in 0..max {
            match self.encoder.try_get_output(timeout)? {
                Poll::Ready(unit) if unit.eos => {
                    self.encoder_eos = true;
                    return Ok(());
                }
                Poll::Ready(unit) if unit.is_config => self.handle_config_unit(unit)?,
                Poll::Ready(unit) => {
                    if let Some(pts) = self.muxer.write_sample(&unit)? {
                        debug!("wrote sample {} at pts {pts}us", self.muxer.samples_written());
                    }
                }
                Poll::Pending => return Ok(()),
            }
        }
        Ok(())
    }

    /// Route one codec-configuration unit. The first one is the
    /// output-format-changed event and opens the track; the units that
    /// complete the opening group (a PPS following the SPS) and identical
    /// in-band repeats ahead of later keyframes are ordinary ancillary
    /// writes. A config unit with new parameters after picture data means
    /// the encoder renegotiated its output mid-stream, which this pipeline
    /// never requests.
    fn handle_config_unit(&mut self, unit: EncodedAccessUnit) -> Result<()> {
        if !self.muxer.is_open() {
            self.muxer.open_track(&self.desc, &unit)?;
            self.config_units.push(unit.data);
        } else if self.config_units.iter().any(|c| *c == unit.data) {
            self.muxer.write_sample(&unit)?;
        } else if self.muxer.samples_written() == 0 {
            self.muxer.write_sample(&unit)?;
            self.config_units.push(unit.data);
        } else {
            return Err(KaleidoError::Protocol(
                "output format renegotiated mid-stream".into(),
            ));
        }
        Ok(())
    }

    fn publish_progress(&mut self) {
        let now = Instant::now();
        let span = now.duration_since(self.last_publish);
        if !span.is_zero() {
            let rate =
                (self.frames_processed - self.frames_at_last_publish) as f64 / span.as_secs_f64();
            debug!("processing at {rate:.1} fps");
        }
        self.last_publish = now;
        self.frames_at_last_publish = self.frames_processed;
        if let Some(events) = &self.events {
            events.publish(PipelineEvent::Progress(PipelineProgress {
                frames_processed: self.frames_processed,
                total_frames_estimate: self.desc.total_frames_estimate(),
                elapsed: self.started.elapsed(),
            }));
        }
    }

    /// Idempotent teardown of every stage. Tolerates partially-initialized
    /// state; release failures are logged and never mask the outcome.
    fn teardown(&mut self, discard_output: bool) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if discard_output {
            self.muxer.abort();
        }
        self.source.teardown();
        self.decoder.teardown();
        self.encoder.teardown();
        debug!("pipeline teardown complete");
    }
}

impl<S, D, B, E, M> Drop for Pipeline<S, D, B, E, M>
where
    S: SampleSource,
    D: DecoderStage,
    B: FrameBridge,
    E: EncoderStage,
    M: ContainerSink,
{
    fn drop(&mut self) {
        // Safety net for early returns; a normal run has already torn down
        // and this is a no-op.
        self.teardown(true);
    }
}
