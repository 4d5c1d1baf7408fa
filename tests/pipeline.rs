//! End-to-end orchestrator tests against in-memory stages.
//!
//! The real stages wrap external processes and a GPU; these mocks keep the
//! orchestration logic testable on any machine while exercising the same
//! trait surface.

use kaleido::bridge::{BridgeStrategy, FrameBridge};
use kaleido::codec::annexb::{classify_unit, NAL_IDR, NAL_PPS, NAL_SLICE, NAL_SPS};
use kaleido::codec::{DecoderStage, EncoderStage, SurfaceKind};
use kaleido::error::{KaleidoError, Result};
use kaleido::frame::{AccessUnit, DecodedFrame, EncodedAccessUnit};
use kaleido::mux::{pts_for_index, ContainerSink};
use kaleido::pipeline::{
    event_channel, CancelToken, Pipeline, PipelineConfig, PipelineEvent, RunResult,
};
use kaleido::source::{Poll, SampleSource, StreamDescriptor};
use std::collections::VecDeque;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WIDTH: u32 = 4;
const HEIGHT: u32 = 4;

fn descriptor() -> StreamDescriptor {
    StreamDescriptor {
        width: WIDTH,
        height: HEIGHT,
        fps_num: 30,
        fps_den: 1,
        duration_us: 2_000_000,
    }
}

fn temp_output(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("kaleido-orch-test-{name}.mp4"))
}

/// Teardown counters shared across all stages of one pipeline.
#[derive(Default)]
struct StageLog {
    source_teardowns: AtomicUsize,
    decoder_teardowns: AtomicUsize,
    encoder_teardowns: AtomicUsize,
}

struct MockSource {
    desc: StreamDescriptor,
    units: VecDeque<AccessUnit>,
    cancel_after: Option<(usize, CancelToken)>,
    yielded: usize,
    log: Arc<StageLog>,
}

impl MockSource {
    fn with_units(count: usize, log: Arc<StageLog>) -> Self {
        let units = (0..count)
            .map(|_| AccessUnit::new(vec![0, 0, 0, 1, 0x65, 0xaa]))
            .collect();
        Self {
            desc: descriptor(),
            units,
            cancel_after: None,
            yielded: 0,
            log,
        }
    }
}

impl SampleSource for MockSource {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.desc
    }

    fn next_unit(&mut self, _timeout: Duration) -> Result<Poll<AccessUnit>> {
        if let Some((after, token)) = &self.cancel_after {
            if self.yielded >= *after {
                token.cancel();
            }
        }
        self.yielded += 1;
        Ok(Poll::Ready(
            self.units.pop_front().unwrap_or_else(AccessUnit::end_of_stream),
        ))
    }

    fn teardown(&mut self) {
        self.log.source_teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Turns each access-unit into exactly one grey frame.
struct MockDecoder {
    pending: VecDeque<DecodedFrame>,
    decoded: u64,
    log: Arc<StageLog>,
}

impl MockDecoder {
    fn new(log: Arc<StageLog>) -> Self {
        Self {
            pending: VecDeque::new(),
            decoded: 0,
            log,
        }
    }
}

impl DecoderStage for MockDecoder {
    fn try_get_input_slot(&mut self, _timeout: Duration) -> bool {
        true
    }

    fn push_input(&mut self, _unit: AccessUnit) -> Result<()> {
        self.pending.push_back(DecodedFrame {
            width: WIDTH,
            height: HEIGHT,
            pts_us: self.decoded as i64 * descriptor().frame_interval_us(),
            eos: false,
            data: vec![0x7f; (WIDTH * HEIGHT * 4) as usize],
        });
        self.decoded += 1;
        Ok(())
    }

    fn push_eos(&mut self) -> Result<()> {
        self.pending.push_back(DecodedFrame::end_of_stream());
        Ok(())
    }

    fn try_get_output(&mut self, _timeout: Duration) -> Result<Poll<DecodedFrame>> {
        Ok(match self.pending.pop_front() {
            Some(frame) => Poll::Ready(frame),
            None => Poll::Pending,
        })
    }

    fn teardown(&mut self) {
        self.log.decoder_teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockBridge;

impl FrameBridge for MockBridge {
    fn strategy(&self) -> BridgeStrategy {
        BridgeStrategy::BridgedCopy
    }

    fn process(&mut self, frame: &DecodedFrame) -> Result<Vec<u8>> {
        assert_eq!(frame.data.len(), (WIDTH * HEIGHT * 4) as usize);
        Ok(frame.data.clone())
    }
}

/// How the mock encoder emits its parameter sets.
#[derive(Clone, Copy, PartialEq)]
enum ConfigBehavior {
    /// SPS and PPS before the first frame, repeated identically ahead of
    /// every later keyframe, the way an H.264 elementary stream arrives.
    Normal,
    /// The repeat ahead of a later keyframe carries a different SPS.
    Renegotiate,
    /// No parameter sets at all.
    Missing,
}

/// Annex-B unit with the given NAL type in its header byte.
fn nal(nal_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut v = vec![0, 0, 0, 1, nal_type & 0x1f];
    v.extend_from_slice(payload);
    v
}

/// Keyframe every this many frames, with parameter sets in front.
const MOCK_GOP: u64 = 3;

struct MockEncoder {
    behavior: ConfigBehavior,
    outputs: VecDeque<EncodedAccessUnit>,
    frames_in: u64,
    log: Arc<StageLog>,
}

impl MockEncoder {
    fn new(behavior: ConfigBehavior, log: Arc<StageLog>) -> Self {
        Self {
            behavior,
            outputs: VecDeque::new(),
            frames_in: 0,
            log,
        }
    }
}

impl EncoderStage for MockEncoder {
    fn input_surface(&self) -> SurfaceKind {
        SurfaceKind::CpuPipe
    }

    fn try_get_input_slot(&mut self, _timeout: Duration) -> bool {
        true
    }

    fn push_frame(&mut self, _pixels: Vec<u8>) -> Result<()> {
        self.frames_in += 1;
        let keyframe = (self.frames_in - 1) % MOCK_GOP == 0;
        if keyframe && self.behavior != ConfigBehavior::Missing {
            let sps_payload: &[u8] =
                if self.behavior == ConfigBehavior::Renegotiate && self.frames_in > 1 {
                    &[0x64, 0x00, 0x29]
                } else {
                    &[0x64, 0x00, 0x1f]
                };
            self.outputs.push_back(classify_unit(nal(NAL_SPS, sps_payload)));
            self.outputs
                .push_back(classify_unit(nal(NAL_PPS, &[0xe8, 0x43])));
        }
        let slice_type = if keyframe { NAL_IDR } else { NAL_SLICE };
        self.outputs
            .push_back(classify_unit(nal(slice_type, &[0x88, 0x84])));
        Ok(())
    }

    fn push_eos(&mut self) -> Result<()> {
        self.outputs.push_back(EncodedAccessUnit::end_of_stream());
        Ok(())
    }

    fn try_get_output(&mut self, _timeout: Duration) -> Result<Poll<EncodedAccessUnit>> {
        Ok(match self.outputs.pop_front() {
            Some(unit) => Poll::Ready(unit),
            None => Poll::Pending,
        })
    }

    fn teardown(&mut self) {
        self.log.encoder_teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SinkState {
    open: bool,
    finished: bool,
    aborted: bool,
    pts_log: Vec<i64>,
}

/// Sink that creates a real file on open so the discard-on-failure
/// behavior is observable.
struct RecordingSink {
    path: PathBuf,
    fps_num: u32,
    fps_den: u32,
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    fn new(path: PathBuf) -> (Self, Arc<Mutex<SinkState>>) {
        let state = Arc::new(Mutex::new(SinkState::default()));
        (
            Self {
                path,
                fps_num: 0,
                fps_den: 1,
                state: state.clone(),
            },
            state,
        )
    }
}

impl ContainerSink for RecordingSink {
    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn open_track(&mut self, desc: &StreamDescriptor, config: &EncodedAccessUnit) -> Result<()> {
        assert!(config.is_config);
        let mut state = self.state.lock().unwrap();
        if state.open {
            return Err(KaleidoError::Protocol("track opened twice".into()));
        }
        File::create(&self.path)?;
        self.fps_num = desc.fps_num;
        self.fps_den = desc.fps_den;
        state.open = true;
        Ok(())
    }

    fn write_sample(&mut self, unit: &EncodedAccessUnit) -> Result<Option<i64>> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(KaleidoError::Protocol(
                "sample written before track start".into(),
            ));
        }
        if unit.is_frame {
            let pts = pts_for_index(state.pts_log.len() as u64, self.fps_num, self.fps_den);
            state.pts_log.push(pts);
            Ok(Some(pts))
        } else {
            Ok(None)
        }
    }

    fn samples_written(&self) -> u64 {
        self.state.lock().unwrap().pts_log.len() as u64
    }

    fn finish(&mut self) -> Result<()> {
        self.state.lock().unwrap().finished = true;
        Ok(())
    }

    fn abort(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            return;
        }
        state.aborted = true;
        let _ = std::fs::remove_file(&self.path);
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        poll_timeout: Duration::from_millis(1),
        finalize_timeout: Duration::from_millis(1),
        ..Default::default()
    }
}

#[allow(clippy::type_complexity)]
fn build(
    units: usize,
    behavior: ConfigBehavior,
    output: PathBuf,
    cancel: CancelToken,
    config: PipelineConfig,
) -> (
    Pipeline<MockSource, MockDecoder, MockBridge, MockEncoder, RecordingSink>,
    Arc<StageLog>,
    Arc<Mutex<SinkState>>,
) {
    let log = Arc::new(StageLog::default());
    let source = MockSource::with_units(units, log.clone());
    let decoder = MockDecoder::new(log.clone());
    let encoder = MockEncoder::new(behavior, log.clone());
    let (sink, state) = RecordingSink::new(output.clone());
    let pipeline = Pipeline::new(
        source, decoder, MockBridge, encoder, sink, output, config, cancel,
    );
    (pipeline, log, state)
}

#[test]
fn successful_run_writes_rate_locked_timestamps() {
    let output = temp_output("success");
    let (pipeline, _, state) = build(
        10,
        ConfigBehavior::Normal,
        output.clone(),
        CancelToken::new(),
        fast_config(),
    );

    let result = pipeline.run();
    assert!(matches!(result, RunResult::Success { .. }));

    let state = state.lock().unwrap();
    assert!(state.finished);
    assert!(!state.aborted);
    // The timestamp law: index * 1_000_000 / frameRate, full precision kept.
    let expected: Vec<i64> = (0..10i64).map(|i| i * 1_000_000 / 30).collect();
    assert_eq!(state.pts_log, expected);
    assert!(output.exists());
    let _ = std::fs::remove_file(&output);
}

#[test]
fn cancellation_discards_the_partial_output() {
    let output = temp_output("cancel");
    let cancel = CancelToken::new();
    let log = Arc::new(StageLog::default());
    let mut source = MockSource::with_units(50, log.clone());
    source.cancel_after = Some((5, cancel.clone()));
    let decoder = MockDecoder::new(log.clone());
    let encoder = MockEncoder::new(ConfigBehavior::Normal, log);
    let (sink, state) = RecordingSink::new(output.clone());
    let pipeline = Pipeline::new(
        source,
        decoder,
        MockBridge,
        encoder,
        sink,
        output.clone(),
        fast_config(),
        cancel,
    );

    let result = pipeline.run();
    assert_eq!(result, RunResult::Cancelled);

    let state = state.lock().unwrap();
    assert!(state.aborted);
    assert!(!state.finished);
    assert!(!output.exists());
}

#[test]
fn sample_before_format_change_fails_the_run() {
    let output = temp_output("missing-config");
    let (pipeline, _, state) = build(
        5,
        ConfigBehavior::Missing,
        output.clone(),
        CancelToken::new(),
        fast_config(),
    );

    let result = pipeline.run();
    match result {
        RunResult::Failed { message } => assert!(message.contains("before track start")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(state.lock().unwrap().aborted);
    assert!(!output.exists());
}

#[test]
fn mid_stream_parameter_change_fails_the_run() {
    let output = temp_output("renegotiate");
    let (pipeline, _, _) = build(
        5,
        ConfigBehavior::Renegotiate,
        output.clone(),
        CancelToken::new(),
        fast_config(),
    );

    let result = pipeline.run();
    match result {
        RunResult::Failed { message } => assert!(message.contains("renegotiated")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!output.exists());
}

#[test]
fn zero_progress_interval_publishes_every_frame() {
    let output = temp_output("zero-interval");
    let (publisher, events) = event_channel(64);
    let config = PipelineConfig {
        progress_interval: 0,
        ..fast_config()
    };
    let (pipeline, _, _) = build(
        5,
        ConfigBehavior::Normal,
        output.clone(),
        CancelToken::new(),
        config,
    );

    let result = pipeline.with_events(publisher).run();
    assert!(matches!(result, RunResult::Success { .. }));
    let progress: Vec<u64> = events
        .try_iter()
        .filter_map(|event| match event {
            PipelineEvent::Progress(p) => Some(p.frames_processed),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![1, 2, 3, 4, 5]);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn events_end_with_exactly_one_terminal_outcome() {
    let output = temp_output("events");
    let (publisher, events) = event_channel(64);
    let config = PipelineConfig {
        progress_interval: 1,
        ..fast_config()
    };
    let (pipeline, _, _) = build(
        8,
        ConfigBehavior::Normal,
        output.clone(),
        CancelToken::new(),
        config,
    );

    pipeline.with_events(publisher).run();

    let mut progress = Vec::new();
    let mut finished = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::Progress(p) => {
                assert!(finished == 0, "progress after the terminal event");
                progress.push(p.frames_processed);
            }
            PipelineEvent::Finished(r) => {
                assert!(matches!(r, RunResult::Success { .. }));
                finished += 1;
            }
        }
    }
    assert_eq!(finished, 1);
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last(), Some(&8));
    let _ = std::fs::remove_file(&output);
}

#[test]
fn every_stage_is_torn_down_exactly_once() {
    let output = temp_output("teardown");
    let (pipeline, log, _) = build(
        3,
        ConfigBehavior::Normal,
        output.clone(),
        CancelToken::new(),
        fast_config(),
    );

    pipeline.run();

    assert_eq!(log.source_teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(log.decoder_teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(log.encoder_teardowns.load(Ordering::SeqCst), 1);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn runs_are_independent() {
    let output = temp_output("rerun");
    for _ in 0..2 {
        let (pipeline, _, state) = build(
            4,
            ConfigBehavior::Normal,
            output.clone(),
            CancelToken::new(),
            fast_config(),
        );
        assert!(matches!(pipeline.run(), RunResult::Success { .. }));
        assert_eq!(state.lock().unwrap().pts_log.len(), 4);
    }
    let _ = std::fs::remove_file(&output);
}
