//! Codec stage wrappers.
//!
//! The platform's asynchronous codecs are modelled as bounded
//! request/response ports: input slots and outputs are polled with short
//! timeouts and never block the orchestrator indefinitely. Each wrapper
//! enforces at most one dequeued-but-unreleased buffer per direction and
//! releases resources on every exit path.

pub mod annexb;
mod decoder;
mod encoder;

pub use decoder::FfmpegDecoder;
pub use encoder::FfmpegEncoder;

use crate::error::Result;
use crate::frame::{AccessUnit, DecodedFrame, EncodedAccessUnit};
use crate::source::Poll;
use std::time::Duration;

/// Where a stage's input surface lives. Decides the bridge strategy: a
/// GPU-shared surface can be rendered to directly, a CPU pipe cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    GpuShared,
    CpuPipe,
}

/// Asynchronous decoder port: encoded access-units in, decoded frames out.
pub trait DecoderStage {
    /// Poll for a free input slot, waiting at most `timeout`.
    fn try_get_input_slot(&mut self, timeout: Duration) -> bool;

    /// Queue one encoded unit. Only valid after a successful slot poll.
    fn push_input(&mut self, unit: AccessUnit) -> Result<()>;

    /// Queue the end-of-stream marker; no further input may follow.
    fn push_eos(&mut self) -> Result<()>;

    /// Poll for a decoded frame. The returned frame is owned by the caller
    /// and must be dropped once consumed to keep the buffer pool moving.
    fn try_get_output(&mut self, timeout: Duration) -> Result<Poll<DecodedFrame>>;

    /// Idempotent resource release.
    fn teardown(&mut self);
}

/// Asynchronous encoder port: drawn frames in via the input surface,
/// encoded access-units out.
pub trait EncoderStage {
    /// What kind of input surface this encoder exposes.
    fn input_surface(&self) -> SurfaceKind;

    /// Poll for a free input slot, waiting at most `timeout`.
    fn try_get_input_slot(&mut self, timeout: Duration) -> bool;

    /// Deliver one drawn RGBA frame onto the input surface.
    fn push_frame(&mut self, pixels: Vec<u8>) -> Result<()>;

    /// Signal end-of-stream; the encoder will flush and emit a final unit
    /// with its end-of-stream flag set.
    fn push_eos(&mut self) -> Result<()>;

    /// Poll for an encoded unit.
    fn try_get_output(&mut self, timeout: Duration) -> Result<Poll<EncodedAccessUnit>>;

    /// Idempotent resource release.
    fn teardown(&mut self);
}
