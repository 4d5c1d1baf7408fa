//! The domain-crossing bridge between decoder output and encoder input.
//!
//! Decoded frames and the encoder's input surface live in different memory
//! domains, so the bridge either renders straight onto the encoder surface
//! (when both share a rendering context) or renders into an intermediate
//! texture and copies through a CPU-visible buffer. The strategy is resolved
//! once at setup by a capability check, never assumed.

mod wgpu_bridge;

pub use wgpu_bridge::{ShaderSource, TransformUniforms, WgpuBridge, MAX_PALETTE};

use crate::codec::SurfaceKind;
use crate::error::Result;
use crate::frame::DecodedFrame;

/// How processed pixels reach the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStrategy {
    /// Render the transform directly onto the encoder's input surface.
    /// Requires the surface to be reachable from the transform's rendering
    /// context.
    DirectSurface,
    /// Render into an intermediate texture and copy through a CPU-readable
    /// buffer. One extra GPU-to-CPU round trip per frame, but works across
    /// disjoint subsystems and delivers every frame.
    BridgedCopy,
}

impl BridgeStrategy {
    /// Pick the strategy the encoder's input surface supports.
    pub fn detect(surface: SurfaceKind) -> Self {
        match surface {
            SurfaceKind::GpuShared => BridgeStrategy::DirectSurface,
            SurfaceKind::CpuPipe => BridgeStrategy::BridgedCopy,
        }
    }
}

/// Applies the per-pixel transform to one decoded frame and yields pixels
/// ready for the encoder's input surface.
pub trait FrameBridge {
    fn strategy(&self) -> BridgeStrategy;

    /// Synchronous from the orchestrator's perspective: when this returns,
    /// the input frame may be released.
    fn process(&mut self, frame: &DecodedFrame) -> Result<Vec<u8>>;
}
