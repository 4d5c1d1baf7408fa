//! Kaleido: GPU-effect video clip processor
//!
//! Decodes short clips, applies a GPU per-pixel transform, and re-encodes
//! into a fresh container with frame-rate-locked timestamps.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod mux;
pub mod pipeline;
pub mod source;
