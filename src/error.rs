//! Error taxonomy for the transcode pipeline.
//!
//! Setup errors abort a run before any output is produced; stage errors abort
//! mid-stream and the partial output is discarded. Cancellation is not an
//! error and is reported as its own terminal outcome. Failures during
//! teardown of an already-terminal run are logged and never escalated.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the pipeline and its stages.
#[derive(Debug, Error)]
pub enum KaleidoError {
    /// The input container holds no video track.
    #[error("no video track found in '{}'", path.display())]
    NoVideoTrack { path: PathBuf },

    /// Setup failed before the pipeline could start (probe, codec
    /// configuration, GPU adapter, missing toolkit).
    #[error("setup failed: {0}")]
    Setup(String),

    /// A mid-stream decode/encode/bridge failure. Fatal for the whole run.
    #[error("{stage} stage failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },

    /// The encoder violated the expected output protocol, e.g. a second
    /// format-change event or a sample emitted before the track was opened.
    #[error("encoder protocol violation: {0}")]
    Protocol(String),

    /// Shader compilation or translation failed.
    #[error("shader error: {0}")]
    Shader(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KaleidoError {
    /// Shorthand for a stage failure with a formatted message.
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        KaleidoError::Stage {
            stage,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KaleidoError>;
