//! Error types for nano-spec.

use thiserror::Error;

/// Result type alias for nano-spec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-spec.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// A request with this id is already active.
    #[error("request {0} is already active")]
    DuplicateRequest(u64),

    /// No active request with this id.
    #[error("request {0} not found")]
    UnknownRequest(u64),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Performance metrics from different pipelines cannot be merged.
    #[error("generation metrics can be accumulated only for the same pipeline (load time {left} ms vs {right} ms)")]
    MetricsMismatch { left: f32, right: f32 },

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
