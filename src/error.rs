//! Core error taxonomy.
//!
//! Per-item failures (`DetectionTimeout`, `FileNotFound`) are recovered by
//! skipping the item and counting it; `ModelLoadFailure` is sticky until an
//! explicit model reset; only store-level failures abort a running scan.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A model failed to load. Cached and surfaced on every embedding call
    /// until `reset_models()` is invoked.
    #[error("model load failed: {0}")]
    ModelLoadFailure(String),

    /// Face detection exceeded the hard per-image timeout.
    #[error("face detection timed out after {0}s")]
    DetectionTimeout(u64),

    /// The photo file no longer exists on disk.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The photo file exists but could not be decoded.
    #[error("image decode failed: {0}")]
    ImageDecode(String),

    /// A loaded model failed on one input. Recovered by skipping the item.
    #[error("inference failed: {0}")]
    Inference(String),

    /// A non-terminal scan job stopped heartbeating and was reaped.
    #[error("scan job {job_id} is stale (last heartbeat {last_heartbeat})")]
    StaleJob { job_id: i64, last_heartbeat: String },

    /// A stored vector blob has an unexpected length. Similarity against it
    /// scores 0 rather than propagating this error.
    #[error("stored vector has invalid length {got}, expected {expected}")]
    InvalidVectorLength { expected: usize, got: usize },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl CoreError {
    /// Whether a scan batch may continue past this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::DetectionTimeout(_)
                | CoreError::FileNotFound(_)
                | CoreError::ImageDecode(_)
                | CoreError::Inference(_)
                | CoreError::InvalidVectorLength { .. }
        )
    }
}
