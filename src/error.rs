//! Unified error types for glcast

use thiserror::Error;

/// Main error type for glcast operations
#[derive(Error, Debug)]
pub enum GlcastError {
    /// Stage already running; mutation would race with the capture path
    #[error("already running")]
    AlreadyRunning,

    /// Operation requires state that has not been established yet
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// Requested mode or format is not supported
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Non-blocking operation would have to wait
    #[error("resource busy")]
    Busy,

    /// Requested reservation exceeds buffer capacity
    #[error("no space in buffer")]
    NoSpace,

    /// Memory allocation failed
    #[error("allocation failed: {0}")]
    Allocation(&'static str),

    /// Buffer or pipeline was cancelled
    #[error("cancelled")]
    Cancelled,

    /// I/O error from a downstream sink
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for glcast operations
pub type Result<T> = std::result::Result<T, GlcastError>;

impl GlcastError {
    /// Check if this error allows local recovery (drop the frame, keep going)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GlcastError::Busy | GlcastError::NoSpace | GlcastError::Cancelled
        )
    }
}
