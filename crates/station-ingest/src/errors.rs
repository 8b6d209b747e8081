//! Engine error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Invalid configuration or argument combination.
    #[error("invalid usage: {0}")]
    Usage(String),

    /// Transport failure, annotated with where in the stream it happened.
    #[error("i/o failure ({context}): {source}")]
    IoFailure {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A header that fails sanity checks; counted and recovered as a drop.
    #[error("malformed packet header: {0}")]
    MalformedHeader(&'static str),

    /// Processing mode outside the registered kernel table.
    #[error("processing mode {0} is not supported")]
    ModeUnsupported(i32),

    /// Bit mode outside {4, 8, 16}.
    #[error("bit mode {0} is not supported")]
    BitModeUnsupported(u8),

    /// More of a port's window arrived out of order than the retry could absorb.
    #[error("port {port}: {reordered} of {window} packets arrived out of order")]
    ReorderingExceeded { port: usize, reordered: i64, window: i64 },

    /// The Jones matrix producer went away or delivered a short step.
    #[error("calibration data unavailable: {0}")]
    CalibrationUnavailable(String),

    /// Buffer or transport resource allocation failed during setup.
    #[error("failed to allocate {what}: {detail}")]
    AllocationFailed { what: &'static str, detail: String },

    /// A port consumed its input window without completing the iteration.
    #[error("input buffer exhausted on port {0}")]
    BufferExhausted(usize),
}

impl IngestError {
    /// Wrap an I/O error with stream context ("port 2 at byte 123456").
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        IngestError::IoFailure { context: context.into(), source }
    }
}
