//! Error Module - Scheduler Error Types

use thiserror::Error;

/// Main error type for scheduler operations
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("Stack allocation failed: {0}")]
    StackAllocation(String),

    #[error("Timer thread error: {0}")]
    Timer(String),

    #[error("Thread state error: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Unknown ractor id {0}")]
    UnknownRactor(u64),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("I/O multiplexer error: {0}")]
    Multiplexer(String),
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedError>;
