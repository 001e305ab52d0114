//! Error Module - Collector Error Types
//!
//! The collector never returns errors to the mutator for internal
//! conditions: it either satisfies a request (possibly after a
//! collection) or aborts. The only error a mutator can observe is
//! `OutOfMemory`. Everything else is API misuse or an internal
//! verification failure.

use thiserror::Error;

/// Main error type for collector operations
#[derive(Debug, Error)]
pub enum GcError {
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Range error: {0}")]
    RangeError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Heap verification failed: {0}")]
    Verification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GcError {
    /// Only OOM is recoverable by the host (it may free memory and retry).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GcError::OutOfMemory { .. })
    }

    /// Whether this error indicates a bug in the collector or its caller.
    pub fn is_bug(&self) -> bool {
        matches!(self, GcError::Verification(_) | GcError::Internal(_))
    }
}

/// Result type alias for collector operations
pub type Result<T> = std::result::Result<T, GcError>;

/// Abort with a collector bug report.
///
/// Debug builds panic immediately with the formatted message; release
/// builds do the same - a failed heap invariant is never continuable.
#[macro_export]
macro_rules! vgc_bug {
    ($($arg:tt)*) => {
        panic!("[vgc bug] {}", format!($($arg)*))
    };
}

/// Assert a heap invariant in debug builds.
#[macro_export]
macro_rules! gc_assert {
    ($cond:expr) => {
        #[cfg(debug_assertions)]
        if !$cond {
            $crate::vgc_bug!("assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        #[cfg(debug_assertions)]
        if !$cond {
            $crate::vgc_bug!("assertion failed: {}: {}", stringify!($cond), format!($($arg)*));
        }
    };
}
