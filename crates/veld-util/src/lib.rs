//! Veld Utility Crate - Shared Low-Level Building Blocks
//!
//! Small utilities shared by the runtime core crates:
//!
//! - [`darray`]: Typed dynamic array with a `{size, capacity}` header
//!   immediately preceding an inline data region. Used for page lists
//!   and weak-pointer lists in the collector.
//! - [`poison`]: Debug-build memory poisoning helpers for instrumented
//!   builds. No-ops in release builds.

pub mod darray;
pub mod poison;

pub use darray::DArray;
