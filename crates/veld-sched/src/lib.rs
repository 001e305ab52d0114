//! # Veld Scheduler - M:N Threads for the Veld Runtime
//!
//! User-visible threads are multiplexed onto native threads, one running
//! thread per ractor, with a global serving-slot budget capped at
//! `max_cpu`. The collector's stop-the-world episodes ride on the
//! scheduler barrier: every other thread parks at a safepoint until the
//! initiator finishes.
//!
//! ## Components
//!
//! - [`scheduler`]: the global scheduler - ractors, serving slots, the
//!   GRQ, the stop-the-world barrier, thread spawning.
//! - [`sched`]: per-ractor ready/running state.
//! - [`thread`]: the user-visible thread object - states, interrupt
//!   flags, the unblock callback, the turn latch.
//! - [`timer`]: the timer thread - time slices, sleepers, signal
//!   forwarding, fd readiness (epoll/poll).
//! - [`stack`]: the slab allocator carving thread VM stacks out of
//!   large mapped chunks with guard pages.
//! - [`hooks`]: thread lifecycle event hooks.
//!
//! ## Quick Start
//!
//! ```no_run
//! use veld_sched::Scheduler;
//!
//! let scheduler = Scheduler::new(4);
//! scheduler.start_timer()?;
//!
//! let ractor = scheduler.create_ractor();
//! let th = scheduler.spawn(ractor, false, |ctx| {
//!     for _ in 0..100 {
//!         ctx.check_safepoint();
//!         ctx.yield_now();
//!     }
//! })?;
//!
//! scheduler.join(&th);
//! scheduler.shutdown();
//! # Ok::<(), veld_sched::SchedError>(())
//! ```

pub mod error;
pub mod hooks;
pub mod sched;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;

pub use error::{Result, SchedError};
pub use hooks::{event, HookFn, HookHandle, HookRegistry};
pub use sched::Sched;
pub use scheduler::{Scheduler, ThreadContext};
pub use stack::{StackPool, StackSlice, DEFAULT_VM_STACK_SIZE, STACK_CHUNK_SIZE};
pub use thread::{interrupt, ThreadState, UnblockFn, VeldThread};
pub use timer::TimerThread;

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
