//! Threads - User-Visible Execution Units
//!
//! A `VeldThread` is one user-visible execution. It may be served by a
//! dedicated native thread (DNT, 1:1) or share native threads with other
//! threads of its ractor (SNT, M:N). The `dedicated` counter records how
//! many times the thread has requested exclusive-NT mode; zero means it
//! runs shared.
//!
//! Each thread carries interrupt flags checked at safepoints, an
//! `unblock` callback a waking party uses to break the thread out of a
//! native wait, and a turn latch its scheduler signals to hand it the
//! running turn.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::stack::StackSlice;

/// Interrupt bits, checked at safepoints.
pub mod interrupt {
    /// Time-slice expired; yield at the next safepoint.
    pub const TIMER: u32 = 1 << 0;
    /// A stop-the-world barrier wants this thread parked.
    pub const BARRIER: u32 = 1 << 1;
    /// A pending wakeup (sleep expiry, signal, io readiness).
    pub const PENDING: u32 = 1 << 2;
}

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Waiting,
    Dead,
}

/// Callback that interrupts a thread's native wait.
pub type UnblockFn = Box<dyn Fn() + Send>;

/// One user-visible thread.
pub struct VeldThread {
    pub id: u64,
    pub ractor: u64,

    /// Exclusive-NT requests outstanding; 0 = shared (SNT) mode.
    pub(crate) dedicated: AtomicUsize,
    pub(crate) interrupts: AtomicU32,
    pub(crate) unblock: Mutex<Option<UnblockFn>>,

    pub(crate) state: Mutex<ThreadState>,

    /// Turn latch: the scheduler grants, the thread consumes.
    turn: Mutex<bool>,
    turn_cv: Condvar,

    /// VM stack slice; taken by the thread body while running.
    pub(crate) vm_stack: Mutex<Option<StackSlice>>,
}

impl VeldThread {
    pub(crate) fn new(id: u64, ractor: u64, dedicated: bool, vm_stack: StackSlice) -> Self {
        Self {
            id,
            ractor,
            dedicated: AtomicUsize::new(usize::from(dedicated)),
            interrupts: AtomicU32::new(0),
            unblock: Mutex::new(None),
            state: Mutex::new(ThreadState::Created),
            turn: Mutex::new(false),
            turn_cv: Condvar::new(),
            vm_stack: Mutex::new(Some(vm_stack)),
        }
    }

    /// Whether the thread currently requires a dedicated native thread.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated.load(Ordering::Relaxed) > 0
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    // ========================================================================
    // Interrupts
    // ========================================================================

    /// Raise interrupt bits and fire the registered unblock callback so
    /// a native wait notices.
    pub fn set_interrupt(&self, bits: u32) {
        self.interrupts.fetch_or(bits, Ordering::Release);
        self.call_unblock();
        // A parked thread re-checks its mask when the latch pulses.
        self.turn_cv.notify_all();
    }

    /// Read and clear the given interrupt bits.
    pub fn take_interrupts(&self, bits: u32) -> u32 {
        self.interrupts.fetch_and(!bits, Ordering::AcqRel) & bits
    }

    pub fn has_interrupt(&self, bits: u32) -> bool {
        self.interrupts.load(Ordering::Acquire) & bits != 0
    }

    /// Install the unblock callback for the wait the thread is about to
    /// enter. Passing `None` clears it.
    pub fn register_unblock(&self, f: Option<UnblockFn>) {
        *self.unblock.lock() = f;
    }

    pub(crate) fn call_unblock(&self) {
        if let Some(f) = self.unblock.lock().as_ref() {
            f();
        }
    }

    // ========================================================================
    // Turn latch
    // ========================================================================

    /// Grant the running turn.
    pub(crate) fn grant_turn(&self) {
        let mut granted = self.turn.lock();
        *granted = true;
        self.turn_cv.notify_all();
    }

    /// Block until granted the running turn.
    pub(crate) fn wait_turn(&self) {
        let mut granted = self.turn.lock();
        while !*granted {
            self.turn_cv.wait(&mut granted);
        }
        *granted = false;
    }

    /// Block until granted the turn or woken by an interrupt pulse.
    /// Returns true when the turn was actually granted.
    pub(crate) fn wait_turn_interruptible(&self, timeout: Option<Duration>) -> bool {
        let mut granted = self.turn.lock();
        loop {
            if *granted {
                *granted = false;
                return true;
            }
            if self.has_interrupt(interrupt::PENDING) {
                return false;
            }
            match timeout {
                Some(t) => {
                    if self.turn_cv.wait_for(&mut granted, t).timed_out() {
                        let was = *granted;
                        *granted = false;
                        return was;
                    }
                }
                None => self.turn_cv.wait(&mut granted),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackPool;
    use std::sync::Arc;

    fn test_thread(pool: &Arc<StackPool>) -> VeldThread {
        VeldThread::new(1, 0, false, pool.alloc_slice().unwrap())
    }

    #[test]
    fn test_interrupt_set_and_take() {
        let pool = Arc::new(StackPool::with_sizes(1024 * 1024, 16 * 1024));
        let th = test_thread(&pool);
        assert!(!th.has_interrupt(interrupt::TIMER));
        th.set_interrupt(interrupt::TIMER | interrupt::PENDING);
        assert!(th.has_interrupt(interrupt::TIMER));
        assert_eq!(
            th.take_interrupts(interrupt::TIMER),
            interrupt::TIMER
        );
        assert!(!th.has_interrupt(interrupt::TIMER));
        assert!(th.has_interrupt(interrupt::PENDING));
    }

    #[test]
    fn test_turn_latch_across_threads() {
        let pool = Arc::new(StackPool::with_sizes(1024 * 1024, 16 * 1024));
        let th = Arc::new(VeldThread::new(7, 0, false, pool.alloc_slice().unwrap()));

        let waiter = {
            let th = Arc::clone(&th);
            std::thread::spawn(move || {
                th.wait_turn();
                th.id
            })
        };
        th.grant_turn();
        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn test_unblock_called_on_interrupt() {
        let pool = Arc::new(StackPool::with_sizes(1024 * 1024, 16 * 1024));
        let th = test_thread(&pool);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        th.register_unblock(Some(Box::new(move || {
            hits2.fetch_add(1, Ordering::Relaxed);
        })));
        th.set_interrupt(interrupt::PENDING);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
