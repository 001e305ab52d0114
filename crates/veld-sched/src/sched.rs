//! Per-Ractor Scheduling State
//!
//! One `Sched` per ractor: the FIFO ready queue, the single running
//! thread, and the serving flag (whether the ractor currently holds a
//! shared native thread). At most one thread of a ractor runs at a time;
//! a thread on the ready queue holds no native thread.
//!
//! Lock order, top to bottom: global scheduler lock, then the Sched
//! lock, then per-thread locks. The Sched lock is never taken with a
//! thread lock held.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::thread::VeldThread;

pub(crate) struct SchedInner {
    pub readyq: VecDeque<Arc<VeldThread>>,
    pub running: Option<Arc<VeldThread>>,
    /// Whether this ractor holds a shared NT serving slot.
    pub serving: bool,
    /// Holder of the Sched lock, for lock-discipline checks.
    pub lock_owner: Option<u64>,
}

/// Per-ractor ready/running state.
pub struct Sched {
    pub ractor: u64,
    pub(crate) inner: Mutex<SchedInner>,
}

impl Sched {
    pub(crate) fn new(ractor: u64) -> Arc<Self> {
        Arc::new(Self {
            ractor,
            inner: Mutex::new(SchedInner {
                readyq: VecDeque::new(),
                running: None,
                serving: false,
                lock_owner: None,
            }),
        })
    }

    /// Threads waiting for their turn.
    pub fn ready_count(&self) -> usize {
        self.inner.lock().readyq.len()
    }

    /// Currently running thread id, if any.
    pub fn running_thread(&self) -> Option<u64> {
        self.inner.lock().running.as_ref().map(|t| t.id)
    }

    /// Whether this ractor has nothing to run.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.running.is_none() && inner.readyq.is_empty()
    }
}
