//! Malloc Accounting - Off-Heap Memory Pressure
//!
//! Host-side allocate/free/realloc report their deltas here. When the
//! running increase passes the adaptive limit, the next check under the
//! VM lock forces a collection. The limit grows when tripped and decays
//! by 2% otherwise, clamped to its configured band; a separate
//! old-generation estimate feeds the `OLDMALLOC` major trigger.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::logging::GcTrigger;
use crate::space::{major_reason, ObjectSpace};

/// Decay applied to an untripped malloc limit after each cycle.
const MALLOC_LIMIT_DECAY: f64 = 0.98;

/// Atomic counters plus their adaptive limits.
pub struct MallocAccounting {
    /// Bytes allocated since the last cycle (saturating at 0).
    pub malloc_increase: AtomicUsize,
    pub malloc_limit: usize,
    /// Estimated allocation retained by old objects.
    pub oldmalloc_increase: AtomicUsize,
    pub oldmalloc_limit: usize,
}

impl MallocAccounting {
    pub fn new(malloc_limit: usize, oldmalloc_limit: usize) -> Self {
        Self {
            malloc_increase: AtomicUsize::new(0),
            malloc_limit,
            oldmalloc_increase: AtomicUsize::new(0),
            oldmalloc_limit,
        }
    }
}

impl ObjectSpace {
    /// Record a host-side allocation delta. Callable from any thread.
    pub fn adjust_memory_usage(&self, diff: isize) {
        if diff > 0 {
            self.accounting
                .malloc_increase
                .fetch_add(diff as usize, Ordering::Relaxed);
            self.accounting
                .oldmalloc_increase
                .fetch_add(diff as usize, Ordering::Relaxed);
        } else {
            let dec = diff.unsigned_abs();
            // Saturate at zero; frees can outpace tracked allocations.
            let mut current = self.accounting.malloc_increase.load(Ordering::Relaxed);
            loop {
                let next = current.saturating_sub(dec);
                match self.accounting.malloc_increase.compare_exchange_weak(
                    current,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
    }

    /// Check the malloc trigger. Must be called while the caller holds
    /// its scheduler turn (the VM lock).
    pub fn malloc_gc_check(&mut self) {
        let increase = self.accounting.malloc_increase.load(Ordering::Relaxed);
        if increase > self.accounting.malloc_limit && !self.dont_gc {
            self.garbage_collect(GcTrigger::Malloc, false, false, false, false);
        }
    }

    /// Reset and adapt the malloc limits at cycle start.
    pub(crate) fn gc_reset_malloc_info(&mut self, full_mark: bool) {
        let increase = self.accounting.malloc_increase.swap(0, Ordering::Relaxed);

        if increase > self.accounting.malloc_limit {
            let grown = (self.accounting.malloc_limit as f64
                * self.params.malloc_limit_growth_factor) as usize;
            self.accounting.malloc_limit = grown.min(self.params.malloc_limit_max);
        } else if self.accounting.malloc_limit > self.params.malloc_limit_min {
            let decayed = (self.accounting.malloc_limit as f64 * MALLOC_LIMIT_DECAY) as usize;
            self.accounting.malloc_limit = decayed.max(self.params.malloc_limit_min);
        }

        if full_mark {
            // A major cycle resets the old-generation estimate.
            self.accounting.oldmalloc_increase.store(0, Ordering::Relaxed);
            self.accounting.oldmalloc_limit = self.params.oldmalloc_limit_min;
        } else {
            let oldmalloc = self.accounting.oldmalloc_increase.load(Ordering::Relaxed);
            if oldmalloc > self.accounting.oldmalloc_limit {
                self.need_major_gc |= major_reason::OLDMALLOC;
                let grown = (self.accounting.oldmalloc_limit as f64
                    * self.params.oldmalloc_limit_growth_factor)
                    as usize;
                self.accounting.oldmalloc_limit = grown.min(self.params.oldmalloc_limit_max);
            }
        }
    }
}
