//! Sweep Phase - Lazy, Per-Page Reclamation
//!
//! Sweeping walks each page's mark plane: unmarked cells are torn down
//! and threaded back onto the page freelist; fully-empty pages are
//! detached into the global empty-page pool. Budgets keep the phase
//! incremental: a step frees at most `INCREMENTAL_SWEEP_SLOT_COUNT`
//! slots beyond the `INCREMENTAL_SWEEP_POOL_SLOT_COUNT` reserved for
//! incremental-marking progress.
//!
//! After a page is swept, the uncollectible plane is copied into the
//! mark plane: old objects stay "stored-marked" so the next minor cycle
//! treats them as live without retracing.

use veld_util::poison;

use crate::heap::page::HeapPage;
use crate::logging::GcEvent;
use crate::object::{ObjRef, ObjType, FL_FINALIZE, FL_SEEN_OBJ_ID, HEAP_COUNT, HEAP_PAGE_SIZE};
use crate::space::{major_reason, Mode, ObjectSpace};

/// Slots freed per lazy-sweep step before yielding.
pub const INCREMENTAL_SWEEP_SLOT_COUNT: usize = 2048;
/// Free slots reserved on pooled pages per step.
pub const INCREMENTAL_SWEEP_POOL_SLOT_COUNT: usize = 1024;

/// Per-page sweep tally.
#[derive(Default)]
pub(crate) struct SweepContext {
    pub(crate) freed_slots: usize,
    pub(crate) empty_slots: usize,
    pub(crate) final_slots: usize,
}

impl ObjectSpace {
    /// Enter the sweep phase: reset cursors, clear the per-heap free and
    /// pooled lists (sweeping rediscovers them), and flag pages for the
    /// lazy-sweep write barrier interlock.
    pub(crate) fn gc_sweep_start(&mut self) {
        self.mode = Mode::Sweeping;
        self.pooled_slots = 0;

        for heap in &mut self.heaps {
            heap.sweeping_index = if heap.pages.is_empty() { None } else { Some(0) };
            heap.free_pages = std::ptr::null_mut();
            heap.pooled_pages = std::ptr::null_mut();
            heap.freed_slots = 0;
            heap.empty_slots = 0;

            if !self.immediate_sweep {
                for &page in &heap.pages {
                    unsafe {
                        (*page).before_sweep = true;
                    }
                }
            }
        }

        // Allocation caches refilled during incremental marking still
        // hold page freelists; sweeping needs them back.
        self.caches_drain_back();
    }

    /// Sweep one batch of pages for `heap_index`. Returns true when the
    /// heap has free pages afterwards.
    pub(crate) fn gc_sweep_step(&mut self, heap_index: usize) -> bool {
        if self.heaps[heap_index].sweeping_index.is_none() {
            return self.heaps[heap_index].has_free_pages();
        }

        let mut swept_slots = 0usize;
        let mut pooled_slots_this_step = 0usize;

        while let Some(idx) = self.heaps[heap_index].sweeping_index {
            if idx >= self.heaps[heap_index].pages.len() {
                self.heaps[heap_index].sweeping_index = None;
                break;
            }
            let page = self.heaps[heap_index].pages[idx];

            let ctx = self.gc_sweep_page(heap_index, page);
            let free_slots = ctx.freed_slots + ctx.empty_slots;

            let page_total = unsafe { (*page).total_slots };
            if free_slots == page_total && self.heaps[heap_index].compact_cursor.is_none() {
                // No survivors: drain the page to the global empty pool.
                self.detach_page_to_empty_pool(heap_index, idx);
                // The next page slid into this index.
            } else {
                self.heaps[heap_index].sweeping_index = Some(idx + 1);

                if free_slots > 0 {
                    self.heaps[heap_index].freed_slots += ctx.freed_slots;
                    self.heaps[heap_index].empty_slots += ctx.empty_slots;

                    if pooled_slots_this_step < INCREMENTAL_SWEEP_POOL_SLOT_COUNT {
                        self.heaps[heap_index].push_pooled_page(page);
                        self.pooled_slots += free_slots;
                        pooled_slots_this_step += free_slots;
                    } else {
                        self.heaps[heap_index].push_free_page(page);
                        swept_slots += free_slots;
                        if swept_slots > INCREMENTAL_SWEEP_SLOT_COUNT {
                            break;
                        }
                    }
                }
            }

            if self.heaps[heap_index]
                .sweeping_index
                .is_some_and(|i| i >= self.heaps[heap_index].pages.len())
            {
                self.heaps[heap_index].sweeping_index = None;
            }
        }

        if self.heaps[heap_index].sweeping_index.is_none() {
            self.gc_sweep_finish_heap(heap_index);

            if self.heaps.iter().all(|h| h.sweep_done()) {
                self.gc_sweep_finish();
            }
        }

        self.heaps[heap_index].has_free_pages()
    }

    /// Sweep every dead cell on one page.
    pub(crate) fn gc_sweep_page(&mut self, heap_index: usize, page: *mut HeapPage) -> SweepContext {
        let mut ctx = SweepContext::default();
        let hooks = self.hooks();

        unsafe {
            (*page).before_sweep = false;
            (*page).free_slots = 0;

            let total_slots = (*page).total_slots;
            for i in 0..total_slots {
                let addr = (*page).slot_addr(i);
                let obj = ObjRef(addr);
                let bit = crate::heap::num_in_page(addr);

                if (*page).mark_bits.test(bit) {
                    continue;
                }

                match obj.obj_type() {
                    ObjType::None => {
                        // Already threaded on the freelist.
                        ctx.empty_slots += 1;
                    }
                    ObjType::Moved => {
                        if self.during_compacting {
                            crate::vgc_bug!(
                                "swept a forwarding cell while compaction is active"
                            );
                        }
                        (*page).pin_bits.clear(bit);
                        (*page).age_bits.set(bit, 0);
                        if (*page).moved_slots > 0 {
                            (*page).moved_slots -= 1;
                        }
                        crate::object::Slot::make_free(addr, (*page).freelist);
                        (*page).freelist = addr;
                        ctx.empty_slots += 1;
                    }
                    ObjType::Zombie => {
                        // Waiting on the deferred finalizer runner.
                    }
                    _ => {
                        if (*page).wb_unprotected_bits.test(bit) {
                            (*page).wb_unprotected_bits.clear(bit);
                        }
                        (*page).age_bits.set(bit, 0);

                        hooks.event_freeobj(obj);

                        if obj.has_flag(FL_SEEN_OBJ_ID) {
                            self.obj_free_object_id(obj);
                        }
                        hooks.detach_vm_weak_references(obj);

                        if obj.has_flag(FL_FINALIZE) {
                            self.make_zombie(obj, None, 0);
                            ctx.final_slots += 1;
                        } else if hooks.obj_free(obj) {
                            poison::poison_region(
                                addr as *mut u8,
                                (*page).slot_size,
                                poison::POISON_FREED,
                            );
                            crate::object::Slot::make_free(addr, (*page).freelist);
                            (*page).freelist = addr;
                            ctx.freed_slots += 1;
                        } else {
                            // Teardown deferred: the hook zombied it.
                            ctx.final_slots += 1;
                        }
                    }
                }
            }

            if self.heaps[heap_index].compact_cursor.is_none() {
                // Install the stored marks for the next minor cycle.
                let uncollectible = (*page).uncollectible_bits.clone();
                (*page).mark_bits.copy_from(&uncollectible);
            }

            (*page).free_slots = ctx.freed_slots + ctx.empty_slots;
        }

        self.heaps[heap_index].total_freed_objects += ctx.freed_slots as u64;
        ctx
    }

    /// Detach the page at `idx` (fully empty) into the global empty
    /// pool. The page stays registered in the page index until actually
    /// unmapped.
    fn detach_page_to_empty_pool(&mut self, heap_index: usize, idx: usize) {
        let page = self.heaps[heap_index].pages.remove(idx);
        let heap = &mut self.heaps[heap_index];
        heap.total_pages -= 1;
        unsafe {
            heap.total_slots -= (*page).total_slots;

            (*page).start = 0;
            (*page).total_slots = 0;
            (*page).slot_size = 0;
            (*page).free_slots = 0;
            (*page).freelist = 0;

            poison::poison_region(
                ((*page).body + std::mem::size_of::<crate::heap::PageBodyHeader>()) as *mut u8,
                HEAP_PAGE_SIZE - std::mem::size_of::<crate::heap::PageBodyHeader>(),
                poison::POISON_PAGE,
            );

            (*page).free_next = self.empty_pages;
        }
        self.empty_pages = page;
        self.empty_pages_count += 1;
    }

    /// Per-heap sweep epilogue: grow the heap or request a major cycle
    /// when too few slots came back.
    fn gc_sweep_finish_heap(&mut self, heap_index: usize) {
        let (total_slots, swept_slots, empty_slots, freed_slots) = {
            let heap = &self.heaps[heap_index];
            (
                heap.total_slots,
                heap.freed_slots + heap.empty_slots,
                heap.empty_slots,
                heap.freed_slots,
            )
        };

        let init_slots = self.params.heap_init_slots[heap_index];
        let min_free_slots = std::cmp::max(
            (total_slots as f64 * self.params.heap_free_slots_min_ratio) as usize,
            init_slots,
        );

        if swept_slots < min_free_slots && self.allocatable_slots < min_free_slots {
            let mut grow_heap = !self.during_minor_gc;

            if self.during_minor_gc {
                // A heap that freed more than it found empty is growing.
                let is_growth_heap = empty_slots == 0 || freed_slots > empty_slots;

                if self.gc_count - self.last_major_gc < crate::object::OLD_AGE as u64 {
                    grow_heap = true;
                } else if is_growth_heap {
                    self.need_major_gc |= major_reason::NOFREE;
                }
            }

            if grow_heap {
                self.heap_allocatable_slots_expand(swept_slots, total_slots);
            }
        }
    }

    /// Global sweep epilogue: release surplus empty pages, then either
    /// stock the free lists or keep pooled pages for the next
    /// incremental cycle.
    fn gc_sweep_finish(&mut self) {
        self.heap_pages_free_unused_pages();

        let will_be_incremental = self.need_major_gc != 0
            && self.config.rgengc_allow_full_mark
            && !self.dont_incremental;

        let mut freed_total = 0u64;
        for heap in &mut self.heaps {
            freed_total += heap.freed_slots as u64;
            heap.freed_slots = 0;
            heap.empty_slots = 0;

            if !will_be_incremental {
                heap.drain_pooled_to_free();
            }
        }
        if !will_be_incremental {
            self.pooled_slots = 0;
        }

        self.event_log.record(GcEvent::SweepEnd {
            count: self.gc_count,
            freed: freed_total,
            empty_pages: self.empty_pages_count,
        });

        self.mode = Mode::None;

        #[cfg(debug_assertions)]
        if let Err(e) = self.verify_internal_consistency() {
            crate::vgc_bug!("post-sweep verification failed: {}", e);
        }
    }

    /// Drain the whole sweep phase.
    pub(crate) fn gc_sweep_rest(&mut self) {
        for heap_index in 0..HEAP_COUNT {
            while self.heaps[heap_index].sweeping_index.is_some() {
                self.gc_sweep_step(heap_index);
            }
        }
    }

    /// Allocator-driven continuation of lazy sweeping.
    pub(crate) fn gc_sweep_continue(&mut self, sweep_heap_index: usize) {
        for heap_index in 0..HEAP_COUNT {
            if !self.gc_sweep_step(heap_index)
                && heap_index == sweep_heap_index
                && self.empty_pages_count == 0
                && self.allocatable_slots == 0
            {
                // Not allowed to create a new page, so finish sweeping.
                self.gc_sweep_rest();
                break;
            }
        }
    }

    // ========================================================================
    // Page supply
    // ========================================================================

    /// Add one free page to `heap_index` within the growth budget or
    /// from the empty pool. Returns whether a page was added.
    pub(crate) fn heap_page_allocate_and_initialize(
        &mut self,
        heap_index: usize,
    ) -> crate::error::Result<bool> {
        if self.allocatable_slots == 0 && self.empty_pages_count == 0 {
            return Ok(false);
        }

        let page = if self.empty_pages_count > 0 {
            self.heap_page_resurrect(heap_index)
        } else {
            let page = HeapPage::allocate(self.heaps[heap_index].slot_size, heap_index)?;
            self.page_index.insert(page);
            let total = unsafe { (*page).total_slots };
            self.allocatable_slots = self.allocatable_slots.saturating_sub(total);
            page
        };

        self.heaps[heap_index].add_page(page);
        self.heaps[heap_index].push_free_page(page);
        Ok(true)
    }

    /// Add one free page unconditionally (boot growth).
    pub(crate) fn heap_page_allocate_and_initialize_force(
        &mut self,
        heap_index: usize,
    ) -> crate::error::Result<()> {
        let page = if self.empty_pages_count > 0 {
            self.heap_page_resurrect(heap_index)
        } else {
            let page = HeapPage::allocate(self.heaps[heap_index].slot_size, heap_index)?;
            self.page_index.insert(page);
            page
        };
        self.heaps[heap_index].add_page(page);
        self.heaps[heap_index].push_free_page(page);
        Ok(())
    }

    /// Re-stripe a page from the empty pool for `heap_index`.
    fn heap_page_resurrect(&mut self, heap_index: usize) -> *mut HeapPage {
        let page = self.empty_pages;
        debug_assert!(!page.is_null());
        unsafe {
            self.empty_pages = (*page).free_next;
            self.empty_pages_count -= 1;

            poison::unpoison_region(
                ((*page).body + std::mem::size_of::<crate::heap::PageBodyHeader>()) as *mut u8,
                HEAP_PAGE_SIZE - std::mem::size_of::<crate::heap::PageBodyHeader>(),
            );
            (*page).stripe(self.heaps[heap_index].slot_size, heap_index);
        }
        page
    }

    /// Grow the global allocatable-slot budget toward the free-slot goal
    /// ratio.
    pub(crate) fn heap_allocatable_slots_expand(
        &mut self,
        free_slots: usize,
        total_slots: usize,
    ) {
        let goal_ratio = self.params.heap_free_slots_goal_ratio;

        let target_total_slots = if goal_ratio == 0.0 {
            (total_slots as f64 * self.params.growth_factor) as usize
        } else if total_slots == 0 {
            self.params.heap_init_slots.iter().sum()
        } else {
            // Find `f` where free_slots = f * total_slots * goal_ratio.
            let mut f = (total_slots - free_slots.min(total_slots)) as f64
                / ((1.0 - goal_ratio) * total_slots as f64);
            if f > self.params.growth_factor {
                f = self.params.growth_factor;
            }
            if f < 1.0 {
                f = 1.1;
            }
            (f * total_slots as f64) as usize
        };

        let target_total_slots = if self.params.growth_max_slots > 0 {
            target_total_slots.min(total_slots + self.params.growth_max_slots)
        } else {
            target_total_slots
        };

        let extend = target_total_slots.saturating_sub(total_slots);
        self.allocatable_slots += extend;
    }

    /// Unmap empty-pool pages, bounded by the freeable budget computed
    /// at mark finish.
    pub(crate) fn heap_pages_free_unused_pages(&mut self) {
        while self.freeable_pages > 0 && !self.empty_pages.is_null() {
            let page = self.empty_pages;
            unsafe {
                self.empty_pages = (*page).free_next;
                self.empty_pages_count -= 1;
                self.page_index.remove(page);
                HeapPage::free(page);
            }
            self.freeable_pages -= 1;
        }
    }
}
