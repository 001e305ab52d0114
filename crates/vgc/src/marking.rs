//! Mark Phase - Minor, Major, and Incremental Marking
//!
//! Coloring uses two planes: `mark` and `marking`. White = unmarked;
//! grey = marked and queued (`marking` set); black = marked and scanned.
//!
//! - Minor cycles trace only the remember set (remembered objects plus
//!   uncollectible wb-unprotected ones); old objects keep the "stored
//!   mark" installed by the previous sweep.
//! - Major cycles clear every plane and retrace from roots.
//! - Incremental cycles drain the mark stack in budgeted steps between
//!   allocator refills and finish with a final root scan.
//!
//! Aging happens at mark time: a wb-protected slot gains one age per
//! cycle that marks it, and promotion to OLD registers it as
//! uncollectible.

use crate::heap::bitmap::BITMAP_WORDS;
use crate::logging::GcEvent;
use crate::object::{ObjRef, ObjType, BASE_SLOT_SIZE, HEAP_COUNT, HEAP_PAGE_SIZE, OLD_AGE};
use crate::space::{major_reason, Mode, ObjectSpace};

/// Allocations permitted between two incremental mark steps.
pub const INCREMENTAL_MARK_STEP_ALLOCATIONS: usize = 500;

/// Slots a page can hold at the base slot size (used to convert slot
/// budgets into page budgets).
pub const PAGE_OBJ_LIMIT: usize =
    (HEAP_PAGE_SIZE - std::mem::size_of::<crate::heap::PageBodyHeader>()) / BASE_SLOT_SIZE;

impl ObjectSpace {
    // ========================================================================
    // Public marking API (valid inside mark_roots / mark_children hooks)
    // ========================================================================

    /// Mark one reference.
    pub fn mark(&mut self, obj: ObjRef) {
        if obj.is_special() {
            return;
        }
        if self.during_reference_updating {
            crate::vgc_bug!("mark called during reference updating; use mark_and_move");
        }
        self.gc_mark(obj);
    }

    /// Mark a reference and pin it against compaction.
    pub fn mark_and_pin(&mut self, obj: ObjRef) {
        if obj.is_special() {
            return;
        }
        self.gc_pin(obj);
        self.gc_mark(obj);
    }

    /// Conservatively mark a machine word that may be an interior
    /// pointer. Only valid, slot-aligned addresses of live cells are
    /// marked, and always pinned.
    pub fn mark_maybe(&mut self, word: usize) {
        if !self.page_index.is_pointer_to_heap(word) {
            return;
        }
        let obj = ObjRef(word);
        unsafe {
            match obj.obj_type() {
                ObjType::None | ObjType::Zombie | ObjType::Moved => return,
                _ => {}
            }
        }
        self.mark_and_pin(obj);
    }

    /// Mark a reference, or rewrite it through the forwarding table when
    /// the collector is updating references after compaction.
    pub fn mark_and_move(&mut self, r: &mut ObjRef) {
        if self.during_reference_updating {
            *r = self.location(*r);
        } else {
            self.mark(*r);
        }
    }

    // ========================================================================
    // Mark primitives
    // ========================================================================

    fn gc_mark(&mut self, obj: ObjRef) {
        unsafe {
            if obj.obj_type() == ObjType::None {
                crate::vgc_bug!("try to mark a free cell at {:#x}", obj.as_usize());
            }
        }

        self.check_relation(obj);

        // First marking wins; everything else is a no-op.
        let newly = unsafe {
            !(*self.page_of(obj))
                .mark_bits
                .test_and_set(Self::bit_of(obj))
        };
        if !newly {
            return;
        }

        self.gc_aging(obj);
        self.gc_grey(obj);
    }

    /// Record the object whose children are about to be traced; only an
    /// OLD parent matters for the generational relation.
    pub(crate) fn gc_mark_set_parent(&mut self, obj: ObjRef) {
        self.parent_object = if self.is_old(obj) { obj } else { ObjRef::NULL };
    }

    /// An OLD parent marking a young or shady child keeps its place in
    /// the remember set, so the relation survives the remembered-bit
    /// consumption at minor-GC start.
    fn check_relation(&mut self, obj: ObjRef) {
        let parent = self.parent_object;
        if !parent.is_null() && (self.is_wb_unprotected(obj) || !self.is_old(obj)) {
            self.remember(parent);
        }
    }

    fn gc_grey(&mut self, obj: ObjRef) {
        if self.during_incremental_marking {
            unsafe {
                (*self.page_of(obj)).marking_bits.set(Self::bit_of(obj));
            }
        }
        self.mark_stack.push(obj);
    }

    /// Pin only matters while a compaction cycle may move objects.
    fn gc_pin(&mut self, obj: ObjRef) {
        if !self.during_compacting {
            return;
        }
        unsafe {
            let page = self.page_of(obj);
            if !(*page).pin_bits.test_and_set(Self::bit_of(obj)) {
                (*page).pinned_slots += 1;
            }
        }
    }

    /// Write-barrier mark-from: `parent` is black, `obj` is white; mark
    /// `obj` grey directly so `parent` needs no rescan.
    pub(crate) fn gc_mark_from(&mut self, obj: ObjRef, parent: ObjRef) {
        self.gc_mark_set_parent(parent);
        self.check_relation(obj);
        let newly = unsafe {
            !(*self.page_of(obj))
                .mark_bits
                .test_and_set(Self::bit_of(obj))
        };
        if !newly {
            return;
        }
        self.gc_aging(obj);
        self.gc_grey(obj);
    }

    /// Age a newly marked slot. Disabled entirely when major GCs are
    /// disallowed, so long-lived objects cannot pile up as unreclaimable
    /// OLD generation.
    fn gc_aging(&mut self, obj: ObjRef) {
        if !self.config.rgengc_allow_full_mark {
            return;
        }

        if !self.is_wb_unprotected(obj) {
            if !self.is_old(obj) {
                self.age_inc(obj);
            } else if !self.during_minor_gc {
                // Major marking rebuilds the uncollectible registration
                // for slots that were already OLD.
                if !self.is_uncollectible(obj) {
                    self.set_uncollectible(obj);
                    self.old_objects += 1;
                }
            }
        }

        self.marked_slots += 1;
    }

    pub(crate) fn age_inc(&mut self, obj: ObjRef) {
        let age = self.age_of(obj);
        if age == OLD_AGE {
            crate::vgc_bug!("age_inc: object is already old");
        }
        let age = age + 1;
        unsafe {
            (*self.page_of(obj)).age_bits.set(Self::bit_of(obj), age);
        }
        if age == OLD_AGE {
            self.set_uncollectible(obj);
            self.old_objects += 1;
        }
    }

    pub(crate) fn set_uncollectible(&mut self, obj: ObjRef) {
        unsafe {
            (*self.page_of(obj))
                .uncollectible_bits
                .set(Self::bit_of(obj));
        }
    }

    /// Demote an OLD object back to age 0 (write-barrier unprotect).
    pub(crate) fn demote(&mut self, obj: ObjRef) {
        debug_assert!(self.is_old(obj));
        unsafe {
            let page = self.page_of(obj);
            let bit = Self::bit_of(obj);
            (*page).uncollectible_bits.clear(bit);
            (*page).remembered_bits.clear(bit);
            (*page).age_bits.set(bit, 0);
        }
        self.old_objects -= 1;
    }

    // ========================================================================
    // Phase driver
    // ========================================================================

    /// Marking phase entry. Returns true when marking completed (i.e.
    /// the cycle is not incremental).
    pub(crate) fn gc_marks(&mut self, full: bool) -> bool {
        self.gc_marks_start(full);
        if !self.during_incremental_marking {
            self.gc_marks_rest();
            return true;
        }
        false
    }

    pub(crate) fn gc_marks_start(&mut self, full: bool) {
        self.mode = Mode::Marking;

        if full {
            let incremental_marking_steps =
                self.pooled_slots / INCREMENTAL_MARK_STEP_ALLOCATIONS + 1;
            self.step_slots = (self.marked_slots * 2) / incremental_marking_steps;

            self.during_minor_gc = false;
            self.major_gc_count += 1;
            self.uncollectible_wb_unprotected_objects = 0;
            self.old_objects = 0;
            self.last_major_gc = self.gc_count;
            self.marked_slots = 0;

            for heap_index in 0..HEAP_COUNT {
                self.mark_and_rememberset_clear(heap_index);
                self.heaps[heap_index].drain_pooled_to_free();

                if self.during_compacting {
                    for &page in &self.heaps[heap_index].pages {
                        unsafe {
                            (*page).pinned_slots = 0;
                        }
                    }
                }
            }
        } else {
            self.during_minor_gc = true;
            // Uncollectible objects carry stored marks already.
            self.marked_slots =
                self.old_objects + self.uncollectible_wb_unprotected_objects;
            self.minor_gc_count += 1;

            for heap_index in 0..HEAP_COUNT {
                self.rememberset_mark(heap_index);
            }
        }

        self.parent_object = ObjRef::NULL;
        let hooks = self.hooks();
        hooks.mark_roots(self);
    }

    /// Drain the mark stack to completion and finish the phase.
    pub(crate) fn gc_marks_rest(&mut self) {
        for heap in &mut self.heaps {
            heap.pooled_pages = std::ptr::null_mut();
        }
        self.pooled_slots = 0;

        let incremental = self.during_incremental_marking;
        while !self.mark_stacked_objects(incremental, usize::MAX) {}

        self.gc_marks_finish();
    }

    /// One budgeted incremental step. Returns true when marking finished.
    pub(crate) fn gc_marks_step(&mut self, slots: usize) -> bool {
        debug_assert_eq!(self.mode, Mode::Marking);
        if self.mark_stacked_objects(true, slots) {
            self.gc_marks_finish();
            return true;
        }
        false
    }

    /// Allocator-driven continuation. With free pages in stock, run one
    /// step; otherwise marking is forced to completion.
    pub(crate) fn gc_marks_continue(&mut self, heap_index: usize) -> bool {
        if self.heaps[heap_index].has_free_pages() {
            self.gc_marks_step(self.step_slots)
        } else {
            self.gc_marks_rest();
            true
        }
    }

    /// Pop and scan queued objects. Returns true when the stack emptied
    /// within `budget`.
    fn mark_stacked_objects(&mut self, incremental: bool, budget: usize) -> bool {
        let mut budget = budget;
        let hooks = self.hooks();

        while let Some(obj) = self.mark_stack.pop() {
            if obj.is_undef() {
                continue;
            }

            if incremental {
                unsafe {
                    (*self.page_of(obj)).marking_bits.clear(Self::bit_of(obj));
                }
            }

            self.gc_mark_set_parent(obj);
            hooks.mark_children(self, obj);
            self.parent_object = ObjRef::NULL;

            if incremental {
                budget = budget.saturating_sub(1);
                if budget == 0 {
                    return self.mark_stack.is_empty();
                }
            }
        }
        true
    }

    /// Finish marking: final root scan (incremental), re-trace marked
    /// shady objects, settle weak references, size the next cycle.
    pub(crate) fn gc_marks_finish(&mut self) {
        if self.during_incremental_marking {
            if !self.mark_stack.is_empty() {
                crate::vgc_bug!(
                    "gc_marks_finish: mark stack is not empty ({})",
                    self.mark_stack.len()
                );
            }

            self.parent_object = ObjRef::NULL;
            let hooks = self.hooks();
            hooks.mark_roots(self);
            while !self.mark_stacked_objects(true, usize::MAX) {}

            self.during_incremental_marking = false;
            for heap_index in 0..HEAP_COUNT {
                self.marks_wb_unprotected_objects(heap_index);
            }
        }

        self.update_weak_references();

        // Heap sizing for the next cycle.
        let r_mul = self.caches.len().clamp(1, 8);
        let total_slots = self.total_slot_count();
        let sweep_slots = total_slots.saturating_sub(self.marked_slots);
        let mut max_free_slots =
            (total_slots as f64 * self.params.heap_free_slots_max_ratio) as usize;
        let mut min_free_slots =
            (total_slots as f64 * self.params.heap_free_slots_min_ratio) as usize;
        if min_free_slots < self.params.heap_free_slots * r_mul {
            min_free_slots = self.params.heap_free_slots * r_mul;
        }

        let total_init_slots: usize = self
            .params
            .heap_init_slots
            .iter()
            .map(|s| s * r_mul)
            .sum();
        if max_free_slots < total_init_slots {
            max_free_slots = total_init_slots;
        }

        self.freeable_pages = if sweep_slots > max_free_slots {
            (sweep_slots - max_free_slots) / PAGE_OBJ_LIMIT
        } else {
            0
        };

        let mut full_marking = !self.during_minor_gc;
        if self.allocatable_slots == 0 && sweep_slots < min_free_slots {
            if !full_marking {
                if self.gc_count - self.last_major_gc < OLD_AGE as u64 {
                    full_marking = true;
                } else {
                    self.need_major_gc |= major_reason::NOFREE;
                }
            }
            if full_marking {
                self.heap_allocatable_slots_expand(sweep_slots, total_slots);
            }
        }

        if !self.during_minor_gc {
            let r = self.params.oldobject_limit_factor;
            self.uncollectible_wb_unprotected_objects_limit = std::cmp::max(
                (self.uncollectible_wb_unprotected_objects as f64 * r) as usize,
                (self.old_objects as f64
                    * self.params.uncollectible_wb_unprotected_objects_limit_ratio)
                    as usize,
            );
            self.old_objects_limit = (self.old_objects as f64 * r) as usize;
        }

        if self.uncollectible_wb_unprotected_objects
            > self.uncollectible_wb_unprotected_objects_limit
        {
            self.need_major_gc |= major_reason::SHADY;
        }
        if self.old_objects > self.old_objects_limit {
            self.need_major_gc |= major_reason::OLDGEN;
        }

        self.event_log.record(GcEvent::MarkEnd {
            count: self.gc_count,
            marked_slots: self.marked_slots,
            old_objects: self.old_objects,
        });
    }

    // ========================================================================
    // Remember-set walks
    // ========================================================================

    /// Minor-GC root extension: trace children of every remembered
    /// object and of every uncollectible wb-unprotected object.
    pub(crate) fn rememberset_mark(&mut self, heap_index: usize) {
        let hooks = self.hooks();
        let pages: Vec<*mut crate::heap::HeapPage> =
            self.heaps[heap_index].pages.clone();

        for page in pages {
            unsafe {
                if !((*page).has_remembered_objects
                    || (*page).has_uncollectible_wb_unprotected_objects)
                {
                    continue;
                }

                let mut bits = [0u64; BITMAP_WORDS];
                {
                    let remembered = (*page).remembered_bits.words();
                    let uncollectible = (*page).uncollectible_bits.words();
                    let wb_unprotected = (*page).wb_unprotected_bits.words();
                    for j in 0..BITMAP_WORDS {
                        bits[j] = remembered[j] | (uncollectible[j] & wb_unprotected[j]);
                    }
                }
                (*page).remembered_bits.clear_all();
                (*page).has_remembered_objects = false;

                let body = (*page).body;
                for (j, &word) in bits.iter().enumerate() {
                    let mut word = word;
                    while word != 0 {
                        let bit = word.trailing_zeros() as usize;
                        word &= word - 1;
                        let obj = ObjRef(body + (j * 64 + bit) * BASE_SLOT_SIZE);
                        debug_assert!(!obj.is_free_cell());
                        self.gc_mark_set_parent(obj);
                        hooks.mark_children(self, obj);
                        self.parent_object = ObjRef::NULL;
                    }
                }
            }
        }
    }

    /// Major-GC preparation: forget every mark, pin, remembered and
    /// uncollectible bit so the heap is retraced from scratch.
    pub(crate) fn mark_and_rememberset_clear(&mut self, heap_index: usize) {
        for &page in &self.heaps[heap_index].pages {
            unsafe {
                (*page).mark_bits.clear_all();
                (*page).uncollectible_bits.clear_all();
                (*page).marking_bits.clear_all();
                (*page).remembered_bits.clear_all();
                (*page).pin_bits.clear_all();
                (*page).has_uncollectible_wb_unprotected_objects = false;
                (*page).has_remembered_objects = false;
            }
        }
    }

    /// Incremental finish: marked wb-unprotected objects may reach
    /// younger objects, so their children are re-traced once marking has
    /// otherwise settled.
    pub(crate) fn marks_wb_unprotected_objects(&mut self, heap_index: usize) {
        let hooks = self.hooks();
        let pages: Vec<*mut crate::heap::HeapPage> =
            self.heaps[heap_index].pages.clone();

        for page in pages {
            unsafe {
                let mut bits = [0u64; BITMAP_WORDS];
                {
                    let wb_unprotected = (*page).wb_unprotected_bits.words();
                    let mark = (*page).mark_bits.words();
                    for j in 0..BITMAP_WORDS {
                        bits[j] = wb_unprotected[j] & mark[j];
                    }
                }

                let body = (*page).body;
                for (j, &word) in bits.iter().enumerate() {
                    let mut word = word;
                    while word != 0 {
                        let bit = word.trailing_zeros() as usize;
                        word &= word - 1;
                        let obj = ObjRef(body + (j * 64 + bit) * BASE_SLOT_SIZE);
                        self.gc_mark_set_parent(obj);
                        hooks.mark_children(self, obj);
                        self.parent_object = ObjRef::NULL;
                    }
                }
            }
        }

        // Newly greyed children drain immediately.
        while !self.mark_stacked_objects(false, usize::MAX) {}
    }
}
