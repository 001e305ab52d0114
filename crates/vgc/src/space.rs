//! Object Space - The Collector's Root Object
//!
//! One `ObjectSpace` is the complete GC state for one isolated VM
//! instance: the five sized heaps, the page index, the mark stack, the
//! finalizer and object-id tables, generational and malloc accounting,
//! and the mode flags of the current cycle.
//!
//! Mutators reach the object space only within their scheduler turn, so
//! the phase state lives behind `&mut self`; only the malloc counters are
//! atomic (host allocation hooks run off-turn).
//!
//! GC Cycle Phases:
//! 1. Marking (minor or major, optionally incremental)
//! 2. Sweeping (lazy per-page, optionally with compaction first)
//! 3. None (mutator running; lazy sweep may still be draining)

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::accounting::MallocAccounting;
use crate::cache::{CacheId, HeapCache};
use crate::config::{GcConfig, GcParams};
use crate::error::{GcError, Result};
use crate::heap::page::{page_for_unchecked, HeapPage};
use crate::heap::{num_in_page, PageIndex, SizedHeap};
use crate::logging::{GcEvent, GcEventLog, GcTrigger};
use crate::mark_stack::MarkStack;
use crate::object::{
    moved, ObjRef, ObjType, Slot, FL_WB_PROTECTED, HEAP_COUNT, OLD_AGE,
};
use crate::vm::{FinalizerCallable, VmHooks};

/// Reasons a major GC is required, OR'd together.
pub mod major_reason {
    /// Last sweep left too few free slots.
    pub const NOFREE: u32 = 1 << 0;
    /// Old-object count tripped its limit.
    pub const OLDGEN: u32 = 1 << 1;
    /// Uncollectible wb-unprotected count tripped its limit.
    pub const SHADY: u32 = 1 << 2;
    /// Old-object-backed malloc tripped its limit.
    pub const OLDMALLOC: u32 = 1 << 3;
    /// Explicit request.
    pub const FORCE: u32 = 1 << 4;
}

/// Collector phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    None,
    Marking,
    Sweeping,
    Compacting,
}

/// Snapshot of the last cycle, served by `latest_gc_info`.
#[derive(Debug, Clone, Copy)]
pub struct LatestGcInfo {
    pub full: bool,
    pub major_by: u32,
    pub need_major_by: u32,
    pub gc_by: GcTrigger,
    pub immediate_sweep: bool,
    pub compacting: bool,
}

impl Default for LatestGcInfo {
    fn default() -> Self {
        Self {
            full: false,
            major_by: 0,
            need_major_by: 0,
            gc_by: GcTrigger::Newobj,
            immediate_sweep: false,
            compacting: false,
        }
    }
}

/// Page ordering applied before compaction. Receives the two pages'
/// metadata; pages sorting earlier are drained last (they are the
/// destination side).
pub type PageCompareFn = fn(&HeapPage, &HeapPage) -> std::cmp::Ordering;

/// The whole GC state for one VM instance.
pub struct ObjectSpace {
    pub(crate) params: GcParams,
    pub(crate) config: GcConfig,
    pub(crate) hooks: Arc<dyn VmHooks>,

    pub(crate) heaps: [SizedHeap; HEAP_COUNT],
    pub(crate) page_index: PageIndex,
    /// Drained pages recyclable by any heap, linked through `free_next`.
    pub(crate) empty_pages: *mut HeapPage,
    pub(crate) empty_pages_count: usize,
    /// Global slot budget the heaps may grow by without a full GC.
    pub(crate) allocatable_slots: usize,
    /// Pages the next sweep finish is allowed to unmap.
    pub(crate) freeable_pages: usize,

    pub(crate) caches: Vec<HeapCache>,

    pub(crate) mark_stack: MarkStack,
    pub(crate) marked_slots: usize,
    /// The old object whose children are being traced, if any. Marking
    /// a young or shady child re-remembers it.
    pub(crate) parent_object: ObjRef,
    /// Incremental budget per mark step.
    pub(crate) step_slots: usize,
    /// Free slots sitting on pooled pages (incremental progress stock).
    pub(crate) pooled_slots: usize,

    pub(crate) mode: Mode,
    pub(crate) during_minor_gc: bool,
    pub(crate) during_incremental_marking: bool,
    pub(crate) during_compacting: bool,
    pub(crate) during_reference_updating: bool,
    pub(crate) immediate_sweep: bool,
    pub(crate) dont_gc: bool,
    pub(crate) dont_incremental: bool,
    /// Inside a collector step; allocation here is a fatal bug.
    pub(crate) in_gc: bool,

    pub(crate) old_objects: usize,
    pub(crate) old_objects_limit: usize,
    pub(crate) uncollectible_wb_unprotected_objects: usize,
    pub(crate) uncollectible_wb_unprotected_objects_limit: usize,
    pub(crate) need_major_gc: u32,
    pub(crate) last_major_gc: u64,

    pub(crate) gc_count: u64,
    pub(crate) minor_gc_count: u64,
    pub(crate) major_gc_count: u64,
    pub(crate) latest_gc_info: LatestGcInfo,

    pub(crate) accounting: MallocAccounting,

    pub(crate) finalizer_table: FxHashMap<usize, Vec<FinalizerCallable>>,
    /// Lock-free head of the zombie list, CAS-threaded through the
    /// zombies' `next_zombie` words.
    pub(crate) deferred_final: AtomicUsize,
    pub(crate) finalizing: bool,

    pub(crate) obj_to_id: FxHashMap<usize, u64>,
    /// Built lazily on the first reverse lookup.
    pub(crate) id_to_obj: Option<FxHashMap<u64, usize>>,
    pub(crate) next_object_id: u64,

    /// `&slot` cells registered during the current mark cycle.
    pub(crate) weak_references: Vec<usize>,
    pub(crate) weak_references_count: usize,
    pub(crate) retained_weak_references_count: usize,

    pub(crate) compact_compare: Option<PageCompareFn>,
    pub(crate) moved_objects: usize,
    pub(crate) moved_up_objects: usize,
    pub(crate) moved_down_objects: usize,

    pub(crate) total_time: Duration,
    pub(crate) gc_entered_at: Option<Instant>,

    pub(crate) event_log: GcEventLog,
}

// Raw page pointers are owned exclusively by this object space.
unsafe impl Send for ObjectSpace {}

impl ObjectSpace {
    /// Create an object space. The heaps are empty until `prepare_heap`
    /// (or the first allocation) populates them.
    pub fn new(params: GcParams, config: GcConfig, hooks: Arc<dyn VmHooks>) -> Result<Self> {
        params.validate()?;

        // The masking trick that recovers a page from any interior
        // address requires page bodies to cover whole OS pages.
        let os_page = page_size::get();
        if !os_page.is_power_of_two() || os_page > crate::object::HEAP_PAGE_ALIGN {
            return Err(GcError::Configuration(format!(
                "page alignment {} is smaller than the OS page size {}",
                crate::object::HEAP_PAGE_ALIGN,
                os_page
            )));
        }

        let malloc_limit_min = params.malloc_limit_min;
        let oldmalloc_limit_min = params.oldmalloc_limit_min;

        Ok(Self {
            params,
            config,
            hooks,
            heaps: [
                SizedHeap::new(0),
                SizedHeap::new(1),
                SizedHeap::new(2),
                SizedHeap::new(3),
                SizedHeap::new(4),
            ],
            page_index: PageIndex::new(),
            empty_pages: std::ptr::null_mut(),
            empty_pages_count: 0,
            allocatable_slots: 0,
            freeable_pages: 0,
            caches: Vec::new(),
            mark_stack: MarkStack::new(),
            marked_slots: 0,
            parent_object: ObjRef::NULL,
            step_slots: 0,
            pooled_slots: 0,
            mode: Mode::None,
            during_minor_gc: false,
            during_incremental_marking: false,
            during_compacting: false,
            during_reference_updating: false,
            immediate_sweep: false,
            dont_gc: false,
            dont_incremental: false,
            in_gc: false,
            old_objects: 0,
            old_objects_limit: 0,
            uncollectible_wb_unprotected_objects: 0,
            uncollectible_wb_unprotected_objects_limit: 0,
            need_major_gc: 0,
            last_major_gc: 0,
            gc_count: 0,
            minor_gc_count: 0,
            major_gc_count: 0,
            latest_gc_info: LatestGcInfo::default(),
            accounting: MallocAccounting::new(malloc_limit_min, oldmalloc_limit_min),
            finalizer_table: FxHashMap::default(),
            deferred_final: AtomicUsize::new(0),
            finalizing: false,
            obj_to_id: FxHashMap::default(),
            id_to_obj: None,
            next_object_id: crate::id_table::OBJ_ID_INITIAL,
            weak_references: Vec::new(),
            weak_references_count: 0,
            retained_weak_references_count: 0,
            compact_compare: None,
            moved_objects: 0,
            moved_up_objects: 0,
            moved_down_objects: 0,
            total_time: Duration::ZERO,
            gc_entered_at: None,
            event_log: GcEventLog::default(),
        })
    }

    /// Grow every heap to its configured initial slot count.
    pub fn prepare_heap(&mut self) -> Result<()> {
        for heap_index in 0..HEAP_COUNT {
            while self.heaps[heap_index].total_slots
                < self.params.heap_init_slots[heap_index]
            {
                self.heap_page_allocate_and_initialize_force(heap_index)?;
            }
        }
        Ok(())
    }

    /// Register a per-execution-context allocation cache.
    pub fn create_cache(&mut self) -> CacheId {
        self.caches.push(HeapCache::new());
        self.caches.len() - 1
    }

    pub fn hooks(&self) -> Arc<dyn VmHooks> {
        Arc::clone(&self.hooks)
    }

    // ========================================================================
    // Slot predicates (bitmap-backed)
    // ========================================================================

    /// Page metadata for a heap slot.
    #[inline]
    pub(crate) fn page_of(&self, obj: ObjRef) -> *mut HeapPage {
        debug_assert!(!obj.is_special());
        unsafe { page_for_unchecked(obj.as_usize()) }
    }

    #[inline]
    pub(crate) fn bit_of(obj: ObjRef) -> usize {
        num_in_page(obj.as_usize())
    }

    pub fn is_marked(&self, obj: ObjRef) -> bool {
        unsafe { (*self.page_of(obj)).mark_bits.test(Self::bit_of(obj)) }
    }

    pub fn is_marking(&self, obj: ObjRef) -> bool {
        unsafe { (*self.page_of(obj)).marking_bits.test(Self::bit_of(obj)) }
    }

    pub fn is_pinned(&self, obj: ObjRef) -> bool {
        unsafe { (*self.page_of(obj)).pin_bits.test(Self::bit_of(obj)) }
    }

    pub fn is_uncollectible(&self, obj: ObjRef) -> bool {
        unsafe { (*self.page_of(obj)).uncollectible_bits.test(Self::bit_of(obj)) }
    }

    pub fn is_wb_unprotected(&self, obj: ObjRef) -> bool {
        unsafe { (*self.page_of(obj)).wb_unprotected_bits.test(Self::bit_of(obj)) }
    }

    pub fn is_remembered(&self, obj: ObjRef) -> bool {
        unsafe { (*self.page_of(obj)).remembered_bits.test(Self::bit_of(obj)) }
    }

    pub fn age_of(&self, obj: ObjRef) -> u8 {
        unsafe { (*self.page_of(obj)).age_bits.get(Self::bit_of(obj)) }
    }

    /// An object at the saturated age is OLD.
    pub fn is_old(&self, obj: ObjRef) -> bool {
        self.age_of(obj) == OLD_AGE
    }

    /// Grey during incremental marking: marked and still queued.
    pub fn is_grey(&self, obj: ObjRef) -> bool {
        self.is_marked(obj) && self.is_marking(obj)
    }

    /// Black: marked and fully scanned.
    pub fn is_black(&self, obj: ObjRef) -> bool {
        self.is_marked(obj) && !self.is_marking(obj)
    }

    /// White: not yet reached.
    pub fn is_white(&self, obj: ObjRef) -> bool {
        !self.is_marked(obj)
    }

    /// Slot size of the page holding `obj`.
    pub fn obj_slot_size(&self, obj: ObjRef) -> usize {
        unsafe { (*self.page_of(obj)).slot_size }
    }

    /// The slot sizes of every heap, zero-terminated.
    pub fn heap_sizes(&self) -> [usize; HEAP_COUNT + 1] {
        let mut sizes = [0usize; HEAP_COUNT + 1];
        for (i, heap) in self.heaps.iter().enumerate() {
            sizes[i] = heap.slot_size;
        }
        sizes
    }

    /// Whether `addr` is a valid slot address on a registered page.
    pub fn is_pointer_to_heap(&self, addr: usize) -> bool {
        self.page_index.is_pointer_to_heap(addr)
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate and initialize one object.
    ///
    /// The slot's flags word is `flags | type tag | wb-protection`; `v0`
    /// receives the class word and `v1..v3` the caller's initial values.
    /// May run a full collection on the slow path; fails only when even
    /// that cannot produce a free slot.
    #[allow(clippy::too_many_arguments)]
    pub fn new_obj(
        &mut self,
        cache_id: CacheId,
        klass: usize,
        flags: usize,
        v1: usize,
        v2: usize,
        v3: usize,
        wb_protected: bool,
        alloc_size: usize,
    ) -> Result<ObjRef> {
        if !crate::object::size_allocatable_p(alloc_size) {
            return Err(GcError::RangeError(format!(
                "allocation of {} bytes exceeds the largest slot class",
                alloc_size
            )));
        }
        if self.in_gc {
            crate::vgc_bug!("object allocation during garbage collection phase");
        }

        let heap_index = crate::object::heap_index_for_size(alloc_size);

        if self.config.stress && !self.dont_gc {
            self.garbage_collect(GcTrigger::Newobj, true, true, true, false);
        }

        let obj = match self.caches[cache_id].pop_slot(heap_index) {
            Some(obj) => obj,
            None => self.newobj_slowpath(cache_id, heap_index)?,
        };

        unsafe {
            let slot = obj.slot();
            (*slot).flags = flags | if wb_protected { FL_WB_PROTECTED } else { 0 };
            (*slot).v0 = klass;
            (*slot).v1 = v1;
            (*slot).v2 = v2;
            (*slot).v3 = v3;
        }

        self.heaps[heap_index].total_allocated_objects += 1;
        if self.during_incremental_marking {
            self.caches[cache_id].incremental_mark_step_allocated_slots += 1;
        }

        Ok(obj)
    }

    /// Cache miss: maybe run an incremental mark step, then refill the
    /// cache from the heap.
    fn newobj_slowpath(&mut self, cache_id: CacheId, heap_index: usize) -> Result<ObjRef> {
        if self.during_incremental_marking
            && self.caches[cache_id].incremental_mark_step_allocated_slots
                >= crate::marking::INCREMENTAL_MARK_STEP_ALLOCATIONS
        {
            self.caches[cache_id].incremental_mark_step_allocated_slots = 0;
            self.gc_continue(heap_index);
        }

        let page = self.heap_next_free_page(heap_index)?;
        unsafe {
            self.caches[cache_id].takeover_page(heap_index, page);
        }

        self.caches[cache_id]
            .pop_slot(heap_index)
            .ok_or(GcError::OutOfMemory {
                requested: self.heaps[heap_index].slot_size,
                available: 0,
            })
    }

    /// Pop a page with free slots, preparing the heap if none is ready.
    pub(crate) fn heap_next_free_page(&mut self, heap_index: usize) -> Result<*mut HeapPage> {
        if !self.heaps[heap_index].has_free_pages() {
            self.heap_prepare(heap_index)?;
        }

        self.heaps[heap_index]
            .pop_free_page()
            .ok_or(GcError::OutOfMemory {
                requested: self.heaps[heap_index].slot_size,
                available: 0,
            })
    }

    /// Produce a free page for `heap_index`: finish in-flight GC steps,
    /// grow within budget, or run a full collection.
    pub(crate) fn heap_prepare(&mut self, heap_index: usize) -> Result<()> {
        // Below the boot target, grow unconditionally.
        if self.heaps[heap_index].total_slots < self.params.heap_init_slots[heap_index]
            && self.heaps[heap_index].sweep_done()
        {
            self.heap_page_allocate_and_initialize_force(heap_index)?;
            return Ok(());
        }

        self.gc_continue(heap_index);

        if !self.heaps[heap_index].has_free_pages() {
            self.heap_page_allocate_and_initialize(heap_index)?;
        }

        if !self.heaps[heap_index].has_free_pages() {
            if !self.garbage_collect(GcTrigger::Newobj, false, false, false, false) {
                return Err(GcError::OutOfMemory {
                    requested: self.heaps[heap_index].slot_size,
                    available: 0,
                });
            }

            if self.allocatable_slots == 0 && !self.config.rgengc_allow_full_mark {
                let (freed, total) = {
                    let heap = &self.heaps[heap_index];
                    (heap.freed_slots + heap.empty_slots, heap.total_slots)
                };
                self.heap_allocatable_slots_expand(freed, total);
            }

            self.gc_continue(heap_index);

            if !self.heaps[heap_index].has_free_pages() {
                self.heap_page_allocate_and_initialize(heap_index)?;
            }
            if !self.heaps[heap_index].has_free_pages() {
                return Err(GcError::OutOfMemory {
                    requested: self.heaps[heap_index].slot_size,
                    available: 0,
                });
            }
        }

        Ok(())
    }

    /// Continue incremental marking and lazy sweeping, if in either.
    pub(crate) fn gc_continue(&mut self, heap_index: usize) {
        self.gc_enter();

        if self.during_incremental_marking {
            let finished = self.gc_marks_continue(heap_index);
            if finished {
                self.gc_sweep();
            }
        }

        if !self.heaps[heap_index].has_free_pages() && self.is_lazy_sweeping() {
            self.gc_sweep_continue(heap_index);
        }

        self.gc_exit();
    }

    pub(crate) fn is_lazy_sweeping(&self) -> bool {
        matches!(self.mode, Mode::Sweeping | Mode::Compacting)
            && !self.heaps.iter().all(|h| h.sweep_done())
    }

    // ========================================================================
    // Cycle driver
    // ========================================================================

    /// Run (or schedule) a collection.
    ///
    /// `full` requests a major cycle; `immediate_mark` disables
    /// incremental marking; `immediate_sweep` disables lazy sweeping;
    /// `compact` adds a compaction pass (implies major + immediate
    /// sweep).
    pub fn start(&mut self, full: bool, immediate_mark: bool, immediate_sweep: bool, compact: bool) {
        if compact || full {
            self.need_major_gc |= major_reason::FORCE;
        }
        self.garbage_collect(GcTrigger::Method, full, immediate_mark, immediate_sweep, compact);
    }

    /// The cycle entry point. Returns false when collection is disabled.
    pub(crate) fn garbage_collect(
        &mut self,
        trigger: GcTrigger,
        requested_full: bool,
        immediate_mark: bool,
        mut immediate_sweep: bool,
        compact: bool,
    ) -> bool {
        if self.dont_gc {
            return false;
        }

        self.gc_enter();

        // Finish whatever cycle is still draining.
        self.gc_rest();

        // Caches hold page freelists; drain them back so sweeping and
        // compaction see true counts.
        self.caches_drain_back();

        let major_by = self.need_major_gc;
        let mut full = requested_full || major_by != 0;
        if !self.config.rgengc_allow_full_mark {
            full = false;
        } else {
            self.need_major_gc = 0;
        }

        let compacting = full && (compact || self.config.auto_compact);
        if compacting {
            immediate_sweep = true;
        }

        self.during_compacting = compacting;
        self.during_incremental_marking =
            full && !immediate_mark && !self.dont_incremental;
        self.immediate_sweep = immediate_sweep;

        self.gc_reset_malloc_info(full);

        self.gc_count += 1;
        self.latest_gc_info = LatestGcInfo {
            full,
            major_by: if full { major_by } else { 0 },
            need_major_by: self.need_major_gc,
            gc_by: trigger,
            immediate_sweep,
            compacting,
        };
        self.event_log.record(GcEvent::CycleStart {
            count: self.gc_count,
            full,
            trigger,
            immediate_sweep,
        });

        let marking_finished = self.gc_marks(full);
        if marking_finished {
            self.gc_sweep();
        }

        self.gc_exit();
        true
    }

    /// The collector's current phase.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Complete any in-flight marking and sweeping.
    pub fn gc_rest(&mut self) {
        if self.during_incremental_marking {
            self.gc_marks_rest();
            self.gc_sweep();
        }
        if self.is_lazy_sweeping() {
            self.gc_sweep_rest();
        }
    }

    /// Sweep phase entry: start, optional compaction, optional immediate
    /// drain.
    pub(crate) fn gc_sweep(&mut self) {
        self.gc_sweep_start();
        if self.during_compacting {
            self.gc_sweep_compact();
        }
        if self.immediate_sweep {
            self.gc_sweep_rest();
        }
    }

    pub(crate) fn gc_enter(&mut self) {
        if self.gc_entered_at.is_none() {
            self.in_gc = true;
            self.gc_entered_at = Some(Instant::now());
        }
    }

    pub(crate) fn gc_exit(&mut self) {
        if let Some(entered) = self.gc_entered_at.take() {
            self.in_gc = false;
            if self.config.measure_total_time {
                self.total_time += entered.elapsed();
            }
            if self.mode == Mode::None {
                self.event_log.record(GcEvent::CycleEnd {
                    count: self.gc_count,
                    duration: entered.elapsed(),
                });
            }
        }
    }

    /// Return every cache's taken-over freelist to its page.
    pub(crate) fn caches_drain_back(&mut self) {
        for cache_id in 0..self.caches.len() {
            for heap_index in 0..HEAP_COUNT {
                let (page, mut freelist) = self.caches[cache_id].release(heap_index);
                if page.is_null() {
                    continue;
                }
                unsafe {
                    while freelist != 0 {
                        let next = Slot::free_next(freelist);
                        (*page).add_free_slot(freelist);
                        freelist = next;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Forwarding (the read barrier)
    // ========================================================================

    /// The read barrier: resolve a reference that may point at a
    /// vacated cell.
    ///
    /// A read landing on a compaction-locked page invalidates that
    /// page's moves first - every object returns to its original cell
    /// and the page unlocks - so the caller continues with the address
    /// it already holds. On unlocked pages the reference heals through
    /// the forwarding cell. The collector unlocks all drained pages
    /// before its own reference-update pass, so only reads taken during
    /// the compaction window (host teardown callbacks, stray interior
    /// references) can trip the invalidation path.
    pub fn location(&mut self, obj: ObjRef) -> ObjRef {
        if obj.is_special() {
            return obj;
        }
        let page = self.page_of(obj);
        unsafe {
            if (*page).locked_for_compaction {
                self.invalidate_moved_page(page);
                (*page).locked_for_compaction = false;
                return obj;
            }
            if obj.obj_type() == ObjType::Moved {
                moved::destination(obj)
            } else {
                obj
            }
        }
    }

    // ========================================================================
    // Iteration and verification
    // ========================================================================

    /// Visit every non-free slot.
    pub fn each_object(&self, mut f: impl FnMut(ObjRef)) {
        for page in self.page_index.iter() {
            unsafe {
                for i in 0..(*page).total_slots {
                    let obj = ObjRef((*page).slot_addr(i));
                    if !obj.is_free_cell() {
                        f(obj);
                    }
                }
            }
        }
    }

    /// Live objects across all heaps (allocated − freed − finalizing).
    pub fn live_slot_count(&self) -> u64 {
        self.heaps
            .iter()
            .map(|h| {
                h.total_allocated_objects
                    .saturating_sub(h.total_freed_objects)
                    .saturating_sub(h.final_slots_count as u64)
            })
            .sum()
    }

    pub fn total_slot_count(&self) -> usize {
        self.heaps.iter().map(|h| h.total_slots).sum()
    }

    /// Full heap verification. Checks page registration, bitmap/counter
    /// agreement, and (outside of sweeping) allocation conservation.
    pub fn verify_internal_consistency(&self) -> Result<()> {
        for heap in &self.heaps {
            for &page in &heap.pages {
                unsafe {
                    let p = &*page;
                    if p.body & crate::object::HEAP_PAGE_ALIGN_MASK != 0 {
                        return Err(GcError::Verification(format!(
                            "page body {:#x} is not aligned",
                            p.body
                        )));
                    }
                    if page_for_unchecked(p.start) != page {
                        return Err(GcError::Verification(
                            "page header back-pointer mismatch".to_string(),
                        ));
                    }
                    if p.mark_bits.count() > p.total_slots {
                        return Err(GcError::Verification(format!(
                            "page has {} mark bits for {} slots",
                            p.mark_bits.count(),
                            p.total_slots
                        )));
                    }
                    let remembered_empty = p.remembered_bits.is_empty();
                    if p.has_remembered_objects && remembered_empty && self.mode == Mode::None {
                        return Err(GcError::Verification(
                            "has_remembered_objects set on page with empty plane".to_string(),
                        ));
                    }
                    if !p.has_remembered_objects && !remembered_empty {
                        return Err(GcError::Verification(
                            "remembered bits set on page without flag".to_string(),
                        ));
                    }
                    // A freelist the cache has not taken over must agree
                    // with the free count.
                    if p.freelist != 0 {
                        let mut n = 0usize;
                        let mut cursor = p.freelist;
                        while cursor != 0 {
                            n += 1;
                            if n > p.total_slots {
                                return Err(GcError::Verification(
                                    "freelist cycle detected".to_string(),
                                ));
                            }
                            cursor = Slot::free_next(cursor);
                        }
                        if n != p.free_slots {
                            return Err(GcError::Verification(format!(
                                "freelist length {} != free_slots {}",
                                n, p.free_slots
                            )));
                        }
                    }
                }
            }
        }

        if self.mode == Mode::None {
            let mut counted_live = 0u64;
            self.each_object(|obj| unsafe {
                let ty = obj.obj_type();
                if ty != ObjType::Moved && ty != ObjType::Zombie {
                    counted_live += 1;
                }
            });
            let accounted = self.live_slot_count();
            if counted_live != accounted {
                return Err(GcError::Verification(format!(
                    "live slot walk found {} objects, counters say {}",
                    counted_live, accounted
                )));
            }
        }

        Ok(())
    }

    // ========================================================================
    // Runtime switches
    // ========================================================================

    pub fn gc_count(&self) -> u64 {
        self.gc_count
    }

    pub fn stress_get(&self) -> bool {
        self.config.stress
    }

    pub fn stress_set(&mut self, stress: bool) {
        self.config.stress = stress;
    }

    pub fn config_get(&self) -> &GcConfig {
        &self.config
    }

    /// Update runtime switches. Disabling `rgengc_allow_full_mark`
    /// suppresses major GC; pending major reasons are kept for when it is
    /// re-enabled.
    pub fn config_set(&mut self, config: GcConfig) {
        self.config = config;
    }

    pub fn gc_disable(&mut self) {
        self.gc_rest();
        self.dont_gc = true;
    }

    pub fn gc_enable(&mut self) {
        self.dont_gc = false;
    }

    pub fn get_measure_total_time(&self) -> bool {
        self.config.measure_total_time
    }

    pub fn set_measure_total_time(&mut self, measure: bool) {
        self.config.measure_total_time = measure;
    }

    pub fn get_total_time(&self) -> Duration {
        self.total_time
    }

    /// Install a page ordering for the next compaction.
    pub fn set_compact_compare(&mut self, compare: Option<PageCompareFn>) {
        self.compact_compare = compare;
    }

    pub fn event_log(&self) -> &GcEventLog {
        &self.event_log
    }
}

impl Drop for ObjectSpace {
    fn drop(&mut self) {
        // Reclaim every mapped page. Finalizers that never ran are the
        // host's shutdown concern (`run_all_finalizers`).
        unsafe {
            let mut empty = self.empty_pages;
            while !empty.is_null() {
                let next = (*empty).free_next;
                HeapPage::free(empty);
                empty = next;
            }
            for heap in &mut self.heaps {
                for &page in &heap.pages {
                    HeapPage::free(page);
                }
                heap.pages.clear();
            }
        }
    }
}
