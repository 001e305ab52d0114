//! Compaction - Two-Cursor Object Movement
//!
//! Per heap, two cursors walk toward each other: the sweep cursor from
//! the front of the page list frees destination slots, the compact
//! cursor from the tail drains source pages. Every moved object leaves a
//! `Moved` forwarding cell behind; its GC bits travel with it.
//!
//! Drained source pages are locked. A mutator that touches a locked page
//! goes through the read barrier, which invalidates that page's moves:
//! each object is copied back to its original cell and the destination
//! slot is freed. Pages that stay untouched are healed wholesale by the
//! reference-updating pass, after which no live reference reaches a
//! `Moved` cell and the locks come off.

use crate::heap::page::HeapPage;
use crate::logging::GcEvent;
use crate::object::{
    moved, ObjRef, ObjType, Slot, FL_SEEN_OBJ_ID, HEAP_COUNT, OLD_AGE,
};
use crate::space::{Mode, ObjectSpace};

/// Bits gc_move carries from the source cell to the destination.
struct MovedBits {
    marked: bool,
    wb_unprotected: bool,
    uncollectible: bool,
    remembered: bool,
    age: u8,
}

impl ObjectSpace {
    /// Whether `heap_index`'s cursors have met (compaction of that heap
    /// is complete).
    fn compact_cursors_met(&self, heap_index: usize) -> bool {
        let heap = &self.heaps[heap_index];
        match (heap.sweeping_index, heap.compact_cursor) {
            (Some(s), Some(c)) => s >= c,
            _ => true,
        }
    }

    /// The compaction driver, run at sweep start of a compacting cycle.
    pub(crate) fn gc_sweep_compact(&mut self) {
        self.gc_compact_start();

        loop {
            let mut all_met = true;
            for heap_index in 0..HEAP_COUNT {
                if self.heaps[heap_index].total_pages == 0 || self.compact_cursors_met(heap_index)
                {
                    continue;
                }
                all_met = false;

                let cursor = self.heaps[heap_index].compact_cursor.unwrap();
                let page = self.heaps[heap_index].pages[cursor];

                let drained = self.gc_compact_page(heap_index, page);

                // Whether fully drained or stopped short, the page has
                // forwarding cells now; lock it against stray access.
                unsafe {
                    (*page).locked_for_compaction = true;
                }

                if drained {
                    let heap = &mut self.heaps[heap_index];
                    heap.compact_cursor = if cursor == 0 { None } else { Some(cursor - 1) };
                }
            }
            if all_met {
                break;
            }
        }

        self.gc_compact_finish();
    }

    /// Enter compaction: order pages, reset counters, aim the cursors.
    fn gc_compact_start(&mut self) {
        self.mode = Mode::Compacting;
        self.moved_objects = 0;
        self.moved_up_objects = 0;
        self.moved_down_objects = 0;

        let compare = self.compact_compare.unwrap_or(compare_pinned_slots);

        for heap in &mut self.heaps {
            // Ascending comparator order, reversed: the most-movable
            // pages land at the tail, where the compact cursor drains
            // first.
            heap.pages
                .sort_by(|&a, &b| unsafe { compare(&*a, &*b) });
            heap.pages.reverse();

            heap.compact_cursor = if heap.pages.is_empty() {
                None
            } else {
                Some(heap.pages.len() - 1)
            };
        }
    }

    /// Move every movable object off `page`. Returns false when a
    /// destination heap's cursors met mid-page (the remainder stays).
    fn gc_compact_page(&mut self, heap_index: usize, page: *mut HeapPage) -> bool {
        let total = unsafe { (*page).total_slots };
        for i in 0..total {
            let addr = unsafe { (*page).slot_addr(i) };
            let obj = ObjRef(addr);
            let bit = crate::heap::num_in_page(addr);

            let movable = unsafe {
                (*page).mark_bits.test(bit)
                    && !(*page).pin_bits.test(bit)
                    && !matches!(
                        obj.obj_type(),
                        ObjType::None | ObjType::Moved | ObjType::Zombie
                    )
            };
            if !movable {
                continue;
            }

            if !self.gc_compact_move(heap_index, obj) {
                return false;
            }
        }
        true
    }

    /// Move one object to its preferred size class. Returns false when
    /// this heap's own cursors met (stop compacting the page).
    fn gc_compact_move(&mut self, heap_index: usize, src: ObjRef) -> bool {
        let hooks = self.hooks();

        let optimal = hooks.obj_optimal_size(src);
        let mut dest_heap_index = if optimal != 0 && crate::object::size_allocatable_p(optimal) {
            crate::object::heap_index_for_size(optimal)
        } else {
            heap_index
        };

        if self.compact_cursors_met(dest_heap_index) {
            return dest_heap_index != heap_index;
        }

        let orig_shape = unsafe { src.shape_id() };
        let mut new_shape = orig_shape;
        if dest_heap_index != heap_index {
            new_shape = hooks.rebuild_shape(src, dest_heap_index);
            if new_shape == 0 {
                dest_heap_index = heap_index;
                new_shape = orig_shape;
            }
        }

        loop {
            if let Some(dest) = self.try_take_free_slot(dest_heap_index) {
                self.gc_move(src, dest, heap_index, dest_heap_index, orig_shape);
                if new_shape != orig_shape {
                    unsafe {
                        dest.set_shape_id(new_shape);
                    }
                }
                return true;
            }

            // Free the destination heap's next page on the sweeping side.
            let Some(sweep_idx) = self.heaps[dest_heap_index].sweeping_index else {
                return dest_heap_index != heap_index;
            };
            let sweep_page = self.heaps[dest_heap_index].pages[sweep_idx];
            let ctx = self.gc_sweep_page(dest_heap_index, sweep_page);
            if ctx.freed_slots + ctx.empty_slots > 0 {
                self.heaps[dest_heap_index].push_free_page(sweep_page);
            }
            let next = sweep_idx + 1;
            self.heaps[dest_heap_index].sweeping_index =
                if next >= self.heaps[dest_heap_index].pages.len() {
                    None
                } else {
                    Some(next)
                };

            if self.compact_cursors_met(dest_heap_index) {
                return dest_heap_index != heap_index;
            }
        }
    }

    /// Pop one free slot from the destination heap's free pages.
    fn try_take_free_slot(&mut self, heap_index: usize) -> Option<ObjRef> {
        loop {
            let page = self.heaps[heap_index].free_pages;
            if page.is_null() {
                return None;
            }
            unsafe {
                if (*page).freelist == 0 {
                    self.heaps[heap_index].pop_free_page();
                    continue;
                }
                let addr = (*page).freelist;
                (*page).freelist = Slot::free_next(addr);
                (*page).free_slots -= 1;
                return Some(ObjRef(addr));
            }
        }
    }

    /// Move `src` into `dest`: copy the payload, carry the GC bits,
    /// leave a pinned forwarding cell behind.
    fn gc_move(
        &mut self,
        src: ObjRef,
        dest: ObjRef,
        src_heap_index: usize,
        dest_heap_index: usize,
        orig_shape: u32,
    ) {
        debug_assert!(!self.is_marking(src));

        let src_page = self.page_of(src);
        let dest_page = self.page_of(dest);
        let src_bit = Self::bit_of(src);
        let dest_bit = Self::bit_of(dest);

        unsafe {
            let bits = MovedBits {
                marked: (*src_page).mark_bits.test(src_bit),
                wb_unprotected: (*src_page).wb_unprotected_bits.test(src_bit),
                uncollectible: (*src_page).uncollectible_bits.test(src_bit),
                remembered: (*src_page).remembered_bits.test(src_bit),
                age: (*src_page).age_bits.get(src_bit),
            };

            (*src_page).mark_bits.clear(src_bit);
            (*src_page).wb_unprotected_bits.clear(src_bit);
            (*src_page).uncollectible_bits.clear(src_bit);
            (*src_page).remembered_bits.clear(src_bit);

            if src.has_flag(FL_SEEN_OBJ_ID) {
                self.move_object_id(src, dest);
            }

            let copy = (*src_page).slot_size.min((*dest_page).slot_size);
            std::ptr::copy_nonoverlapping(
                src.as_usize() as *const u8,
                dest.as_usize() as *mut u8,
                copy,
            );

            std::ptr::write_bytes(src.as_usize() as *mut u8, 0, (*src_page).slot_size);
            (*src_page).age_bits.set(src_bit, 0);

            if bits.remembered {
                (*dest_page).remembered_bits.set(dest_bit);
                (*dest_page).has_remembered_objects = true;
            } else {
                (*dest_page).remembered_bits.clear(dest_bit);
            }
            if bits.marked {
                (*dest_page).mark_bits.set(dest_bit);
            } else {
                (*dest_page).mark_bits.clear(dest_bit);
            }
            if bits.wb_unprotected {
                (*dest_page).wb_unprotected_bits.set(dest_bit);
            } else {
                (*dest_page).wb_unprotected_bits.clear(dest_bit);
            }
            if bits.uncollectible {
                (*dest_page).uncollectible_bits.set(dest_bit);
            } else {
                (*dest_page).uncollectible_bits.clear(dest_bit);
            }
            (*dest_page).age_bits.set(dest_bit, bits.age.min(OLD_AGE));

            moved::install(src, dest, orig_shape);

            // The forwarding cell stays put until it is healed or swept.
            if !(*src_page).pin_bits.test_and_set(src_bit) {
                (*src_page).pinned_slots += 1;
            }
            (*src_page).moved_slots += 1;
        }

        self.heaps[src_heap_index].total_freed_objects += 1;
        self.heaps[dest_heap_index].total_allocated_objects += 1;
        self.moved_objects += 1;
        if dest_heap_index > src_heap_index {
            self.moved_up_objects += 1;
        } else if dest_heap_index < src_heap_index {
            self.moved_down_objects += 1;
        }
    }

    /// Undo every move whose source is on `page`: the read-barrier path
    /// for a mutator touching a locked page.
    pub(crate) fn invalidate_moved_page(&mut self, page: *mut HeapPage) {
        unsafe {
            let total = (*page).total_slots;
            for i in 0..total {
                let addr = (*page).slot_addr(i);
                let fwd = ObjRef(addr);
                if fwd.is_free_cell() || fwd.obj_type() != ObjType::Moved {
                    continue;
                }

                let dest = moved::destination(fwd);
                let orig_shape = moved::original_shape_id(fwd);
                let dest_page = self.page_of(dest);
                let dest_bit = Self::bit_of(dest);
                let src_bit = Self::bit_of(fwd);

                let bits = MovedBits {
                    marked: (*dest_page).mark_bits.test(dest_bit),
                    wb_unprotected: (*dest_page).wb_unprotected_bits.test(dest_bit),
                    uncollectible: (*dest_page).uncollectible_bits.test(dest_bit),
                    remembered: (*dest_page).remembered_bits.test(dest_bit),
                    age: (*dest_page).age_bits.get(dest_bit),
                };

                if dest.has_flag(FL_SEEN_OBJ_ID) {
                    self.move_object_id(dest, fwd);
                }

                // Copy the object home again.
                let copy = (*dest_page).slot_size.min((*page).slot_size);
                std::ptr::copy_nonoverlapping(
                    dest.as_usize() as *const u8,
                    addr as *mut u8,
                    copy,
                );
                fwd.set_shape_id(orig_shape);

                if bits.marked {
                    (*page).mark_bits.set(src_bit);
                }
                if bits.wb_unprotected {
                    (*page).wb_unprotected_bits.set(src_bit);
                }
                if bits.uncollectible {
                    (*page).uncollectible_bits.set(src_bit);
                }
                if bits.remembered {
                    (*page).remembered_bits.set(src_bit);
                    (*page).has_remembered_objects = true;
                }
                (*page).age_bits.set(src_bit, bits.age);
                (*page).pin_bits.clear(src_bit);

                // Free the abandoned destination cell.
                (*dest_page).mark_bits.clear(dest_bit);
                (*dest_page).wb_unprotected_bits.clear(dest_bit);
                (*dest_page).uncollectible_bits.clear(dest_bit);
                (*dest_page).remembered_bits.clear(dest_bit);
                (*dest_page).age_bits.set(dest_bit, 0);
                Slot::make_free(dest.as_usize(), (*dest_page).freelist);
                (*dest_page).freelist = dest.as_usize();
                (*dest_page).free_slots += 1;

                let dest_heap = (*dest_page).heap_index;
                let src_heap = (*page).heap_index;
                self.heaps[dest_heap].total_allocated_objects =
                    self.heaps[dest_heap].total_allocated_objects.saturating_sub(1);
                self.heaps[src_heap].total_freed_objects =
                    self.heaps[src_heap].total_freed_objects.saturating_sub(1);
                self.moved_objects = self.moved_objects.saturating_sub(1);

                (*page).moved_slots -= 1;
            }
            debug_assert_eq!((*page).moved_slots, 0);
        }
    }

    /// Exit compaction: unlock the drained pages, then heal every
    /// reference. The unlock comes first so the update pass reads
    /// forwarding cells instead of tripping page invalidation; the
    /// continuing sweep reclaims the forwarding cells afterwards.
    fn gc_compact_finish(&mut self) {
        for heap in &mut self.heaps {
            for &page in &heap.pages {
                unsafe {
                    (*page).locked_for_compaction = false;
                }
            }
            heap.compact_cursor = None;
        }

        self.gc_update_references();

        self.during_compacting = false;

        self.event_log.record(GcEvent::CompactEnd {
            count: self.gc_count,
            moved_objects: self.moved_objects,
            moved_up: self.moved_up_objects,
            moved_down: self.moved_down_objects,
        });
    }

    /// Rewrite every live reference through the forwarding cells: each
    /// live object's fields, the collector's own tables, and the host's
    /// weak tables.
    pub(crate) fn gc_update_references(&mut self) {
        self.during_reference_updating = true;
        let hooks = self.hooks();

        for heap_index in 0..HEAP_COUNT {
            let pages: Vec<*mut HeapPage> = self.heaps[heap_index].pages.clone();
            for page in pages {
                unsafe {
                    for i in 0..(*page).total_slots {
                        let obj = ObjRef((*page).slot_addr(i));
                        if obj.is_free_cell() {
                            continue;
                        }
                        match obj.obj_type() {
                            ObjType::Moved | ObjType::Zombie => {}
                            _ => hooks.update_references(self, obj),
                        }
                    }
                }
            }
        }

        // The finalizer table is keyed by object address.
        if !self.finalizer_table.is_empty() {
            let entries: Vec<(usize, Vec<crate::vm::FinalizerCallable>)> =
                self.finalizer_table.drain().collect();
            for (key, callables) in entries {
                let healed = self.location(ObjRef(key));
                self.finalizer_table.insert(healed.as_usize(), callables);
            }
        }

        // The lazy inverse id map stores addresses as values.
        if let Some(id_to_obj) = self.id_to_obj.as_mut() {
            let heals: Vec<(u64, usize)> = id_to_obj
                .iter()
                .map(|(&id, &addr)| (id, addr))
                .collect();
            for (id, addr) in heals {
                let obj = ObjRef(addr);
                if !obj.is_special() && unsafe { obj.obj_type() } == ObjType::Moved {
                    let healed = unsafe { moved::destination(obj) };
                    id_to_obj.insert(id, healed.as_usize());
                }
            }
        }

        hooks.update_weak_tables(self);

        self.during_reference_updating = false;
    }

    /// Re-run reference healing and verify that no marked forwarding
    /// cell remains reachable. Debug aid mirroring the compaction test
    /// suite's contract.
    pub fn verify_compaction_references(&mut self) -> crate::error::Result<()> {
        self.gc_update_references();

        for heap in &self.heaps {
            for &page in &heap.pages {
                unsafe {
                    for i in 0..(*page).total_slots {
                        let obj = ObjRef((*page).slot_addr(i));
                        if !obj.is_free_cell()
                            && obj.obj_type() == ObjType::Moved
                            && (*page).mark_bits.test(crate::heap::num_in_page(obj.as_usize()))
                        {
                            return Err(crate::error::GcError::Verification(format!(
                                "marked forwarding cell at {:#x}",
                                obj.as_usize()
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Default compaction page order: fewest pinned slots first.
fn compare_pinned_slots(a: &HeapPage, b: &HeapPage) -> std::cmp::Ordering {
    a.pinned_slots.cmp(&b.pinned_slots)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::{GcConfig, GcParams};
    use crate::object::{ObjRef, ObjType};
    use crate::space::ObjectSpace;
    use crate::vm::VmHooks;

    struct NullVm;

    impl VmHooks for NullVm {
        fn mark_roots(&self, _objspace: &mut ObjectSpace) {}
        fn mark_children(&self, _objspace: &mut ObjectSpace, _obj: ObjRef) {}
        fn update_references(&self, _objspace: &mut ObjectSpace, _obj: ObjRef) {}
        fn obj_free(&self, _obj: ObjRef) -> bool {
            true
        }
    }

    fn space_with_one_object() -> (ObjectSpace, ObjRef) {
        let mut objspace =
            ObjectSpace::new(GcParams::default(), GcConfig::default(), Arc::new(NullVm))
                .unwrap();
        objspace.prepare_heap().unwrap();
        let cache = objspace.create_cache();
        let obj = objspace
            .new_obj(cache, 0, ObjType::Object as usize, 11, 22, 33, true, 40)
            .unwrap();
        (objspace, obj)
    }

    #[test]
    fn test_location_invalidates_locked_page() {
        let (mut objspace, obj) = space_with_one_object();

        // Vacate the slot the way the compactor does, then lock its
        // page as a drained source.
        objspace.during_compacting = true;
        let dest = objspace.try_take_free_slot(0).expect("a free slot must exist");
        let orig_shape = unsafe { obj.shape_id() };
        objspace.gc_move(obj, dest, 0, 0, orig_shape);
        objspace.during_compacting = false;

        let page = objspace.page_of(obj);
        unsafe {
            assert_eq!(obj.obj_type(), ObjType::Moved);
            (*page).locked_for_compaction = true;
        }

        // A read through the barrier undoes the page's moves: the
        // object is home again, the destination is free, the lock is
        // off.
        let healed = objspace.location(obj);
        assert_eq!(healed, obj);
        unsafe {
            assert_eq!(obj.obj_type(), ObjType::Object);
            assert_eq!((*obj.slot()).v1, 11);
            assert_eq!((*obj.slot()).v3, 33);
            assert!(!(*page).locked_for_compaction);
            assert!(dest.is_free_cell());
            assert_eq!((*page).moved_slots, 0);
        }
    }

    #[test]
    fn test_location_follows_forwarding_on_unlocked_page() {
        let (mut objspace, obj) = space_with_one_object();

        objspace.during_compacting = true;
        let dest = objspace.try_take_free_slot(0).expect("a free slot must exist");
        let orig_shape = unsafe { obj.shape_id() };
        objspace.gc_move(obj, dest, 0, 0, orig_shape);
        objspace.during_compacting = false;

        // Unlocked source page: the stale reference heals forward.
        assert_eq!(objspace.location(obj), dest);
        unsafe {
            assert_eq!(dest.obj_type(), ObjType::Object);
            assert_eq!((*dest.slot()).v2, 22);
        }
    }
}
