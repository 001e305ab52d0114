//! Statistics - Heap Counters and Cycle Introspection
//!
//! `stat` serves the global counter hash (or one key), `stat_heap` the
//! per-size-class view, and `latest_gc_info` the last cycle's shape.
//! Numeric semantics follow the collector's internal counters; no text
//! format is stable.

use std::sync::atomic::Ordering;

use indexmap::IndexMap;

use crate::logging::GcTrigger;
use crate::object::HEAP_COUNT;
use crate::space::{major_reason, Mode, ObjectSpace};

impl ObjectSpace {
    /// Every global counter, in a stable order.
    pub fn stat_all(&self) -> IndexMap<&'static str, u64> {
        let mut map = IndexMap::new();

        let total_allocated: u64 = self.heaps.iter().map(|h| h.total_allocated_objects).sum();
        let total_freed: u64 = self.heaps.iter().map(|h| h.total_freed_objects).sum();
        let final_slots: u64 = self.heaps.iter().map(|h| h.final_slots_count as u64).sum();
        let total_pages: u64 = self.heaps.iter().map(|h| h.total_pages as u64).sum();
        let total_slots = self.total_slot_count() as u64;
        let live = self.live_slot_count();

        map.insert("count", self.gc_count);
        map.insert("minor_gc_count", self.minor_gc_count);
        map.insert("major_gc_count", self.major_gc_count);
        map.insert("time_ms", self.total_time.as_millis() as u64);

        map.insert("heap_allocated_pages", total_pages);
        map.insert("heap_empty_pages", self.empty_pages_count as u64);
        map.insert("heap_allocatable_slots", self.allocatable_slots as u64);
        map.insert("heap_available_slots", total_slots);
        map.insert("heap_live_slots", live);
        map.insert(
            "heap_free_slots",
            total_slots.saturating_sub(live).saturating_sub(final_slots),
        );
        map.insert("heap_final_slots", final_slots);
        map.insert("heap_marked_slots", self.marked_slots as u64);

        map.insert("total_allocated_objects", total_allocated);
        map.insert("total_freed_objects", total_freed);

        map.insert("old_objects", self.old_objects as u64);
        map.insert("old_objects_limit", self.old_objects_limit as u64);
        map.insert(
            "remembered_wb_unprotected_objects",
            self.uncollectible_wb_unprotected_objects as u64,
        );
        map.insert(
            "remembered_wb_unprotected_objects_limit",
            self.uncollectible_wb_unprotected_objects_limit as u64,
        );

        map.insert(
            "malloc_increase_bytes",
            self.accounting.malloc_increase.load(Ordering::Relaxed) as u64,
        );
        map.insert(
            "malloc_increase_bytes_limit",
            self.accounting.malloc_limit as u64,
        );
        map.insert(
            "oldmalloc_increase_bytes",
            self.accounting.oldmalloc_increase.load(Ordering::Relaxed) as u64,
        );
        map.insert(
            "oldmalloc_increase_bytes_limit",
            self.accounting.oldmalloc_limit as u64,
        );

        map.insert("compact_moved_objects", self.moved_objects as u64);
        map.insert("compact_moved_up_objects", self.moved_up_objects as u64);
        map.insert(
            "compact_moved_down_objects",
            self.moved_down_objects as u64,
        );

        map.insert(
            "weak_references_count",
            self.weak_references_count as u64,
        );
        map.insert(
            "retained_weak_references_count",
            self.retained_weak_references_count as u64,
        );

        map
    }

    /// One global counter by key.
    pub fn stat(&self, key: &str) -> Option<u64> {
        self.stat_all().get(key).copied()
    }

    /// Per-heap counters for one size class.
    pub fn stat_heap(&self, heap_index: usize) -> IndexMap<&'static str, u64> {
        let mut map = IndexMap::new();
        let heap = &self.heaps[heap_index];

        map.insert("slot_size", heap.slot_size as u64);
        map.insert("heap_eden_pages", heap.total_pages as u64);
        map.insert("heap_eden_slots", heap.total_slots as u64);
        map.insert("total_allocated_objects", heap.total_allocated_objects);
        map.insert("total_freed_objects", heap.total_freed_objects);
        map.insert("final_slots", heap.final_slots_count as u64);
        map.insert(
            "force_incremental_marking_finish_count",
            0, // retained key; the allocator path records no forced finishes yet
        );
        map
    }

    /// Per-heap counters for every size class.
    pub fn stat_heap_all(&self) -> Vec<IndexMap<&'static str, u64>> {
        (0..HEAP_COUNT).map(|i| self.stat_heap(i)).collect()
    }

    /// One field of the last cycle's description, as text.
    pub fn latest_gc_info_key(&self, key: &str) -> Option<String> {
        let info = &self.latest_gc_info;
        match key {
            "major_by" => Some(major_reason_name(info.major_by).to_string()),
            "need_major_by" => Some(major_reason_name(info.need_major_by).to_string()),
            "gc_by" => Some(
                match info.gc_by {
                    GcTrigger::Newobj => "newobj",
                    GcTrigger::Malloc => "malloc",
                    GcTrigger::Method => "method",
                    GcTrigger::Force => "force",
                }
                .to_string(),
            ),
            "immediate_sweep" => Some(info.immediate_sweep.to_string()),
            "full" => Some(info.full.to_string()),
            "compacting" => Some(info.compacting.to_string()),
            "state" => Some(
                match self.mode {
                    Mode::None => "none",
                    Mode::Marking => "marking",
                    Mode::Sweeping => "sweeping",
                    Mode::Compacting => "compacting",
                }
                .to_string(),
            ),
            _ => None,
        }
    }
}

fn major_reason_name(flags: u32) -> &'static str {
    if flags == 0 {
        "none"
    } else if flags & major_reason::NOFREE != 0 {
        "nofree"
    } else if flags & major_reason::OLDGEN != 0 {
        "oldgen"
    } else if flags & major_reason::SHADY != 0 {
        "shady"
    } else if flags & major_reason::OLDMALLOC != 0 {
        "oldmalloc"
    } else {
        "force"
    }
}
