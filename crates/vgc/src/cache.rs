//! Allocation Cache - Per-Execution-Context Fast Path
//!
//! Each execution context (ractor) owns one cache: for every size class a
//! `{freelist, using_page}` pair. Allocation pops the freelist head with
//! no locking and no heap access. On a miss the cache takes over an
//! entire free page's freelist from the heap; the page's own `free_slots`
//! reads zero until the cache is drained back at the next GC.

use crate::heap::page::HeapPage;
use crate::object::{ObjRef, Slot, HEAP_COUNT};

/// Identifies a cache registered with an object space.
pub type CacheId = usize;

/// One size class's slice of a cache.
pub struct CacheEntry {
    /// Head of the taken-over freelist (0 = empty).
    pub freelist: usize,
    /// Page the freelist was taken from.
    pub using_page: *mut HeapPage,
}

impl CacheEntry {
    const fn empty() -> Self {
        Self {
            freelist: 0,
            using_page: std::ptr::null_mut(),
        }
    }
}

/// Per-ractor allocation cache.
pub struct HeapCache {
    pub entries: [CacheEntry; HEAP_COUNT],
    /// Slots handed out since the last incremental mark step. The
    /// allocator forces a step every `INCREMENTAL_MARK_STEP_ALLOCATIONS`.
    pub incremental_mark_step_allocated_slots: usize,
}

impl HeapCache {
    pub fn new() -> Self {
        Self {
            entries: [
                CacheEntry::empty(),
                CacheEntry::empty(),
                CacheEntry::empty(),
                CacheEntry::empty(),
                CacheEntry::empty(),
            ],
            incremental_mark_step_allocated_slots: 0,
        }
    }

    /// Pop one slot for `heap_index`, if the cached freelist has one.
    #[inline]
    pub fn pop_slot(&mut self, heap_index: usize) -> Option<ObjRef> {
        let entry = &mut self.entries[heap_index];
        if entry.freelist == 0 {
            return None;
        }
        let addr = entry.freelist;
        unsafe {
            entry.freelist = Slot::free_next(addr);
        }
        Some(ObjRef(addr))
    }

    /// Take over `page`'s freelist. The page must have been popped off
    /// its heap's free-page list; its counters are zeroed until the cache
    /// is drained back.
    ///
    /// # Safety
    /// `page` must be a live page of the matching size class with no
    /// other cache using it.
    pub unsafe fn takeover_page(&mut self, heap_index: usize, page: *mut HeapPage) {
        debug_assert!(self.entries[heap_index].freelist == 0);
        debug_assert_eq!((*page).heap_index, heap_index);

        let entry = &mut self.entries[heap_index];
        entry.using_page = page;
        entry.freelist = (*page).freelist;
        (*page).freelist = 0;
        (*page).free_slots = 0;
    }

    /// Detach one size class's `{freelist, page}` for draining back to
    /// the heap. Returns (page, freelist head).
    pub fn release(&mut self, heap_index: usize) -> (*mut HeapPage, usize) {
        let entry = &mut self.entries[heap_index];
        let page = entry.using_page;
        let freelist = entry.freelist;
        entry.using_page = std::ptr::null_mut();
        entry.freelist = 0;
        (page, freelist)
    }

    pub fn has_slot(&self, heap_index: usize) -> bool {
        self.entries[heap_index].freelist != 0
    }
}

impl Default for HeapCache {
    fn default() -> Self {
        Self::new()
    }
}

// Entries point into pages owned by the object space that owns this cache.
unsafe impl Send for HeapCache {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::slot_size_for_heap;

    #[test]
    fn test_takeover_and_drain() {
        let page = HeapPage::allocate(slot_size_for_heap(0), 0).unwrap();
        let mut cache = HeapCache::new();
        unsafe {
            let total = (*page).total_slots;
            // Simulate the pop off the free-page list.
            cache.takeover_page(0, page);
            assert_eq!((*page).free_slots, 0);
            assert_eq!((*page).freelist, 0);

            let mut popped = 0;
            while cache.pop_slot(0).is_some() {
                popped += 1;
            }
            assert_eq!(popped, total);
            assert!(!cache.has_slot(0));

            let (released, freelist) = cache.release(0);
            assert_eq!(released, page);
            assert_eq!(freelist, 0);
            HeapPage::free(page);
        }
    }
}
