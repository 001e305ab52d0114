//! Sized Heaps - One Page Set Per Size Class
//!
//! A `SizedHeap` owns the pages of one slot size class: the ordered page
//! list, the free-page and pooled-page lists, the sweep and compaction
//! cursors, and the per-class counters the statistics report.

use crate::heap::page::HeapPage;
use crate::object::slot_size_for_heap;

/// The page set and accounting for one slot size class.
pub struct SizedHeap {
    pub heap_index: usize,
    pub slot_size: usize,

    /// All pages of this class, in attach order. Sweep walks it front to
    /// back; the compaction cursor walks it back to front.
    pub pages: Vec<*mut HeapPage>,
    /// Pages with at least one free slot, linked through `free_next`.
    pub free_pages: *mut HeapPage,
    /// Pages reserved for incremental-sweep progress, linked through
    /// `free_next`.
    pub pooled_pages: *mut HeapPage,

    /// Next page to sweep (index into `pages`), while sweeping.
    pub sweeping_index: Option<usize>,
    /// Compaction cursor (index into `pages`), while compacting.
    pub compact_cursor: Option<usize>,

    pub total_pages: usize,
    pub total_slots: usize,
    pub total_allocated_objects: u64,
    pub total_freed_objects: u64,
    pub final_slots_count: usize,

    /// Slots freed by the current sweep phase.
    pub freed_slots: usize,
    /// Slots found already empty by the current sweep phase.
    pub empty_slots: usize,

    /// Slot budget the heap may still grow by without a major GC.
    pub allocatable_slots: usize,
}

impl SizedHeap {
    pub fn new(heap_index: usize) -> Self {
        Self {
            heap_index,
            slot_size: slot_size_for_heap(heap_index),
            pages: Vec::new(),
            free_pages: std::ptr::null_mut(),
            pooled_pages: std::ptr::null_mut(),
            sweeping_index: None,
            compact_cursor: None,
            total_pages: 0,
            total_slots: 0,
            total_allocated_objects: 0,
            total_freed_objects: 0,
            final_slots_count: 0,
            freed_slots: 0,
            empty_slots: 0,
            allocatable_slots: 0,
        }
    }

    /// Attach a striped page to this heap. The caller registers it with
    /// the page index separately.
    pub fn add_page(&mut self, page: *mut HeapPage) {
        unsafe {
            debug_assert_eq!((*page).slot_size, self.slot_size);
            self.total_slots += (*page).total_slots;
        }
        self.total_pages += 1;
        self.pages.push(page);
    }

    /// Detach a page (being drained to the empty pool or freed). Keeps
    /// the sweep cursor stable when the page sits before it.
    pub fn remove_page(&mut self, page: *mut HeapPage) {
        let idx = self
            .pages
            .iter()
            .position(|&p| p == page)
            .unwrap_or_else(|| crate::vgc_bug!("remove_page: page not in heap"));
        self.pages.remove(idx);
        self.total_pages -= 1;
        unsafe {
            self.total_slots -= (*page).total_slots;
        }

        if let Some(s) = self.sweeping_index {
            if idx < s {
                self.sweeping_index = Some(s - 1);
            } else if s >= self.pages.len() {
                self.sweeping_index = if self.pages.is_empty() { None } else { Some(self.pages.len() - 1) };
            }
        }
        if let Some(c) = self.compact_cursor {
            if idx < c {
                self.compact_cursor = Some(c - 1);
            } else if c >= self.pages.len() {
                self.compact_cursor = if self.pages.is_empty() { None } else { Some(self.pages.len() - 1) };
            }
        }
    }

    /// Push a page with free slots onto the free-page list.
    pub fn push_free_page(&mut self, page: *mut HeapPage) {
        unsafe {
            debug_assert!((*page).free_slots > 0);
            (*page).free_next = self.free_pages;
        }
        self.free_pages = page;
    }

    /// Pop the next page with free slots.
    pub fn pop_free_page(&mut self) -> Option<*mut HeapPage> {
        if self.free_pages.is_null() {
            return None;
        }
        let page = self.free_pages;
        unsafe {
            self.free_pages = (*page).free_next;
            (*page).free_next = std::ptr::null_mut();
        }
        Some(page)
    }

    /// Push a page onto the pooled list (incremental-sweep yield stock).
    pub fn push_pooled_page(&mut self, page: *mut HeapPage) {
        unsafe {
            (*page).free_next = self.pooled_pages;
        }
        self.pooled_pages = page;
    }

    pub fn pop_pooled_page(&mut self) -> Option<*mut HeapPage> {
        if self.pooled_pages.is_null() {
            return None;
        }
        let page = self.pooled_pages;
        unsafe {
            self.pooled_pages = (*page).free_next;
            (*page).free_next = std::ptr::null_mut();
        }
        Some(page)
    }

    /// Total slots sitting on pooled pages.
    pub fn pooled_slots(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.pooled_pages;
        while !cursor.is_null() {
            unsafe {
                n += (*cursor).free_slots;
                cursor = (*cursor).free_next;
            }
        }
        n
    }

    pub fn has_free_pages(&self) -> bool {
        !self.free_pages.is_null()
    }

    /// Move every pooled page onto the free list (end of sweep).
    pub fn drain_pooled_to_free(&mut self) {
        while let Some(page) = self.pop_pooled_page() {
            unsafe {
                if (*page).free_slots > 0 {
                    self.push_free_page(page);
                }
            }
        }
    }

    /// Whether sweeping of this heap has finished.
    pub fn sweep_done(&self) -> bool {
        self.sweeping_index.is_none()
    }
}

// Raw page pointers are owned by the object space, which is single-owner.
unsafe impl Send for SizedHeap {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::page::HeapPage;

    #[test]
    fn test_free_page_list_lifo() {
        let mut heap = SizedHeap::new(0);
        let a = HeapPage::allocate(heap.slot_size, 0).unwrap();
        let b = HeapPage::allocate(heap.slot_size, 0).unwrap();
        heap.add_page(a);
        heap.add_page(b);
        heap.push_free_page(a);
        heap.push_free_page(b);
        assert_eq!(heap.pop_free_page(), Some(b));
        assert_eq!(heap.pop_free_page(), Some(a));
        assert_eq!(heap.pop_free_page(), None);
        unsafe {
            HeapPage::free(a);
            HeapPage::free(b);
        }
    }

    #[test]
    fn test_remove_page_adjusts_cursors() {
        let mut heap = SizedHeap::new(0);
        let pages: Vec<_> = (0..3)
            .map(|_| HeapPage::allocate(heap.slot_size, 0).unwrap())
            .collect();
        for &p in &pages {
            heap.add_page(p);
        }
        heap.sweeping_index = Some(2);
        heap.remove_page(pages[0]);
        assert_eq!(heap.sweeping_index, Some(1));
        assert_eq!(heap.total_pages, 2);
        for &p in &pages {
            unsafe { HeapPage::free(p) };
        }
    }
}
