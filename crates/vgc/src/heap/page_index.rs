//! Page Index - Sorted Containment Lookup
//!
//! All registered pages, sorted by body address, so any machine word can
//! be classified as heap-interior or not in O(log n). The conservative
//! marker (`mark_maybe`) and the compaction verifier both depend on this.

use veld_util::DArray;

use crate::heap::page::HeapPage;
use crate::object::HEAP_PAGE_SIZE;

/// Address-sorted registry of every live page.
pub struct PageIndex {
    sorted: DArray<*mut HeapPage>,
    /// Lowest mapped body address.
    lomem: usize,
    /// One past the highest mapped body end.
    himem: usize,
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            sorted: DArray::new(),
            lomem: usize::MAX,
            himem: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Register a page at its binary-search position.
    pub fn insert(&mut self, page: *mut HeapPage) {
        let body = unsafe { (*page).body };
        let idx = self.partition_point(body);
        self.sorted.insert(idx, page);

        let end = body + HEAP_PAGE_SIZE;
        if body < self.lomem {
            self.lomem = body;
        }
        if end > self.himem {
            self.himem = end;
        }
    }

    /// Remove a page. Bounds are left loose; they only gate the fast
    /// rejection path.
    pub fn remove(&mut self, page: *mut HeapPage) {
        let body = unsafe { (*page).body };
        // partition_point gives the first entry past `body`; the match,
        // if registered, sits immediately before it.
        let idx = self.partition_point(body);
        if idx > 0 && self.sorted.get(idx - 1) == page {
            self.sorted.remove_ordered(idx - 1);
        } else {
            crate::vgc_bug!("page_index: removing unregistered page {:#x}", body);
        }
    }

    /// Page whose body spans `addr`, if any.
    pub fn lookup(&self, addr: usize) -> Option<*mut HeapPage> {
        if addr < self.lomem || addr >= self.himem {
            return None;
        }
        // partition_point gives the first page with body > addr; the
        // candidate is the one before it.
        let idx = self.partition_point(addr);
        if idx == 0 {
            return None;
        }
        let page = self.sorted.get(idx - 1);
        let body = unsafe { (*page).body };
        if addr >= body && addr < body + HEAP_PAGE_SIZE {
            Some(page)
        } else {
            None
        }
    }

    /// Whether `addr` is a valid, slot-aligned address on a registered
    /// page.
    pub fn is_pointer_to_heap(&self, addr: usize) -> bool {
        match self.lookup(addr) {
            Some(page) => unsafe { (*page).contains(addr) },
            None => false,
        }
    }

    /// All registered pages in address order.
    pub fn iter(&self) -> impl Iterator<Item = *mut HeapPage> + '_ {
        self.sorted.iter()
    }

    /// First index whose page body is strictly greater than `addr`.
    fn partition_point(&self, addr: usize) -> usize {
        let slice = self.sorted.as_slice();
        let mut lo = 0;
        let mut hi = slice.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let body = unsafe { (*slice[mid]).body };
            if body <= addr {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}
