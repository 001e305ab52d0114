//! Heap Pages - Aligned Bodies and Page Metadata
//!
//! A page body is a `HEAP_PAGE_ALIGN`-aligned region of `HEAP_PAGE_SIZE`
//! bytes holding fixed-size slots. The body's first word points back to
//! the page's metadata, so any interior address resolves to its page by
//! masking:
//!
//! ```text
//! | header{back-pointer} | pad | slot[0] slot[1] ... slot[N-1] |
//! ^ body (64 KiB aligned)       ^ start
//! ```
//!
//! Metadata (`HeapPage`) lives outside the mapped body: counters, the
//! freelist head, list links, flags, and the bitmap planes.
//!
//! Bodies come from `mmap` (map oversized, trim to alignment) where the
//! system page size permits, with an aligned global-allocator fallback
//! elsewhere.

use crate::error::{GcError, Result};
use crate::heap::bitmap::{AgeMap, Bitmap};
use crate::object::{
    Slot, BASE_SLOT_SIZE, HEAP_PAGE_ALIGN, HEAP_PAGE_ALIGN_MASK, HEAP_PAGE_SIZE,
};

/// First word of every page body: back-pointer to the metadata.
#[repr(C)]
pub struct PageBodyHeader {
    pub page: *mut HeapPage,
}

/// Page metadata. Never stored inside the mapped body.
pub struct HeapPage {
    /// Aligned body address.
    pub body: usize,
    /// Address of slot 0.
    pub start: usize,
    pub slot_size: usize,
    pub total_slots: usize,
    /// Owning size class.
    pub heap_index: usize,

    pub free_slots: usize,
    pub final_slots: usize,
    pub pinned_slots: usize,

    /// Head of the page-local freelist (0 when empty or taken over by a
    /// ractor cache).
    pub freelist: usize,
    /// Link used by the per-heap free/pooled page lists and the global
    /// empty-page pool. A page is on at most one such list.
    pub free_next: *mut HeapPage,

    pub before_sweep: bool,
    pub has_remembered_objects: bool,
    pub has_uncollectible_wb_unprotected_objects: bool,
    /// Compaction has drained this page; reads through `location()` must
    /// heal through the forwarding cells until the page is unlocked.
    pub locked_for_compaction: bool,
    /// Forwarding cells still present on this page.
    pub moved_slots: usize,

    pub mark_bits: Bitmap,
    pub pin_bits: Bitmap,
    pub uncollectible_bits: Bitmap,
    pub marking_bits: Bitmap,
    pub wb_unprotected_bits: Bitmap,
    pub remembered_bits: Bitmap,
    pub age_bits: AgeMap,
}

impl HeapPage {
    /// Allocate a body and fresh metadata for one page of `slot_size`
    /// cells, thread every slot onto the freelist, and return the
    /// metadata pointer. The caller owns the page until `free`.
    pub fn allocate(slot_size: usize, heap_index: usize) -> Result<*mut HeapPage> {
        let body = page_body_allocate()?;

        let page = Box::into_raw(Box::new(HeapPage {
            body,
            start: 0,
            slot_size,
            total_slots: 0,
            heap_index,
            free_slots: 0,
            final_slots: 0,
            pinned_slots: 0,
            freelist: 0,
            free_next: std::ptr::null_mut(),
            before_sweep: false,
            has_remembered_objects: false,
            has_uncollectible_wb_unprotected_objects: false,
            locked_for_compaction: false,
            moved_slots: 0,
            mark_bits: Bitmap::new(),
            pin_bits: Bitmap::new(),
            uncollectible_bits: Bitmap::new(),
            marking_bits: Bitmap::new(),
            wb_unprotected_bits: Bitmap::new(),
            remembered_bits: Bitmap::new(),
            age_bits: AgeMap::new(),
        }));

        unsafe {
            (*(body as *mut PageBodyHeader)).page = page;
            (*page).stripe(slot_size, heap_index);
        }

        Ok(page)
    }

    /// Release a page's body and metadata.
    ///
    /// # Safety
    /// The page must be detached from every list and index, with no live
    /// objects on it.
    pub unsafe fn free(page: *mut HeapPage) {
        let body = (*page).body;
        page_body_free(body);
        drop(Box::from_raw(page));
    }

    /// Lay out the body for `slot_size` cells: compute the start offset,
    /// reset counters and bitmaps, and thread every cell onto the
    /// freelist. Also used to re-stripe a recycled empty page for a
    /// different size class.
    ///
    /// # Safety
    /// No live objects may remain in the body.
    pub unsafe fn stripe(&mut self, slot_size: usize, heap_index: usize) {
        self.slot_size = slot_size;
        self.heap_index = heap_index;

        // Slot 0 sits after the header, rounded up to a BASE_SLOT_SIZE
        // stride, then advanced until the stride index is divisible by
        // the slot size so every slot owns distinct plane bits.
        let mut start = self.body + std::mem::size_of::<PageBodyHeader>();
        if start % BASE_SLOT_SIZE != 0 {
            start += BASE_SLOT_SIZE - start % BASE_SLOT_SIZE;
        }
        while (num_in_page(start) * BASE_SLOT_SIZE) % slot_size != 0 {
            start += BASE_SLOT_SIZE;
        }
        self.start = start;
        self.total_slots = (self.body + HEAP_PAGE_SIZE - start) / slot_size;

        self.free_slots = 0;
        self.final_slots = 0;
        self.pinned_slots = 0;
        self.freelist = 0;
        self.free_next = std::ptr::null_mut();
        self.before_sweep = false;
        self.has_remembered_objects = false;
        self.has_uncollectible_wb_unprotected_objects = false;
        self.locked_for_compaction = false;
        self.moved_slots = 0;
        self.mark_bits.clear_all();
        self.pin_bits.clear_all();
        self.uncollectible_bits.clear_all();
        self.marking_bits.clear_all();
        self.wb_unprotected_bits.clear_all();
        self.remembered_bits.clear_all();
        self.age_bits.clear_all();

        for i in (0..self.total_slots).rev() {
            let addr = start + i * slot_size;
            Slot::make_free(addr, self.freelist);
            self.freelist = addr;
            self.free_slots += 1;
        }
    }

    /// Address of slot `i`.
    #[inline]
    pub fn slot_addr(&self, i: usize) -> usize {
        debug_assert!(i < self.total_slots);
        self.start + i * self.slot_size
    }

    /// Whether `addr` is a valid slot address on this page.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start
            && addr < self.start + self.total_slots * self.slot_size
            && (addr - self.start) % self.slot_size == 0
    }

    /// End of the slot area (exclusive).
    #[inline]
    pub fn slots_end(&self) -> usize {
        self.start + self.total_slots * self.slot_size
    }

    /// Push a dead cell back onto this page's freelist.
    ///
    /// # Safety
    /// `addr` must be a dead cell on this page.
    pub unsafe fn add_free_slot(&mut self, addr: usize) {
        debug_assert!(self.contains(addr));
        Slot::make_free(addr, self.freelist);
        self.freelist = addr;
        self.free_slots += 1;
    }

    /// Live slots (total minus free and finalizing).
    pub fn live_slots(&self) -> usize {
        self.total_slots - self.free_slots - self.final_slots
    }
}

/// Plane-bit index for an address within its page.
#[inline]
pub fn num_in_page(addr: usize) -> usize {
    (addr & HEAP_PAGE_ALIGN_MASK) / BASE_SLOT_SIZE
}

/// Body address for any interior pointer.
#[inline]
pub fn body_for(addr: usize) -> usize {
    addr & !HEAP_PAGE_ALIGN_MASK
}

/// Metadata pointer for any interior pointer.
///
/// # Safety
/// `addr` must point into a live page body.
#[inline]
pub unsafe fn page_for_unchecked(addr: usize) -> *mut HeapPage {
    (*(body_for(addr) as *const PageBodyHeader)).page
}

/// Allocate one aligned page body.
#[cfg(unix)]
fn page_body_allocate() -> Result<usize> {
    // Map one alignment unit more than needed, then trim the unaligned
    // head and tail so the survivor is exactly HEAP_PAGE_SIZE and
    // HEAP_PAGE_ALIGN-aligned.
    unsafe {
        let mmap_size = HEAP_PAGE_SIZE + HEAP_PAGE_ALIGN;
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            mmap_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(GcError::OutOfMemory {
                requested: mmap_size,
                available: 0,
            });
        }

        let raw = ptr as usize;
        let aligned = (raw + HEAP_PAGE_ALIGN_MASK) & !HEAP_PAGE_ALIGN_MASK;

        let head = aligned - raw;
        if head > 0 && libc::munmap(ptr, head) != 0 {
            crate::vgc_bug!("page_body_allocate: munmap failed for head");
        }
        let tail = raw + mmap_size - (aligned + HEAP_PAGE_SIZE);
        if tail > 0 && libc::munmap((aligned + HEAP_PAGE_SIZE) as *mut libc::c_void, tail) != 0 {
            crate::vgc_bug!("page_body_allocate: munmap failed for tail");
        }

        Ok(aligned)
    }
}

#[cfg(not(unix))]
fn page_body_allocate() -> Result<usize> {
    unsafe {
        let layout = std::alloc::Layout::from_size_align(HEAP_PAGE_SIZE, HEAP_PAGE_ALIGN)
            .expect("page body layout");
        let ptr = std::alloc::alloc_zeroed(layout);
        if ptr.is_null() {
            return Err(GcError::OutOfMemory {
                requested: HEAP_PAGE_SIZE,
                available: 0,
            });
        }
        Ok(ptr as usize)
    }
}

#[cfg(unix)]
unsafe fn page_body_free(body: usize) {
    if libc::munmap(body as *mut libc::c_void, HEAP_PAGE_SIZE) != 0 {
        crate::vgc_bug!("page_body_free: munmap failed");
    }
}

#[cfg(not(unix))]
unsafe fn page_body_free(body: usize) {
    let layout = std::alloc::Layout::from_size_align(HEAP_PAGE_SIZE, HEAP_PAGE_ALIGN)
        .expect("page body layout");
    std::alloc::dealloc(body as *mut u8, layout);
}
