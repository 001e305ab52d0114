//! Stack Slices - Slab Allocator for Thread VM Stacks
//!
//! Thread stacks are carved from large mapped chunks:
//!
//! ```text
//! | header page | slice 0 | slice 1 | ... | slice N-1 |
//!
//! slice = | vm_stack ... | guard page (PROT_NONE) | footer page |
//! ```
//!
//! The footer stores back-pointers to the owning chunk and the slice
//! index, so freeing is O(1) from the slice handle alone. Freed slices
//! go onto their chunk's free stack and their pages are advised away;
//! chunks live on a global free list shared by all schedulers.

use parking_lot::Mutex;

use crate::error::{Result, SchedError};

/// Default chunk size (512 MiB of address space).
pub const STACK_CHUNK_SIZE: usize = 512 * 1024 * 1024;

/// Default usable VM stack bytes per slice.
pub const DEFAULT_VM_STACK_SIZE: usize = 128 * 1024;

#[cfg(unix)]
fn os_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(not(unix))]
fn os_page_size() -> usize {
    4096
}

/// Back-pointers written at the end of every slice.
#[repr(C)]
struct SliceFooter {
    chunk: *mut StackChunk,
    index: usize,
}

/// One mapped chunk, divided into fixed-size slices.
pub struct StackChunk {
    base: usize,
    chunk_size: usize,
    /// Bytes per slice including guard and footer pages.
    slice_bytes: usize,
    /// Usable vm-stack bytes per slice.
    vm_stack_bytes: usize,
    slice_count: usize,
    /// Indices never yet handed out.
    next_fresh: usize,
    /// Freed slice indices, reused LIFO.
    free_stack: Vec<usize>,
}

impl StackChunk {
    fn map(chunk_size: usize, vm_stack_bytes: usize) -> Result<Box<StackChunk>> {
        let page = os_page_size();
        let vm_bytes = vm_stack_bytes.div_ceil(page) * page;
        let slice_bytes = vm_bytes + 2 * page; // guard + footer
        let header_bytes = page;
        let slice_count = (chunk_size - header_bytes) / slice_bytes;
        if slice_count == 0 {
            return Err(SchedError::StackAllocation(
                "chunk too small for one slice".to_string(),
            ));
        }

        let base = map_chunk(chunk_size)?;

        let mut chunk = Box::new(StackChunk {
            base,
            chunk_size,
            slice_bytes,
            vm_stack_bytes: vm_bytes,
            slice_count,
            next_fresh: 0,
            free_stack: Vec::new(),
        });

        // Install guard pages and footers up front; the pages are lazy
        // until touched.
        let chunk_ptr: *mut StackChunk = &mut *chunk;
        for i in 0..slice_count {
            let slice_base = chunk.slice_base(i);
            unsafe {
                protect_none(slice_base + chunk.vm_stack_bytes, page)?;
                let footer =
                    (slice_base + chunk.vm_stack_bytes + page) as *mut SliceFooter;
                (*footer).chunk = chunk_ptr;
                (*footer).index = i;
            }
        }

        Ok(chunk)
    }

    fn slice_base(&self, index: usize) -> usize {
        self.base + os_page_size() + index * self.slice_bytes
    }

    fn take_slice(&mut self) -> Option<(usize, usize)> {
        let index = if let Some(index) = self.free_stack.pop() {
            index
        } else if self.next_fresh < self.slice_count {
            let i = self.next_fresh;
            self.next_fresh += 1;
            i
        } else {
            return None;
        };
        Some((index, self.slice_base(index)))
    }

    fn release_slice(&mut self, index: usize) {
        let base = self.slice_base(index);
        unsafe {
            advise_free(base, self.vm_stack_bytes);
        }
        self.free_stack.push(index);
    }
}

impl Drop for StackChunk {
    fn drop(&mut self) {
        unsafe {
            unmap_chunk(self.base, self.chunk_size);
        }
    }
}

/// One thread's VM stack, borrowed from a chunk.
pub struct StackSlice {
    vm_stack: usize,
    vm_stack_bytes: usize,
    footer: usize,
    pool: std::sync::Arc<StackPool>,
}

impl StackSlice {
    /// The usable stack memory.
    pub fn as_mut_slice(&mut self) -> &mut [usize] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.vm_stack as *mut usize,
                self.vm_stack_bytes / std::mem::size_of::<usize>(),
            )
        }
    }

    pub fn base(&self) -> usize {
        self.vm_stack
    }

    pub fn len_bytes(&self) -> usize {
        self.vm_stack_bytes
    }
}

// A slice is exclusively owned by one thread at a time.
unsafe impl Send for StackSlice {}

impl Drop for StackSlice {
    fn drop(&mut self) {
        // The footer names the owning chunk; mutation happens under the
        // pool lock.
        let _chunks = self.pool.chunks.lock();
        unsafe {
            let footer = &*(self.footer as *const SliceFooter);
            (*footer.chunk).release_slice(footer.index);
        }
    }
}

/// Global pool of stack chunks.
pub struct StackPool {
    chunks: Mutex<Vec<Box<StackChunk>>>,
    chunk_size: usize,
    vm_stack_bytes: usize,
}

// Chunks are plain memory manipulated under the pool lock.
unsafe impl Send for StackPool {}
unsafe impl Sync for StackPool {}

impl StackPool {
    pub fn new() -> Self {
        Self::with_sizes(STACK_CHUNK_SIZE, DEFAULT_VM_STACK_SIZE)
    }

    /// Pool with explicit geometry (tests use small chunks).
    pub fn with_sizes(chunk_size: usize, vm_stack_bytes: usize) -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
            chunk_size,
            vm_stack_bytes,
        }
    }

    /// Borrow one slice, mapping a new chunk when every existing chunk
    /// is exhausted.
    pub fn alloc_slice(self: &std::sync::Arc<Self>) -> Result<StackSlice> {
        let mut chunks = self.chunks.lock();

        for chunk in chunks.iter_mut() {
            if let Some((_, base)) = chunk.take_slice() {
                return Ok(self.slice_at(chunk, base));
            }
        }

        let mut chunk = StackChunk::map(self.chunk_size, self.vm_stack_bytes)?;
        let (_, base) = chunk
            .take_slice()
            .expect("fresh chunk must have a slice");
        let slice = self.slice_at(&chunk, base);
        chunks.push(chunk);
        Ok(slice)
    }

    fn slice_at(self: &std::sync::Arc<Self>, chunk: &StackChunk, base: usize) -> StackSlice {
        let page = os_page_size();
        StackSlice {
            vm_stack: base,
            vm_stack_bytes: chunk.vm_stack_bytes,
            footer: base + chunk.vm_stack_bytes + page,
            pool: std::sync::Arc::clone(self),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn map_chunk(size: usize) -> Result<usize> {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(SchedError::StackAllocation(format!(
                "mmap of {} bytes failed",
                size
            )));
        }
        Ok(ptr as usize)
    }
}

#[cfg(unix)]
unsafe fn unmap_chunk(base: usize, size: usize) {
    libc::munmap(base as *mut libc::c_void, size);
}

#[cfg(unix)]
unsafe fn protect_none(addr: usize, len: usize) -> Result<()> {
    if libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_NONE) != 0 {
        return Err(SchedError::StackAllocation(
            "mprotect(PROT_NONE) failed for guard page".to_string(),
        ));
    }
    Ok(())
}

#[cfg(unix)]
unsafe fn advise_free(addr: usize, len: usize) {
    #[cfg(target_os = "linux")]
    libc::madvise(addr as *mut libc::c_void, len, libc::MADV_FREE);
    #[cfg(not(target_os = "linux"))]
    libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED);
}

#[cfg(not(unix))]
fn map_chunk(size: usize) -> Result<usize> {
    let layout = std::alloc::Layout::from_size_align(size, os_page_size())
        .map_err(|e| SchedError::StackAllocation(e.to_string()))?;
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(SchedError::StackAllocation("allocation failed".to_string()));
    }
    Ok(ptr as usize)
}

#[cfg(not(unix))]
unsafe fn unmap_chunk(base: usize, size: usize) {
    let layout = std::alloc::Layout::from_size_align(size, os_page_size()).unwrap();
    std::alloc::dealloc(base as *mut u8, layout);
}

#[cfg(not(unix))]
unsafe fn protect_none(_addr: usize, _len: usize) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
unsafe fn advise_free(_addr: usize, _len: usize) {}
