//! Memory Poisoning - Instrumented-Build Fill Patterns
//!
//! Freed or quarantined memory is filled with a recognizable pattern in
//! debug builds so that stale reads show up immediately in a debugger
//! or in verification scans. Release builds compile to no-ops.

/// Fill byte for freed object slots.
pub const POISON_FREED: u8 = 0xAB;

/// Fill byte for recycled page bodies.
pub const POISON_PAGE: u8 = 0xCD;

/// Poison a memory region with the given fill byte.
///
/// # Safety
/// `ptr..ptr+len` must be valid writable memory owned by the caller.
#[cfg(debug_assertions)]
#[inline]
pub unsafe fn poison_region(ptr: *mut u8, len: usize, fill: u8) {
    std::ptr::write_bytes(ptr, fill, len);
}

#[cfg(not(debug_assertions))]
#[inline]
pub unsafe fn poison_region(_ptr: *mut u8, _len: usize, _fill: u8) {}

/// Zero a region that is about to be handed back to a mutator.
///
/// # Safety
/// `ptr..ptr+len` must be valid writable memory owned by the caller.
#[inline]
pub unsafe fn unpoison_region(ptr: *mut u8, len: usize) {
    std::ptr::write_bytes(ptr, 0, len);
}

/// Check whether a region still carries its poison fill (debug builds).
#[cfg(debug_assertions)]
pub unsafe fn is_poisoned(ptr: *const u8, len: usize, fill: u8) -> bool {
    (0..len).all(|i| *ptr.add(i) == fill)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(debug_assertions)]
    fn test_poison_and_check() {
        let mut buf = [0u8; 64];
        unsafe {
            poison_region(buf.as_mut_ptr(), 64, POISON_FREED);
            assert!(is_poisoned(buf.as_ptr(), 64, POISON_FREED));
            unpoison_region(buf.as_mut_ptr(), 64);
            assert!(!is_poisoned(buf.as_ptr(), 64, POISON_FREED));
            assert!(buf.iter().all(|&b| b == 0));
        }
    }
}
