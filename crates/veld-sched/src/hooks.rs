//! Thread Event Hooks - Lifecycle Notifications
//!
//! Hosts observe thread lifecycle transitions through masked callbacks.
//! Hooks are invoked outside every scheduler lock, so a hook may call
//! back into the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Event bits.
pub mod event {
    pub const STARTED: u32 = 1 << 0;
    pub const READY: u32 = 1 << 1;
    pub const RESUMED: u32 = 1 << 2;
    pub const SUSPENDED: u32 = 1 << 3;
    pub const EXITED: u32 = 1 << 4;
    pub const ALL: u32 = STARTED | READY | RESUMED | SUSPENDED | EXITED;
}

/// Hook callback: (event bit, thread id).
pub type HookFn = Arc<dyn Fn(u32, u64) + Send + Sync>;

/// Opaque hook registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle(u64);

struct HookEntry {
    handle: HookHandle,
    mask: u32,
    callback: HookFn,
}

/// The hook table for one scheduler.
pub struct HookRegistry {
    entries: RwLock<Vec<HookEntry>>,
    next_handle: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Register a callback for the events in `mask`.
    pub fn add(&self, mask: u32, callback: HookFn) -> HookHandle {
        let handle = HookHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push(HookEntry {
            handle,
            mask,
            callback,
        });
        handle
    }

    /// Remove a registration. Returns whether it existed.
    pub fn remove(&self, handle: HookHandle) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.handle != handle);
        entries.len() != before
    }

    /// Fire one event. Callbacks run on the calling thread.
    pub fn fire(&self, event_bit: u32, thread_id: u64) {
        let callbacks: Vec<HookFn> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|e| e.mask & event_bit != 0)
                .map(|e| Arc::clone(&e.callback))
                .collect()
        };
        for callback in callbacks {
            callback(event_bit, thread_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_mask_filtering_and_removal() {
        let registry = HookRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        let handle = registry.add(
            event::READY | event::EXITED,
            Arc::new(move |_, _| {
                hits2.fetch_add(1, Ordering::Relaxed);
            }),
        );

        registry.fire(event::READY, 1);
        registry.fire(event::RESUMED, 1); // filtered
        registry.fire(event::EXITED, 1);
        assert_eq!(hits.load(Ordering::Relaxed), 2);

        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));
        registry.fire(event::READY, 1);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }
}
