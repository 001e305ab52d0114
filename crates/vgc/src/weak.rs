//! Weak References - Collected, Not Traced
//!
//! A weak reference is a pointer to a cell holding an `ObjRef`. During a
//! mark cycle the cells are registered but their targets are not traced.
//! When marking settles, every cell whose target stayed white receives
//! the `UNDEF` tombstone; the rest are retained and counted.

use crate::object::ObjRef;
use crate::space::ObjectSpace;

impl ObjectSpace {
    /// Register a weak cell for the current mark cycle.
    ///
    /// # Safety contract
    /// `cell` must stay valid until marking finishes (it is a borrow of
    /// host-owned storage, expressed as a raw address).
    pub fn mark_weak(&mut self, cell: *mut ObjRef) {
        crate::gc_assert!(self.mode == crate::space::Mode::Marking);
        self.weak_references.push(cell as usize);
    }

    /// Withdraw a weak cell mid-cycle. Only effective when the parent is
    /// already marked; an unmarked parent's registrations die with it.
    pub fn remove_weak(&mut self, parent: ObjRef, cell: *mut ObjRef) {
        if !self.is_marked(parent) {
            return;
        }
        let addr = cell as usize;
        if let Some(pos) = self.weak_references.iter().position(|&c| c == addr) {
            self.weak_references.swap_remove(pos);
        }
    }

    /// Settle registered weak cells at mark finish: dead targets become
    /// tombstones, live ones are counted as retained.
    pub(crate) fn update_weak_references(&mut self) {
        let mut retained = 0usize;
        let cells = std::mem::take(&mut self.weak_references);
        let total = cells.len();

        for cell_addr in cells {
            let cell = cell_addr as *mut ObjRef;
            unsafe {
                let target = *cell;
                if target.is_special() {
                    continue;
                }
                if self.is_marked(target) {
                    retained += 1;
                } else {
                    *cell = ObjRef::UNDEF;
                }
            }
        }

        self.weak_references_count = total;
        self.retained_weak_references_count = retained;
        self.weak_references = Vec::new();
    }
}
