//! Write Barrier - Generational and Incremental Invariants
//!
//! `writebarrier(a, b)` records "a now references b". Two invariants are
//! preserved:
//!
//! - Generational: an OLD object referencing a younger one joins the
//!   remember set, so minor cycles re-trace it.
//! - Tri-color (incremental cycles only): a black object may not point
//!   at a white one; the barrier marks the white target grey directly.
//!
//! Objects that cannot honor the barrier are "shady"
//! (wb-unprotected): demoted out of the old generation and traced
//! conservatively by every minor cycle.

use crate::object::{ObjRef, ObjType, FL_WB_PROTECTED};
use crate::space::ObjectSpace;

impl ObjectSpace {
    /// The write barrier: `a` now references `b`.
    pub fn writebarrier(&mut self, a: ObjRef, b: ObjRef) {
        if a.is_special() || b.is_special() {
            return;
        }
        unsafe {
            crate::gc_assert!(a.obj_type() != ObjType::None);
            crate::gc_assert!(a.obj_type() != ObjType::Moved);
            crate::gc_assert!(b.obj_type() != ObjType::None);
            crate::gc_assert!(b.obj_type() != ObjType::Moved);
        }

        if !self.during_incremental_marking {
            if !self.is_old(a) || self.is_old(b) {
                // nothing to record
            } else {
                self.writebarrier_generational(a, b);
            }
        } else {
            self.writebarrier_incremental(a, b);
        }
    }

    /// Non-incremental path: remember the old parent.
    fn writebarrier_generational(&mut self, a: ObjRef, b: ObjRef) {
        crate::gc_assert!(self.is_old(a));
        crate::gc_assert!(!self.is_old(b));

        if !self.is_remembered(a) {
            self.remember(a);
        }
    }

    /// Incremental path: only a black parent can break tri-color.
    fn writebarrier_incremental(&mut self, a: ObjRef, b: ObjRef) {
        if !self.is_black(a) {
            return;
        }

        if self.is_white(b) {
            if !self.is_wb_unprotected(a) {
                self.gc_mark_from(b, a);
            }
        } else if self.is_old(a) && !self.is_old(b) {
            self.remember(a);
        }

        if self.during_compacting {
            unsafe {
                let page = self.page_of(b);
                if !(*page).pin_bits.test_and_set(Self::bit_of(b)) {
                    (*page).pinned_slots += 1;
                }
            }
        }
    }

    /// Put `obj` in the remember set.
    pub(crate) fn remember(&mut self, obj: ObjRef) {
        unsafe {
            let page = self.page_of(obj);
            if !(*page).remembered_bits.test_and_set(Self::bit_of(obj)) {
                (*page).has_remembered_objects = true;
            }
        }
    }

    /// Explicitly re-register `obj` with the collector: during
    /// incremental marking a black object is re-greyed for rescanning;
    /// otherwise an old object is remembered.
    pub fn writebarrier_remember(&mut self, obj: ObjRef) {
        if obj.is_special() {
            return;
        }

        if self.during_incremental_marking {
            if self.is_black(obj) {
                self.gc_mark_from(obj, obj);
            }
        } else if self.is_old(obj) {
            self.remember(obj);
        }
    }

    /// Declare that `obj` no longer honors the write barrier.
    ///
    /// An OLD object is demoted and registered in the
    /// uncollectible-wb-unprotected set, so every minor cycle re-traces
    /// its children.
    pub fn writebarrier_unprotect(&mut self, obj: ObjRef) {
        if obj.is_special() || self.is_wb_unprotected(obj) {
            return;
        }

        unsafe {
            obj.clear_flag(FL_WB_PROTECTED);
        }

        if self.is_old(obj) {
            self.demote(obj);
            // The object was reachable from old objects; keep it alive
            // and shady-uncollectible until the next major cycle.
            unsafe {
                let page = self.page_of(obj);
                let bit = Self::bit_of(obj);
                (*page).mark_bits.set(bit);
                (*page).uncollectible_bits.set(bit);
                (*page).has_uncollectible_wb_unprotected_objects = true;
            }
            self.uncollectible_wb_unprotected_objects += 1;
        } else {
            unsafe {
                let page = self.page_of(obj);
                (*page).age_bits.set(Self::bit_of(obj), 0);
            }
        }

        unsafe {
            (*self.page_of(obj))
                .wb_unprotected_bits
                .set(Self::bit_of(obj));
        }
    }

    /// Mirror GC-visible attributes from `src` onto `dest`:
    /// wb-unprotection and finalizers.
    pub fn copy_attributes(&mut self, dest: ObjRef, src: ObjRef) {
        if self.is_wb_unprotected(src) {
            self.writebarrier_unprotect(dest);
        }
        self.copy_finalizer(dest, src);
    }
}
