//! Finalizers and Zombies - Deferred Teardown
//!
//! A finalizable object is not freed by sweep; it is converted to a
//! `Zombie` sentinel and pushed onto a lock-free deferred list threaded
//! through the zombies' own link words. The finalizer runner drains the
//! list outside the collector: it calls the native `dfree` callback,
//! runs the host callables registered for the object, and only then
//! returns the slot to its page's freelist.

use std::sync::atomic::Ordering;

use crate::object::{zombie, DFreeFn, ObjRef, FL_FINALIZE, FL_SEEN_OBJ_ID};
use crate::space::ObjectSpace;
use crate::vm::FinalizerCallable;

impl ObjectSpace {
    /// Register a finalizer callable for `obj`. A callable with a key
    /// already registered on the object is not added twice; the
    /// registered callable is returned either way.
    pub fn define_finalizer(
        &mut self,
        obj: ObjRef,
        callable: FinalizerCallable,
    ) -> FinalizerCallable {
        unsafe {
            obj.add_flag(FL_FINALIZE);
        }

        let list = self.finalizer_table.entry(obj.as_usize()).or_default();
        if let Some(existing) = list.iter().find(|c| c.key == callable.key) {
            return existing.clone();
        }
        list.push(callable.clone());
        callable
    }

    /// Remove every finalizer registered for `obj`.
    pub fn undefine_finalizer(&mut self, obj: ObjRef) {
        unsafe {
            obj.clear_flag(FL_FINALIZE);
        }
        self.finalizer_table.remove(&obj.as_usize());
    }

    /// Copy `src`'s finalizers onto `dest`.
    pub fn copy_finalizer(&mut self, dest: ObjRef, src: ObjRef) {
        if unsafe { !src.has_flag(FL_FINALIZE) } {
            return;
        }
        if let Some(list) = self.finalizer_table.get(&src.as_usize()).cloned() {
            unsafe {
                dest.add_flag(FL_FINALIZE);
            }
            self.finalizer_table.insert(dest.as_usize(), list);
        }
    }

    /// Convert a dead slot into a zombie and enqueue it on the deferred
    /// list. `FL_FINALIZE` survives the conversion.
    pub fn make_zombie(&mut self, obj: ObjRef, dfree: Option<DFreeFn>, data: usize) {
        unsafe {
            zombie::install(obj, dfree, data);

            let page = self.page_of(obj);
            (*page).final_slots += 1;
            self.heaps[(*page).heap_index].final_slots_count += 1;
        }

        // CAS-push onto the deferred list.
        let addr = obj.as_usize();
        loop {
            let head = self.deferred_final.load(Ordering::Acquire);
            unsafe {
                zombie::set_next_zombie(obj, head);
            }
            if self
                .deferred_final
                .compare_exchange_weak(head, addr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Drain the deferred list: run every pending finalizer and free the
    /// underlying slots.
    pub fn finalize_deferred(&mut self) {
        if self.finalizing {
            return;
        }
        self.finalizing = true;

        loop {
            let head = self.deferred_final.swap(0, Ordering::AcqRel);
            if head == 0 {
                break;
            }
            let mut cursor = head;
            while cursor != 0 {
                let z = ObjRef(cursor);
                let next = unsafe { zombie::next_zombie(z) };
                self.finalize_zombie(z);
                cursor = next;
            }
        }

        self.finalizing = false;
    }

    /// Run one zombie's teardown and recycle its slot.
    fn finalize_zombie(&mut self, obj: ObjRef) {
        unsafe {
            if let Some(dfree) = zombie::dfree(obj) {
                dfree(zombie::data(obj));
            }

            if obj.has_flag(FL_FINALIZE) {
                obj.clear_flag(FL_FINALIZE);
                if let Some(callables) = self.finalizer_table.remove(&obj.as_usize()) {
                    let id = self.object_id(obj);
                    for callable in callables {
                        callable.call(id);
                    }
                }
            }

            if obj.has_flag(FL_SEEN_OBJ_ID) {
                self.obj_free_object_id(obj);
            }

            let page = self.page_of(obj);
            (*page).final_slots -= 1;
            let heap_index = (*page).heap_index;
            self.heaps[heap_index].final_slots_count -= 1;
            self.heaps[heap_index].total_freed_objects += 1;
            (*page).add_free_slot(obj.as_usize());
        }
    }

    /// Shutdown path: run every registered finalizer whether or not its
    /// object died, then drain the deferred list.
    pub fn run_all_finalizers(&mut self) {
        let entries: Vec<(usize, Vec<FinalizerCallable>)> =
            self.finalizer_table.drain().collect();

        for (addr, callables) in entries {
            let obj = ObjRef(addr);
            unsafe {
                obj.clear_flag(FL_FINALIZE);
            }
            let id = self.object_id(obj);
            for callable in callables {
                callable.call(id);
            }
        }

        self.finalize_deferred();
    }
}
