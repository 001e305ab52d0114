//! Test Utilities for the Collector Test Suite
//!
//! `TestVm` is a minimal host: objects of type `Object` treat their
//! three payload words as child references, roots live in a locked
//! vector and are reported pinned, and weak cells registered with the
//! fixture are re-registered on every mark cycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vgc::{
    CacheId, GcConfig, GcParams, ObjRef, ObjType, ObjectSpace, VmHooks,
};

/// Number of full collections used to promote an object to OLD.
pub const PROMOTION_CYCLES: usize = vgc::OLD_AGE as usize;

/// Minimal host VM: payload words are child refs.
pub struct TestVm {
    pub roots: Mutex<Vec<ObjRef>>,
    /// Addresses of host-owned `ObjRef` cells to track weakly.
    pub weak_cells: Mutex<Vec<usize>>,
    pub freed: AtomicUsize,
}

impl TestVm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            roots: Mutex::new(Vec::new()),
            weak_cells: Mutex::new(Vec::new()),
            freed: AtomicUsize::new(0),
        })
    }
}

impl VmHooks for TestVm {
    fn mark_roots(&self, objspace: &mut ObjectSpace) {
        for &root in self.roots.lock().unwrap().iter() {
            objspace.mark_and_pin(root);
        }
        for &cell in self.weak_cells.lock().unwrap().iter() {
            objspace.mark_weak(cell as *mut ObjRef);
        }
    }

    fn mark_children(&self, objspace: &mut ObjectSpace, obj: ObjRef) {
        unsafe {
            if obj.obj_type() != ObjType::Object {
                return;
            }
            let slot = obj.slot();
            for word in [(*slot).v1, (*slot).v2, (*slot).v3] {
                if word != 0 {
                    objspace.mark(ObjRef(word));
                }
            }
        }
    }

    fn update_references(&self, objspace: &mut ObjectSpace, obj: ObjRef) {
        unsafe {
            if obj.obj_type() != ObjType::Object {
                return;
            }
            let slot = obj.slot();
            for word in [&mut (*slot).v1, &mut (*slot).v2, &mut (*slot).v3] {
                if *word != 0 {
                    let mut r = ObjRef(*word);
                    objspace.mark_and_move(&mut r);
                    *word = r.as_usize();
                }
            }
        }
    }

    fn obj_free(&self, _obj: ObjRef) -> bool {
        self.freed.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn update_weak_tables(&self, objspace: &mut ObjectSpace) {
        for &cell in self.weak_cells.lock().unwrap().iter() {
            unsafe {
                let cell = cell as *mut ObjRef;
                if !(*cell).is_special() {
                    *cell = objspace.location(*cell);
                }
            }
        }
    }
}

/// One object space with one allocation cache and a `TestVm`.
pub struct GcFixture {
    pub objspace: ObjectSpace,
    pub vm: Arc<TestVm>,
    pub cache: CacheId,
}

impl GcFixture {
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    pub fn with_config(config: GcConfig) -> Self {
        let vm = TestVm::new();
        let mut objspace = ObjectSpace::new(GcParams::default(), config, vm.clone())
            .expect("object space creation must succeed");
        objspace.prepare_heap().expect("initial heap growth must succeed");
        let cache = objspace.create_cache();
        Self {
            objspace,
            vm,
            cache,
        }
    }

    /// Allocate a wb-protected object of the base size class.
    pub fn alloc(&mut self) -> ObjRef {
        self.alloc_sized(40)
    }

    pub fn alloc_sized(&mut self, size: usize) -> ObjRef {
        self.objspace
            .new_obj(
                self.cache,
                0,
                ObjType::Object as usize,
                0,
                0,
                0,
                true,
                size,
            )
            .expect("allocation must succeed")
    }

    pub fn alloc_unprotected(&mut self) -> ObjRef {
        let obj = self
            .objspace
            .new_obj(
                self.cache,
                0,
                ObjType::Object as usize,
                0,
                0,
                0,
                false,
                40,
            )
            .expect("allocation must succeed");
        self.objspace.writebarrier_unprotect(obj);
        obj
    }

    pub fn add_root(&self, obj: ObjRef) {
        self.vm.roots.lock().unwrap().push(obj);
    }

    pub fn remove_root(&self, obj: ObjRef) {
        self.vm.roots.lock().unwrap().retain(|&r| r != obj);
    }

    pub fn clear_roots(&self) {
        self.vm.roots.lock().unwrap().clear();
    }

    /// Store `child` into `parent`'s payload word `idx` (0..3), firing
    /// the write barrier.
    pub fn set_child(&mut self, parent: ObjRef, idx: usize, child: ObjRef) {
        unsafe {
            let slot = parent.slot();
            match idx {
                0 => (*slot).v1 = child.as_usize(),
                1 => (*slot).v2 = child.as_usize(),
                2 => (*slot).v3 = child.as_usize(),
                _ => panic!("child index out of range"),
            }
        }
        if !child.is_null() {
            self.objspace.writebarrier(parent, child);
        }
    }

    pub fn child(&self, parent: ObjRef, idx: usize) -> ObjRef {
        unsafe {
            let slot = parent.slot();
            ObjRef(match idx {
                0 => (*slot).v1,
                1 => (*slot).v2,
                2 => (*slot).v3,
                _ => panic!("child index out of range"),
            })
        }
    }

    /// Immediate full collection.
    pub fn full_gc(&mut self) {
        self.objspace.start(true, true, true, false);
    }

    /// Immediate minor collection (subject to pending major reasons).
    pub fn minor_gc(&mut self) {
        self.objspace.start(false, true, true, false);
    }

    /// Full collection with compaction.
    pub fn compact_gc(&mut self) {
        self.objspace.start(true, true, true, true);
    }

    /// Promote a rooted object to OLD by running promotion cycles, plus
    /// one settling cycle so generational limits are in place.
    pub fn make_old(&mut self, obj: ObjRef) {
        for _ in 0..PROMOTION_CYCLES {
            self.full_gc();
        }
        assert!(
            self.objspace.is_old(obj),
            "object should be OLD after {} full collections",
            PROMOTION_CYCLES
        );
        self.full_gc();
    }

    /// Allocate a rooted chain of `n` objects linked through the first
    /// payload word; returns every node, head first.
    pub fn alloc_chain(&mut self, n: usize) -> Vec<ObjRef> {
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            nodes.push(self.alloc());
        }
        for i in 0..n.saturating_sub(1) {
            let (parent, child) = (nodes[i], nodes[i + 1]);
            self.set_child(parent, 0, child);
        }
        if let Some(&head) = nodes.first() {
            self.add_root(head);
        }
        nodes
    }

    /// Follow a chain from `head` through healed references, counting
    /// nodes and asserting no forwarding cell is reachable.
    pub fn walk_chain(&mut self, head: ObjRef) -> usize {
        let mut count = 0;
        let mut cursor = self.objspace.location(head);
        while !cursor.is_null() {
            unsafe {
                assert_ne!(
                    cursor.obj_type(),
                    ObjType::Moved,
                    "live reference reached a forwarding cell"
                );
            }
            count += 1;
            cursor = self.child(cursor, 0);
        }
        count
    }
}
