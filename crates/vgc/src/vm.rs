//! Host Interface - Callbacks the VM Provides to the Collector
//!
//! The collector owns slots and bitmaps; the host owns object semantics.
//! Everything the collector needs to know about object contents comes
//! through [`VmHooks`]: root enumeration, child traversal, reference
//! rewriting after compaction, and per-type teardown.
//!
//! Hooks are invoked with the object space borrowed mutably, so a hook
//! may re-enter marking primitives (`mark`, `mark_and_move`) but must not
//! allocate.

use std::sync::Arc;

use crate::object::ObjRef;
use crate::space::ObjectSpace;

/// Host callbacks. One implementation per VM.
pub trait VmHooks: Send + Sync {
    /// Enumerate roots: stacks, globals, machine registers. Roots must be
    /// reported through `objspace.mark_and_pin` (or `mark_maybe` for
    /// ambiguous words).
    fn mark_roots(&self, objspace: &mut ObjectSpace);

    /// Report every reference held by `obj` through `objspace.mark` (or
    /// `mark_and_move` during reference updating - see
    /// [`VmHooks::update_references`]).
    fn mark_children(&self, objspace: &mut ObjectSpace, obj: ObjRef);

    /// Rewrite every outgoing reference of `obj` through
    /// `objspace.mark_and_move`, which follows forwarding cells.
    fn update_references(&self, objspace: &mut ObjectSpace, obj: ObjRef);

    /// Per-type teardown for a dead object. Returns false when the object
    /// needs deferred finalization (the collector will zombie it).
    fn obj_free(&self, obj: ObjRef) -> bool;

    /// Preferred payload size for `obj`, used to pick a compaction
    /// destination size class. 0 keeps the current class.
    fn obj_optimal_size(&self, _obj: ObjRef) -> usize {
        0
    }

    /// Recompute a shape id for `obj` when it moves to another size
    /// class. Returning 0 vetoes the cross-class move.
    fn rebuild_shape(&self, obj: ObjRef, _dest_heap_index: usize) -> u32 {
        unsafe { obj.shape_id() }
    }

    /// Rewrite the host's own weak tables after compaction.
    fn update_weak_tables(&self, _objspace: &mut ObjectSpace) {}

    /// Detach VM-internal weak references to a dying object.
    fn detach_vm_weak_references(&self, _obj: ObjRef) {}

    /// Object-freed event, fired before teardown.
    fn event_freeobj(&self, _obj: ObjRef) {}
}

/// A host finalizer callable.
///
/// `key` is the host's equality identity: registering two callables with
/// the same key on one object keeps only the first.
#[derive(Clone)]
pub struct FinalizerCallable {
    pub key: u64,
    pub func: Arc<dyn Fn(u64) + Send + Sync>,
}

impl FinalizerCallable {
    pub fn new(key: u64, func: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            key,
            func: Arc::new(func),
        }
    }

    /// Run the callable with the finalized object's id.
    pub fn call(&self, object_id: u64) {
        (self.func)(object_id);
    }
}

impl std::fmt::Debug for FinalizerCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerCallable")
            .field("key", &self.key)
            .finish()
    }
}
