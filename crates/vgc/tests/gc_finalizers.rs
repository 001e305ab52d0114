//! Finalizers and Object IDs - Zombies, Deferred Runs, ID Lifetime
//!
//! The literal scenario: a finalizer registered on a dropped object runs
//! exactly once, the FINALIZE flag clears, and the object's id becomes
//! unresolvable and is never reissued.

mod common;

use std::sync::{Arc, Mutex};

use common::GcFixture;
use vgc::{FinalizerCallable, GcError, FL_FINALIZE};

#[test]
fn test_finalizer_runs_exactly_once() {
    let mut fixture = GcFixture::new();

    let log: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let f = fixture.alloc();
    fixture.add_root(f);
    let id = fixture.objspace.object_id(f);

    let log2 = Arc::clone(&log);
    fixture.objspace.define_finalizer(
        f,
        FinalizerCallable::new(1, move |finalized_id| {
            log2.lock().unwrap().push(finalized_id);
        }),
    );
    unsafe {
        assert!(f.has_flag(FL_FINALIZE));
    }

    fixture.remove_root(f);
    fixture.full_gc();
    fixture.objspace.finalize_deferred();
    fixture.full_gc();
    fixture.objspace.finalize_deferred();

    assert_eq!(log.lock().unwrap().len(), 1, "finalizer must run exactly once");
    unsafe {
        assert!(!f.has_flag(FL_FINALIZE), "FINALIZE flag must be cleared");
        assert!(f.is_free_cell(), "slot must be recycled after finalization");
    }

    // The original id can no longer be resolved and is never reissued.
    assert!(matches!(
        fixture.objspace.object_id_to_ref(id),
        Err(GcError::RangeError(_))
    ));
    let fresh = fixture.alloc();
    let fresh_id = fixture.objspace.object_id(fresh);
    assert_ne!(fresh_id, id);
}

#[test]
fn test_duplicate_finalizer_keys_collapse() {
    let mut fixture = GcFixture::new();
    let hits: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));

    let obj = fixture.alloc();
    fixture.add_root(obj);

    for _ in 0..3 {
        let hits2 = Arc::clone(&hits);
        fixture.objspace.define_finalizer(
            obj,
            FinalizerCallable::new(42, move |_| {
                *hits2.lock().unwrap() += 1;
            }),
        );
    }

    fixture.remove_root(obj);
    fixture.full_gc();
    fixture.objspace.finalize_deferred();

    assert_eq!(*hits.lock().unwrap(), 1, "same-key callables must deduplicate");
}

#[test]
fn test_undefine_finalizer_cancels() {
    let mut fixture = GcFixture::new();
    let hits: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));

    let obj = fixture.alloc();
    fixture.add_root(obj);
    let hits2 = Arc::clone(&hits);
    fixture.objspace.define_finalizer(
        obj,
        FinalizerCallable::new(7, move |_| {
            *hits2.lock().unwrap() += 1;
        }),
    );
    fixture.objspace.undefine_finalizer(obj);

    fixture.remove_root(obj);
    fixture.full_gc();
    fixture.objspace.finalize_deferred();

    assert_eq!(*hits.lock().unwrap(), 0);
}

#[test]
fn test_copy_finalizer() {
    let mut fixture = GcFixture::new();
    let hits: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));

    let src = fixture.alloc();
    let dest = fixture.alloc();
    fixture.add_root(src);
    fixture.add_root(dest);

    let hits2 = Arc::clone(&hits);
    fixture.objspace.define_finalizer(
        src,
        FinalizerCallable::new(9, move |_| {
            *hits2.lock().unwrap() += 1;
        }),
    );
    fixture.objspace.copy_finalizer(dest, src);

    fixture.clear_roots();
    fixture.full_gc();
    fixture.objspace.finalize_deferred();

    assert_eq!(*hits.lock().unwrap(), 2, "both carriers finalize");
}

#[test]
fn test_object_id_round_trip_and_stride() {
    let mut fixture = GcFixture::new();

    let a = fixture.alloc();
    let b = fixture.alloc();
    fixture.add_root(a);
    fixture.add_root(b);

    let id_a = fixture.objspace.object_id(a);
    let id_b = fixture.objspace.object_id(b);

    // Monotonic, strided so ids never collide with tagged immediates.
    assert_eq!(id_a % 8, 0);
    assert_eq!(id_b, id_a + 8);
    // Stable on re-request.
    assert_eq!(fixture.objspace.object_id(a), id_a);

    assert_eq!(fixture.objspace.object_id_to_ref(id_a).unwrap(), a);
    assert_eq!(fixture.objspace.object_id_to_ref(id_b).unwrap(), b);

    // Misaligned values are rejected outright.
    assert!(fixture.objspace.object_id_to_ref(id_a + 1).is_err());
    assert!(fixture.objspace.object_id_to_ref(0).is_err());
}

#[test]
fn test_object_id_survives_compaction() {
    let mut fixture = GcFixture::new();
    let nodes = fixture.alloc_chain(5_000);
    fixture.set_child(nodes[9], 0, vgc::ObjRef::NULL);

    // An id assigned to a movable interior node follows the object.
    let target = nodes[5];
    let id = fixture.objspace.object_id(target);

    fixture.compact_gc();

    let healed = fixture.objspace.object_id_to_ref(id).unwrap();
    assert_eq!(fixture.objspace.object_id(healed), id);
    unsafe {
        assert_ne!(healed.obj_type(), vgc::ObjType::Moved);
    }
}
