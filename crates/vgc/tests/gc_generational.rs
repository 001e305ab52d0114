//! Generational Behavior - Aging, Remember Set, Write Barrier
//!
//! Verifies promotion to OLD, the old-to-young remember protocol, shady
//! (wb-unprotected) handling, and the minor-survives-old scenario.

mod common;

use common::GcFixture;
use vgc::OLD_AGE;

#[test]
fn test_aging_saturates_at_old() {
    let mut fixture = GcFixture::new();
    let obj = fixture.alloc();
    fixture.add_root(obj);

    assert_eq!(fixture.objspace.age_of(obj), 0);
    fixture.full_gc();
    assert_eq!(fixture.objspace.age_of(obj), 1);
    fixture.full_gc();
    assert_eq!(fixture.objspace.age_of(obj), 2);
    fixture.full_gc();
    assert_eq!(fixture.objspace.age_of(obj), OLD_AGE);
    assert!(fixture.objspace.is_old(obj));
    assert!(fixture.objspace.is_uncollectible(obj));

    // Saturation: further cycles do not age past OLD.
    fixture.full_gc();
    assert_eq!(fixture.objspace.age_of(obj), OLD_AGE);
}

#[test]
fn test_old_objects_counted() {
    let mut fixture = GcFixture::new();
    let obj = fixture.alloc();
    fixture.add_root(obj);
    fixture.make_old(obj);
    assert!(fixture.objspace.stat("old_objects").unwrap() >= 1);
}

#[test]
fn test_minor_gc_survives_old_to_young_reference() {
    let mut fixture = GcFixture::new();

    let x = fixture.alloc();
    fixture.add_root(x);
    fixture.make_old(x);

    // Young object reachable only through the old one.
    let y = fixture.alloc();
    fixture.set_child(x, 0, y);

    // The write barrier must have remembered the old parent before any
    // collection runs.
    assert!(
        fixture.objspace.is_remembered(x),
        "old parent with young child must be in the remember set"
    );

    fixture.minor_gc();

    unsafe {
        assert!(!y.is_free_cell(), "young child must survive the minor GC");
    }
    // The relation persists, so the parent is remembered again for the
    // next minor cycle.
    assert!(fixture.objspace.is_remembered(x));
}

#[test]
fn test_young_garbage_dies_in_minor_gc() {
    let mut fixture = GcFixture::new();
    fixture.full_gc();

    let keep = fixture.alloc();
    fixture.add_root(keep);
    let doomed: Vec<_> = (0..100).map(|_| fixture.alloc()).collect();

    fixture.minor_gc();

    unsafe {
        assert!(!keep.is_free_cell());
        let dead = doomed.iter().filter(|o| o.is_free_cell()).count();
        assert!(dead >= 90, "most unrooted young objects must be swept, {} died", dead);
    }
}

#[test]
fn test_writebarrier_unprotect_demotes_old() {
    let mut fixture = GcFixture::new();
    let obj = fixture.alloc();
    fixture.add_root(obj);
    fixture.make_old(obj);

    let old_count = fixture.objspace.stat("old_objects").unwrap();
    fixture.objspace.writebarrier_unprotect(obj);

    assert!(fixture.objspace.is_wb_unprotected(obj));
    assert!(!fixture.objspace.is_old(obj), "unprotect must demote");
    assert_eq!(fixture.objspace.age_of(obj), 0);
    assert!(fixture.objspace.stat("old_objects").unwrap() < old_count);
    // Tracked as shady-uncollectible until the next major cycle.
    assert!(fixture.objspace.is_uncollectible(obj));
    assert!(
        fixture
            .objspace
            .stat("remembered_wb_unprotected_objects")
            .unwrap()
            >= 1
    );
}

#[test]
fn test_shady_object_children_traced_every_minor() {
    let mut fixture = GcFixture::new();
    let shady = fixture.alloc();
    fixture.add_root(shady);
    fixture.make_old(shady);

    // Demoting an OLD object registers it in the shady-uncollectible
    // set; from now on it survives without roots and its children are
    // traced conservatively by every minor cycle.
    fixture.objspace.writebarrier_unprotect(shady);
    fixture.remove_root(shady);

    // A young child stored WITHOUT a write barrier.
    let child = fixture.alloc();
    unsafe {
        (*shady.slot()).v1 = child.as_usize();
    }

    fixture.minor_gc();
    unsafe {
        assert!(!shady.is_free_cell(), "shady-uncollectible object must survive");
        assert!(
            !child.is_free_cell(),
            "children of shady objects must be traced by minor cycles"
        );
    }
}
