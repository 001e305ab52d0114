//! Weak References - Tombstoning and Retention Counts

mod common;

use common::GcFixture;
use vgc::ObjRef;

#[test]
fn test_dead_target_becomes_undef() {
    let mut fixture = GcFixture::new();

    let target = fixture.alloc();
    let mut cell: Box<ObjRef> = Box::new(target);
    fixture
        .vm
        .weak_cells
        .lock()
        .unwrap()
        .push(&mut *cell as *mut ObjRef as usize);

    // No strong refs to the target.
    fixture.full_gc();

    assert_eq!(*cell, ObjRef::UNDEF, "dead weak target must tombstone");
    assert_eq!(fixture.objspace.stat("weak_references_count"), Some(1));
    assert_eq!(
        fixture.objspace.stat("retained_weak_references_count"),
        Some(0)
    );
}

#[test]
fn test_live_target_retained() {
    let mut fixture = GcFixture::new();

    let target = fixture.alloc();
    fixture.add_root(target);
    let mut cell: Box<ObjRef> = Box::new(target);
    fixture
        .vm
        .weak_cells
        .lock()
        .unwrap()
        .push(&mut *cell as *mut ObjRef as usize);

    fixture.full_gc();

    assert_eq!(*cell, target, "live weak target must be retained");
    assert_eq!(
        fixture.objspace.stat("retained_weak_references_count"),
        Some(1)
    );

    // Dropping the strong root flips the same cell on the next cycle.
    fixture.remove_root(target);
    fixture.full_gc();
    fixture.full_gc();
    assert_eq!(*cell, ObjRef::UNDEF);
}

#[test]
fn test_weak_cell_healed_after_compaction() {
    let mut fixture = GcFixture::new();
    let nodes = fixture.alloc_chain(5_000);
    fixture.set_child(nodes[99], 0, ObjRef::NULL);

    // Weak cell on a movable interior node that stays strongly
    // reachable through the chain.
    let target = nodes[50];
    let mut cell: Box<ObjRef> = Box::new(target);
    fixture
        .vm
        .weak_cells
        .lock()
        .unwrap()
        .push(&mut *cell as *mut ObjRef as usize);

    fixture.compact_gc();

    assert!(!cell.is_special(), "cell must stay populated");
    unsafe {
        assert_ne!(
            cell.obj_type(),
            vgc::ObjType::Moved,
            "weak tables must be rewritten through forwarding cells"
        );
    }
}
