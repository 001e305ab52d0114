//! Compaction - Movement, Forwarding, Healing, Page Reclaim
//!
//! The literal scenario: a large population, most of it dropped, then a
//! compacting collection must shrink the page set and leave no live
//! reference pointing at a forwarding cell.

mod common;

use common::GcFixture;
use vgc::ObjType;

#[test]
fn test_compact_drops_pages_and_heals_references() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut fixture = GcFixture::new();

    // A spine chain where every node carries two leaf children: 100k
    // objects total.
    let spine = fixture.alloc_chain(33_334);
    let mut leaves = 0usize;
    for &node in &spine {
        let a = fixture.alloc();
        let b = fixture.alloc();
        fixture.set_child(node, 1, a);
        fixture.set_child(node, 2, b);
        leaves += 2;
    }
    assert!(spine.len() + leaves >= 100_000);

    // Null out ~90% of the leaves at random.
    let mut rng = StdRng::seed_from_u64(0x6b1f);
    let mut retained_leaves = 0usize;
    for &node in &spine {
        for idx in [1, 2] {
            if rng.gen_range(0..10) == 0 {
                retained_leaves += 1;
            } else {
                fixture.set_child(node, idx, vgc::ObjRef::NULL);
            }
        }
    }

    fixture.full_gc();
    let pages_before = fixture.objspace.stat("heap_allocated_pages").unwrap();

    fixture.compact_gc();

    let pages_after = fixture.objspace.stat("heap_allocated_pages").unwrap();
    assert!(
        pages_after < pages_before,
        "compaction should shrink the page set ({} -> {})",
        pages_before,
        pages_after
    );
    assert!(
        fixture.objspace.stat("compact_moved_objects").unwrap() > 0,
        "a fragmented heap must move something"
    );

    // Full traversal from the root reaches exactly the survivors, and
    // never a forwarding cell.
    let mut reached = 0usize;
    let mut cursor = fixture.objspace.location(spine[0]);
    while !cursor.is_null() {
        unsafe {
            assert_ne!(cursor.obj_type(), vgc::ObjType::Moved);
        }
        reached += 1;
        for idx in [1, 2] {
            let leaf = fixture.child(cursor, idx);
            if !leaf.is_null() {
                unsafe {
                    assert_ne!(leaf.obj_type(), vgc::ObjType::Moved);
                }
                reached += 1;
            }
        }
        cursor = fixture.child(cursor, 0);
    }
    assert_eq!(reached, spine.len() + retained_leaves);

    fixture
        .objspace
        .verify_compaction_references()
        .expect("no marked forwarding cell may remain");
}

#[test]
fn test_pinned_roots_do_not_move() {
    let mut fixture = GcFixture::new();
    let nodes = fixture.alloc_chain(5_000);
    fixture.set_child(nodes[99], 0, vgc::ObjRef::NULL);

    let head_before = nodes[0];
    fixture.compact_gc();

    // Roots are reported pinned; the head keeps its address and is no
    // forwarding cell.
    unsafe {
        assert_ne!(head_before.obj_type(), ObjType::Moved);
    }
    assert_eq!(fixture.objspace.location(head_before), head_before);
}

#[test]
fn test_moved_objects_keep_payload() {
    let mut fixture = GcFixture::new();

    // Tag every surviving node's second payload word with its index.
    let nodes = fixture.alloc_chain(20_000);
    for (i, &n) in nodes.iter().take(50).enumerate() {
        unsafe {
            (*n.slot()).v2 = 0xbeef_0000 + i;
        }
    }
    fixture.set_child(nodes[49], 0, vgc::ObjRef::NULL);

    fixture.compact_gc();

    let mut cursor = fixture.objspace.location(nodes[0]);
    for i in 0..50 {
        unsafe {
            assert_eq!(
                (*cursor.slot()).v2,
                0xbeef_0000 + i,
                "payload of node {} corrupted by the move",
                i
            );
        }
        cursor = fixture.child(cursor, 0);
    }
}

#[test]
fn test_no_locked_pages_survive_compaction() {
    let mut fixture = GcFixture::new();
    let nodes = fixture.alloc_chain(30_000);
    fixture.set_child(nodes[999], 0, vgc::ObjRef::NULL);

    fixture.compact_gc();

    // The cycle unlocks every drained page before its reference-update
    // pass, so a post-cycle read through the barrier is the identity on
    // the pinned root and never trips page invalidation. (The locked
    // window itself is only reachable mid-cycle; the invalidation walk
    // is covered by the collector's unit tests.)
    let healed = fixture.objspace.location(nodes[0]);
    assert_eq!(healed, nodes[0]);
    assert!(fixture.objspace.stat("compact_moved_objects").unwrap() > 0);

    // Traversal still sound after the barrier touch.
    assert_eq!(fixture.walk_chain(nodes[0]), 1_000);
}

#[test]
fn test_repeated_compaction_is_stable() {
    let mut fixture = GcFixture::new();
    let nodes = fixture.alloc_chain(10_000);
    fixture.set_child(nodes[499], 0, vgc::ObjRef::NULL);

    fixture.compact_gc();
    let live_first = fixture.objspace.live_slot_count();
    fixture.compact_gc();
    let live_second = fixture.objspace.live_slot_count();

    assert_eq!(live_first, live_second);
    assert_eq!(fixture.walk_chain(nodes[0]), 500);
}
