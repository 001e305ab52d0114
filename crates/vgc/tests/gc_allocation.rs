//! Allocation and Sweep - Size Classes, Freelists, Reclamation
//!
//! Covers the allocator fast path (cache hit, refill, size-class
//! routing) and the end-to-end allocate-then-collect scenario.

mod common;

use common::GcFixture;
use vgc::{GcError, ObjType};

#[test]
fn test_allocation_returns_distinct_live_slots() {
    let mut fixture = GcFixture::new();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
        let obj = fixture.alloc();
        assert!(!obj.is_null());
        assert!(seen.insert(obj.as_usize()), "slot handed out twice");
        unsafe {
            assert_eq!(obj.obj_type(), ObjType::Object);
        }
    }
}

#[test]
fn test_size_class_routing() {
    let mut fixture = GcFixture::new();
    let sizes = [(1, 40), (40, 40), (41, 80), (100, 160), (300, 320), (640, 640)];
    for (request, expected_slot) in sizes {
        let obj = fixture.alloc_sized(request);
        assert_eq!(
            fixture.objspace.obj_slot_size(obj),
            expected_slot,
            "request of {} bytes should land in the {}-byte class",
            request,
            expected_slot
        );
    }
}

#[test]
fn test_oversized_allocation_rejected() {
    let mut fixture = GcFixture::new();
    let result = fixture.objspace.new_obj(
        fixture.cache,
        0,
        ObjType::Object as usize,
        0,
        0,
        0,
        true,
        641,
    );
    assert!(matches!(result, Err(GcError::RangeError(_))));
}

#[test]
fn test_heap_sizes_reports_five_classes() {
    let fixture = GcFixture::new();
    let sizes = fixture.objspace.heap_sizes();
    assert_eq!(sizes, [40, 80, 160, 320, 640, 0]);
}

#[test]
fn test_alloc_and_sweep_reclaims_garbage() {
    let mut fixture = GcFixture::new();

    // Warm up so the boot-growth path is behind us.
    fixture.full_gc();

    let live_before = fixture.objspace.stat("heap_live_slots").unwrap();
    let freed_before = fixture.objspace.stat("total_freed_objects").unwrap();

    let mut objs = Vec::with_capacity(10_000);
    for _ in 0..10_000 {
        objs.push(fixture.alloc_sized(48));
    }
    for &obj in &objs {
        fixture.add_root(obj);
    }
    fixture.full_gc();
    assert!(
        fixture.objspace.stat("heap_live_slots").unwrap() >= live_before + 10_000,
        "rooted objects must survive"
    );

    // Drop every root and collect twice (survivors of the first sweep's
    // stored marks go on the second pass).
    fixture.clear_roots();
    fixture.full_gc();

    let live_after = fixture.objspace.stat("heap_live_slots").unwrap();
    let freed_after = fixture.objspace.stat("total_freed_objects").unwrap();
    assert!(
        live_after <= live_before,
        "live slots should return to the baseline, got {} vs {}",
        live_after,
        live_before
    );
    assert!(
        freed_after >= freed_before + 10_000,
        "at least the dropped objects must be freed"
    );

    fixture
        .objspace
        .verify_internal_consistency()
        .expect("heap must be consistent after sweep");
}

#[test]
fn test_cache_refill_across_pages() {
    let mut fixture = GcFixture::new();
    // More allocations than one page holds forces repeated refills.
    let per_page = 1600;
    for _ in 0..(per_page * 3) {
        fixture.alloc();
    }
    assert!(fixture.objspace.stat("heap_allocated_pages").unwrap() >= 3);
}

#[test]
fn test_allocation_accounting_matches_walk() {
    let mut fixture = GcFixture::new();
    for _ in 0..500 {
        fixture.alloc();
    }
    let mut walked = 0u64;
    fixture.objspace.each_object(|_| walked += 1);
    assert_eq!(walked, fixture.objspace.live_slot_count());
}
