//! Heap-Wide Invariants - Consistency, Conservation, Idempotence

mod common;

use common::GcFixture;
use vgc::{GcConfig, HEAP_PAGE_ALIGN};

#[test]
fn test_page_alignment_and_containment() {
    let mut fixture = GcFixture::new();
    let mut objs = Vec::new();
    for _ in 0..2000 {
        objs.push(fixture.alloc());
    }

    for &obj in &objs {
        // Slots sit on base-slot strides within an aligned body, so the
        // page and the bitmap index are recoverable by masking alone.
        assert_eq!((obj.as_usize() & (HEAP_PAGE_ALIGN - 1)) % 40, 0);
        assert!(fixture.objspace.is_pointer_to_heap(obj.as_usize()));
        // An interior, misaligned address is not a slot.
        assert!(!fixture.objspace.is_pointer_to_heap(obj.as_usize() + 1));
    }

    fixture
        .objspace
        .verify_internal_consistency()
        .expect("fresh heap must verify");
}

#[test]
fn test_sweep_conservation() {
    let mut fixture = GcFixture::new();
    let keep = fixture.alloc_chain(1000);
    for _ in 0..3000 {
        fixture.alloc();
    }
    fixture.full_gc();

    // allocated - freed - finalizing == live, and the walk agrees.
    let mut walked = 0u64;
    fixture.objspace.each_object(|obj| unsafe {
        if !matches!(obj.obj_type(), vgc::ObjType::Moved | vgc::ObjType::Zombie) {
            walked += 1;
        }
    });
    assert_eq!(walked, fixture.objspace.live_slot_count());
    assert!(walked >= keep.len() as u64);

    fixture
        .objspace
        .verify_internal_consistency()
        .expect("post-sweep heap must verify");
}

#[test]
fn test_repeated_full_gc_is_idempotent() {
    let mut fixture = GcFixture::new();
    fixture.alloc_chain(2000);

    fixture.full_gc();
    fixture.full_gc();
    let live = fixture.objspace.live_slot_count();
    let pages = fixture.objspace.stat("heap_allocated_pages").unwrap();
    let old = fixture.objspace.stat("old_objects").unwrap();

    for _ in 0..3 {
        fixture.full_gc();
    }

    assert_eq!(fixture.objspace.live_slot_count(), live);
    assert_eq!(
        fixture.objspace.stat("heap_allocated_pages").unwrap(),
        pages
    );
    assert_eq!(fixture.objspace.stat("old_objects").unwrap(), old);
}

#[test]
fn test_gc_counters_advance() {
    let mut fixture = GcFixture::new();
    let count = fixture.objspace.gc_count();
    fixture.full_gc();
    fixture.minor_gc();
    assert_eq!(fixture.objspace.gc_count(), count + 2);
    assert!(fixture.objspace.stat("major_gc_count").unwrap() >= 1);
    assert!(fixture.objspace.stat("minor_gc_count").unwrap() >= 1);
}

#[test]
fn test_latest_gc_info() {
    let mut fixture = GcFixture::new();
    fixture.full_gc();
    assert_eq!(
        fixture.objspace.latest_gc_info_key("full").as_deref(),
        Some("true")
    );
    assert_eq!(
        fixture.objspace.latest_gc_info_key("gc_by").as_deref(),
        Some("method")
    );
    assert_eq!(
        fixture.objspace.latest_gc_info_key("state").as_deref(),
        Some("none")
    );
    assert!(fixture.objspace.latest_gc_info_key("bogus").is_none());
}

#[test]
fn test_disable_suppresses_collection() {
    let mut fixture = GcFixture::new();
    fixture.objspace.gc_disable();
    let count = fixture.objspace.gc_count();
    fixture.full_gc();
    assert_eq!(fixture.objspace.gc_count(), count, "disabled GC must not run");
    fixture.objspace.gc_enable();
    fixture.full_gc();
    assert_eq!(fixture.objspace.gc_count(), count + 1);
}

#[test]
fn test_full_mark_suppression_extends_heap() {
    let mut fixture = GcFixture::with_config(GcConfig {
        rgengc_allow_full_mark: false,
        ..GcConfig::default()
    });

    let obj = fixture.alloc();
    fixture.add_root(obj);
    for _ in 0..5 {
        fixture.full_gc();
    }

    // Major suppressed: every cycle stayed minor and aging is off.
    assert_eq!(fixture.objspace.stat("major_gc_count"), Some(0));
    assert_eq!(fixture.objspace.age_of(obj), 0);
}

#[test]
fn test_malloc_accounting_trigger() {
    let mut fixture = GcFixture::new();
    let count = fixture.objspace.gc_count();

    // Below the limit: no collection.
    fixture.objspace.adjust_memory_usage(1024);
    fixture.objspace.malloc_gc_check();
    assert_eq!(fixture.objspace.gc_count(), count);

    // Blow through the 16 MiB floor.
    fixture.objspace.adjust_memory_usage(40 * 1024 * 1024);
    fixture.objspace.malloc_gc_check();
    assert_eq!(fixture.objspace.gc_count(), count + 1);
    assert_eq!(
        fixture.objspace.latest_gc_info_key("gc_by").as_deref(),
        Some("malloc")
    );
}

#[test]
fn test_stress_collects_on_allocation() {
    let mut fixture = GcFixture::new();
    fixture.objspace.stress_set(true);
    let count = fixture.objspace.gc_count();
    fixture.alloc();
    assert!(fixture.objspace.gc_count() > count);
    fixture.objspace.stress_set(false);
}
