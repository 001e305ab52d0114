//! Allocation and collection throughput benchmarks.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use vgc::{GcConfig, GcParams, ObjRef, ObjType, ObjectSpace, VmHooks};

struct BenchVm;

impl VmHooks for BenchVm {
    fn mark_roots(&self, _objspace: &mut ObjectSpace) {}

    fn mark_children(&self, objspace: &mut ObjectSpace, obj: ObjRef) {
        unsafe {
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
        true
    }
}

fn bench_allocation(c: &mut Criterion) {
    c.bench_function("alloc_40_bytes", |b| {
        let mut objspace =
            ObjectSpace::new(GcParams::default(), GcConfig::default(), Arc::new(BenchVm))
                .unwrap();
        objspace.prepare_heap().unwrap();
        let cache = objspace.create_cache();

        b.iter(|| {
            objspace
                .new_obj(cache, 0, ObjType::Object as usize, 0, 0, 0, true, 40)
                .unwrap()
        });
    });
}

fn bench_full_gc(c: &mut Criterion) {
    c.bench_function("full_gc_10k_garbage", |b| {
        let mut objspace =
            ObjectSpace::new(GcParams::default(), GcConfig::default(), Arc::new(BenchVm))
                .unwrap();
        objspace.prepare_heap().unwrap();
        let cache = objspace.create_cache();

        b.iter(|| {
            for _ in 0..10_000 {
                objspace
                    .new_obj(cache, 0, ObjType::Object as usize, 0, 0, 0, true, 40)
                    .unwrap();
            }
            objspace.start(true, true, true, false);
        });
    });
}

criterion_group!(benches, bench_allocation, bench_full_gc);
criterion_main!(benches);
