//! # VGC - The Veld Object Memory Manager
//!
//! VGC is the generational, incremental, compacting mark-sweep collector
//! at the heart of the Veld runtime, paired with a per-execution-context
//! allocation fast path.
//!
//! ## Overview
//!
//! - **Size-classed pages**: five slot sizes (40 bytes doubling to 640),
//!   held on 64 KiB-aligned pages with out-of-line bitmaps.
//! - **Generational marking**: 2-bit ages saturating at OLD; minor
//!   cycles trace only the remember set, major cycles retrace the world.
//! - **Incremental marking**: budgeted mark steps interleaved with
//!   allocation, tri-color invariant kept by the write barrier.
//! - **Lazy sweeping**: per-page reclamation with slot budgets; empty
//!   pages drain into a pool any size class can recycle.
//! - **Compaction**: two cursors per heap, forwarding cells, a
//!   read-barrier invalidation path, and a full reference-update pass.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vgc::{GcConfig, GcParams, ObjectSpace, ObjType};
//!
//! # struct MyVm;
//! # impl vgc::VmHooks for MyVm {
//! #     fn mark_roots(&self, _: &mut ObjectSpace) {}
//! #     fn mark_children(&self, _: &mut ObjectSpace, _: vgc::ObjRef) {}
//! #     fn update_references(&self, _: &mut ObjectSpace, _: vgc::ObjRef) {}
//! #     fn obj_free(&self, _: vgc::ObjRef) -> bool { true }
//! # }
//! let mut objspace = ObjectSpace::new(
//!     GcParams::from_env(),
//!     GcConfig::default(),
//!     Arc::new(MyVm),
//! )?;
//! objspace.prepare_heap()?;
//!
//! let cache = objspace.create_cache();
//! let obj = objspace.new_obj(
//!     cache,
//!     0,                        // class word
//!     ObjType::Object as usize, // type tag
//!     0, 0, 0,                  // initial payload words
//!     true,                     // wb-protected
//!     40,                       // payload size
//! )?;
//!
//! objspace.start(true, true, true, false); // full, immediate GC
//! # Ok::<(), vgc::GcError>(())
//! ```
//!
//! ## Modules
//!
//! - [`object`]: slot layout, type tags, flag bits
//! - [`heap`]: pages, bitmaps, size classes, the page index
//! - [`cache`]: the per-ractor allocation fast path
//! - [`space`]: the object space and the cycle driver
//! - [`vm`]: the host callback interface
//! - [`config`]: boot parameters and runtime switches
//! - [`stats`]: counters and cycle introspection
//! - [`logging`]: structured GC events

pub mod accounting;
pub mod barrier;
pub mod cache;
pub mod compact;
pub mod config;
pub mod error;
pub mod finalize;
pub mod heap;
pub mod id_table;
pub mod logging;
pub mod mark_stack;
pub mod marking;
pub mod object;
pub mod space;
pub mod stats;
pub mod sweep;
pub mod vm;
pub mod weak;

pub use cache::{CacheId, HeapCache};
pub use config::{GcConfig, GcParams};
pub use error::{GcError, Result};
pub use logging::{GcEvent, GcTrigger};
pub use object::{
    heap_index_for_size, size_allocatable_p, ObjRef, ObjType, BASE_SLOT_SIZE, FL_FINALIZE,
    FL_SEEN_OBJ_ID, FL_SHAREABLE, FL_WB_PROTECTED, HEAP_COUNT, HEAP_PAGE_ALIGN, HEAP_PAGE_SIZE,
    OLD_AGE,
};
pub use space::{major_reason, LatestGcInfo, Mode, ObjectSpace};
pub use vm::{FinalizerCallable, VmHooks};

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
