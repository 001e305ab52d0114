//! Heap Module - Pages, Bitmaps, Size Classes, Containment
//!
//! The heap is five size classes of 64 KiB-aligned pages. Each page is a
//! mapped body of fixed-size slots plus out-of-line metadata carrying the
//! bitmap planes and the freelist. A sorted page index answers "is this
//! word a heap pointer" for the conservative marker.

pub mod bitmap;
pub mod page;
pub mod page_index;
pub mod size_pool;

pub use bitmap::{AgeMap, Bitmap, BITMAP_BITS, BITMAP_WORDS};
pub use page::{body_for, num_in_page, page_for_unchecked, HeapPage, PageBodyHeader};
pub use page_index::PageIndex;
pub use size_pool::SizedHeap;
