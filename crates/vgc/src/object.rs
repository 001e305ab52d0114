//! Object Model - Slots, Type Tags, and GC Flags
//!
//! Every heap object occupies one fixed-size slot. A slot's first machine
//! word is `flags`: the low bits carry the type tag, the middle bits carry
//! object flags, and the high 32 bits carry the shape id. The second word
//! is the class pointer for live objects, the freelist link for free
//! slots, and the forwarding destination for moved ones.
//!
//! Slot Layout (40 bytes on 64-bit):
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  flags  (type tag | flags | shape id)   │
//! ├─────────────────────────────────────────┤
//! │  v0     (klass / freelist next / dest)  │
//! ├─────────────────────────────────────────┤
//! │  v1  v2  v3   (payload words)           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Two sentinel types exist only inside the collector: `Moved` replaces a
//! compacted-away object and carries its forwarding destination plus the
//! saved shape id; `Zombie` holds a finalizable corpse until the deferred
//! finalizer runner reclaims it.

/// Natural slot footprint: flags word + class word + 3 payload words.
pub const BASE_SLOT_SIZE: usize = 40;

/// Number of slot size classes. Slot sizes are `BASE_SLOT_SIZE << i`.
pub const HEAP_COUNT: usize = 5;

pub const HEAP_PAGE_ALIGN_LOG: usize = 16;

/// Page alignment (64 KiB). An interior pointer's page body is found by
/// masking off the low bits.
pub const HEAP_PAGE_ALIGN: usize = 1 << HEAP_PAGE_ALIGN_LOG;
pub const HEAP_PAGE_ALIGN_MASK: usize = HEAP_PAGE_ALIGN - 1;
pub const HEAP_PAGE_SIZE: usize = HEAP_PAGE_ALIGN;

/// A 2-bit age saturates here; age 3 objects are OLD.
pub const OLD_AGE: u8 = 3;

/// Type tag, stored in the low bits of the flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjType {
    /// Free or never-initialized slot.
    None = 0x00,
    Object = 0x01,
    Array = 0x02,
    String = 0x03,
    Data = 0x04,
    Decimal = 0x05,
    /// Forwarding sentinel left behind by compaction.
    Moved = 0x1e,
    /// Finalizable corpse awaiting the deferred finalizer runner.
    Zombie = 0x1f,
}

impl ObjType {
    /// Decode from raw flag bits.
    pub fn from_bits(bits: usize) -> ObjType {
        match bits & TYPE_MASK {
            0x00 => ObjType::None,
            0x01 => ObjType::Object,
            0x02 => ObjType::Array,
            0x03 => ObjType::String,
            0x04 => ObjType::Data,
            0x05 => ObjType::Decimal,
            0x1e => ObjType::Moved,
            0x1f => ObjType::Zombie,
            other => panic!("unknown type tag {:#x}", other),
        }
    }
}

/// Low 5 bits of the flags word hold the type tag.
pub const TYPE_MASK: usize = 0x1f;

/// Object honors the write barrier.
pub const FL_WB_PROTECTED: usize = 1 << 5;
/// Object has a registered finalizer.
pub const FL_FINALIZE: usize = 1 << 6;
/// Object has been handed out an object id.
pub const FL_SEEN_OBJ_ID: usize = 1 << 7;
/// Object is shareable across ractors.
pub const FL_SHAREABLE: usize = 1 << 8;

/// Shape id lives in the high 32 bits of the flags word.
pub const SHAPE_ID_SHIFT: usize = 32;

/// A reference to a heap slot. Plain address, copyable, nullable.
///
/// `ObjRef::NULL` is the absent reference. `ObjRef::UNDEF` is the
/// tombstone the collector writes into dead weak cells; it is never a
/// valid slot address (slot addresses are at least one page above zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjRef(pub usize);

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(0);
    pub const UNDEF: ObjRef = ObjRef(0x6);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_undef(self) -> bool {
        self == ObjRef::UNDEF
    }

    /// True for values that cannot be heap slots at all.
    #[inline]
    pub fn is_special(self) -> bool {
        self.0 < HEAP_PAGE_SIZE
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Raw slot pointer.
    ///
    /// # Safety
    /// Caller must know this reference points into a live heap page.
    #[inline]
    pub unsafe fn slot(self) -> *mut Slot {
        self.0 as *mut Slot
    }

    /// Read the flags word.
    ///
    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn flags(self) -> usize {
        (*self.slot()).flags
    }

    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn set_flags(self, flags: usize) {
        (*self.slot()).flags = flags;
    }

    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn obj_type(self) -> ObjType {
        ObjType::from_bits(self.flags())
    }

    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn is_free_cell(self) -> bool {
        self.flags() == 0
    }

    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn has_flag(self, fl: usize) -> bool {
        self.flags() & fl != 0
    }

    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn add_flag(self, fl: usize) {
        (*self.slot()).flags |= fl;
    }

    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn clear_flag(self, fl: usize) {
        (*self.slot()).flags &= !fl;
    }

    /// Write-barrier-protected objects honor the generational invariant.
    ///
    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn is_wb_protected(self) -> bool {
        self.has_flag(FL_WB_PROTECTED)
    }

    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn shape_id(self) -> u32 {
        (self.flags() >> SHAPE_ID_SHIFT) as u32
    }

    /// # Safety
    /// Must point to a heap slot.
    #[inline]
    pub unsafe fn set_shape_id(self, shape: u32) {
        let slot = self.slot();
        (*slot).flags = ((*slot).flags & !((u32::MAX as usize) << SHAPE_ID_SHIFT))
            | ((shape as usize) << SHAPE_ID_SHIFT);
    }
}

/// One heap cell. `#[repr(C)]` so the flags word is always first.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Slot {
    pub flags: usize,
    pub v0: usize,
    pub v1: usize,
    pub v2: usize,
    pub v3: usize,
}

impl Slot {
    /// Freelist link of a free cell (second word).
    ///
    /// # Safety
    /// `addr` must be a free cell in a live page.
    #[inline]
    pub unsafe fn free_next(addr: usize) -> usize {
        (*(addr as *const Slot)).v0
    }

    /// Thread a free cell onto a freelist.
    ///
    /// # Safety
    /// `addr` must be an unused cell in a live page.
    #[inline]
    pub unsafe fn make_free(addr: usize, next: usize) {
        let slot = addr as *mut Slot;
        (*slot).flags = 0;
        (*slot).v0 = next;
    }
}

/// Destructor callback carried by `Data` objects and zombies.
pub type DFreeFn = unsafe fn(usize);

/// Accessors for the `Moved` forwarding sentinel.
pub mod moved {
    use super::{ObjRef, ObjType, Slot, SHAPE_ID_SHIFT};

    /// Overwrite a vacated source slot with a forwarding cell.
    ///
    /// # Safety
    /// `src` must be a live slot being vacated by compaction.
    pub unsafe fn install(src: ObjRef, destination: ObjRef, original_shape_id: u32) {
        let slot = src.slot();
        (*slot).flags = ObjType::Moved as usize | ((original_shape_id as usize) << SHAPE_ID_SHIFT);
        (*slot).v0 = destination.as_usize();
        (*slot).v1 = 0;
        (*slot).v2 = 0;
        (*slot).v3 = 0;
    }

    /// # Safety
    /// `obj` must be a `Moved` cell.
    #[inline]
    pub unsafe fn destination(obj: ObjRef) -> ObjRef {
        debug_assert_eq!(obj.obj_type(), ObjType::Moved);
        ObjRef((*(obj.as_usize() as *const Slot)).v0)
    }

    /// # Safety
    /// `obj` must be a `Moved` cell.
    #[inline]
    pub unsafe fn original_shape_id(obj: ObjRef) -> u32 {
        obj.shape_id()
    }
}

/// Accessors for the `Zombie` sentinel.
pub mod zombie {
    use super::{DFreeFn, ObjRef, ObjType, Slot, FL_FINALIZE, TYPE_MASK};

    /// Turn a dead finalizable object into a zombie.
    ///
    /// The `FL_FINALIZE` flag is preserved; everything else in the flags
    /// word is dropped.
    ///
    /// # Safety
    /// `obj` must be a dead slot on a live page.
    pub unsafe fn install(obj: ObjRef, dfree: Option<DFreeFn>, data: usize) {
        let keep_finalize = obj.flags() & FL_FINALIZE;
        let slot = obj.slot();
        (*slot).flags = ObjType::Zombie as usize | keep_finalize;
        (*slot).v0 = 0; // next_zombie, linked by the deferred list
        (*slot).v1 = dfree.map_or(0, |f| f as usize);
        (*slot).v2 = data;
        (*slot).v3 = 0;
    }

    /// # Safety
    /// `obj` must be a `Zombie` cell.
    #[inline]
    pub unsafe fn next_zombie(obj: ObjRef) -> usize {
        debug_assert_eq!(obj.flags() & TYPE_MASK, ObjType::Zombie as usize);
        (*(obj.as_usize() as *const Slot)).v0
    }

    /// # Safety
    /// `obj` must be a `Zombie` cell.
    #[inline]
    pub unsafe fn set_next_zombie(obj: ObjRef, next: usize) {
        (*(obj.as_usize() as *mut Slot)).v0 = next;
    }

    /// # Safety
    /// `obj` must be a `Zombie` cell.
    #[inline]
    pub unsafe fn dfree(obj: ObjRef) -> Option<DFreeFn> {
        let raw = (*(obj.as_usize() as *const Slot)).v1;
        if raw == 0 {
            None
        } else {
            Some(std::mem::transmute::<usize, DFreeFn>(raw))
        }
    }

    /// # Safety
    /// `obj` must be a `Zombie` cell.
    #[inline]
    pub unsafe fn data(obj: ObjRef) -> usize {
        (*(obj.as_usize() as *const Slot)).v2
    }
}

/// Slot size of heap index `i`.
#[inline]
pub const fn slot_size_for_heap(heap_index: usize) -> usize {
    BASE_SLOT_SIZE << heap_index
}

/// Largest allocatable payload.
pub const MAX_SLOT_SIZE: usize = BASE_SLOT_SIZE << (HEAP_COUNT - 1);

/// Whether a payload of `size` bytes fits any size class.
#[inline]
pub fn size_allocatable_p(size: usize) -> bool {
    size <= MAX_SLOT_SIZE
}

/// Smallest heap index whose slots fit `size` bytes.
///
/// Callers must check `size_allocatable_p` first; oversized requests are
/// a caller bug.
#[inline]
pub fn heap_index_for_size(size: usize) -> usize {
    debug_assert!(size_allocatable_p(size));
    let slots = size.div_ceil(BASE_SLOT_SIZE).max(1);
    (usize::BITS - (slots - 1).leading_zeros()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_base_slot_size() {
        assert_eq!(std::mem::size_of::<Slot>(), BASE_SLOT_SIZE);
    }

    #[test]
    fn test_heap_index_for_size() {
        assert_eq!(heap_index_for_size(1), 0);
        assert_eq!(heap_index_for_size(40), 0);
        assert_eq!(heap_index_for_size(41), 1);
        assert_eq!(heap_index_for_size(80), 1);
        assert_eq!(heap_index_for_size(81), 2);
        assert_eq!(heap_index_for_size(160), 2);
        assert_eq!(heap_index_for_size(320), 3);
        assert_eq!(heap_index_for_size(640), 4);
    }

    #[test]
    fn test_size_allocatable() {
        assert!(size_allocatable_p(640));
        assert!(!size_allocatable_p(641));
    }

    #[test]
    fn test_type_roundtrip() {
        for t in [
            ObjType::None,
            ObjType::Object,
            ObjType::Array,
            ObjType::String,
            ObjType::Data,
            ObjType::Decimal,
            ObjType::Moved,
            ObjType::Zombie,
        ] {
            assert_eq!(ObjType::from_bits(t as usize), t);
        }
    }

    #[test]
    fn test_undef_is_special() {
        assert!(ObjRef::UNDEF.is_special());
        assert!(ObjRef::NULL.is_null());
        assert!(!ObjRef(HEAP_PAGE_SIZE + 40).is_special());
    }
}
