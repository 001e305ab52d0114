//! Object IDs - Monotonic, Strided, Never Reissued
//!
//! IDs advance by `OBJ_ID_INCREMENT` so they can never collide with the
//! VM's tagged immediates. The forward map `obj -> id` is maintained
//! eagerly on first request; the reverse map is built lazily by one
//! linear pass the first time someone asks for `object_id_to_ref`.

use rustc_hash::FxHashMap;

use crate::error::{GcError, Result};
use crate::object::{ObjRef, FL_SEEN_OBJ_ID};
use crate::space::ObjectSpace;

/// Stride between ids: one more than the immediate tag mask.
pub const OBJ_ID_INCREMENT: u64 = 8;
pub const OBJ_ID_INITIAL: u64 = OBJ_ID_INCREMENT;

impl ObjectSpace {
    /// The object's id, assigned on first request.
    pub fn object_id(&mut self, obj: ObjRef) -> u64 {
        if unsafe { obj.has_flag(FL_SEEN_OBJ_ID) } {
            return *self
                .obj_to_id
                .get(&obj.as_usize())
                .unwrap_or_else(|| crate::vgc_bug!("seen-id object missing from id table"));
        }

        let id = self.next_object_id;
        self.next_object_id += OBJ_ID_INCREMENT;
        self.obj_to_id.insert(obj.as_usize(), id);
        if let Some(id_to_obj) = self.id_to_obj.as_mut() {
            id_to_obj.insert(id, obj.as_usize());
        }
        unsafe {
            obj.add_flag(FL_SEEN_OBJ_ID);
        }
        id
    }

    /// Resolve an id back to its object. An id that was never issued, or
    /// whose object has been collected, is a range error.
    pub fn object_id_to_ref(&mut self, id: u64) -> Result<ObjRef> {
        if id == 0 || id % OBJ_ID_INCREMENT != 0 {
            return Err(GcError::RangeError(format!("{:#x} is not an id value", id)));
        }

        if self.id_to_obj.is_none() {
            let mut reverse: FxHashMap<u64, usize> = FxHashMap::default();
            for (&addr, &known_id) in &self.obj_to_id {
                reverse.insert(known_id, addr);
            }
            self.id_to_obj = Some(reverse);
        }

        match self.id_to_obj.as_ref().unwrap().get(&id) {
            Some(&addr) => Ok(ObjRef(addr)),
            None => Err(GcError::RangeError(format!(
                "{:#x} is a recycled object id",
                id
            ))),
        }
    }

    /// Forget a dying object's id. The id is never reissued.
    pub(crate) fn obj_free_object_id(&mut self, obj: ObjRef) {
        if let Some(id) = self.obj_to_id.remove(&obj.as_usize()) {
            if let Some(id_to_obj) = self.id_to_obj.as_mut() {
                id_to_obj.remove(&id);
            }
        }
        unsafe {
            obj.clear_flag(FL_SEEN_OBJ_ID);
        }
    }

    /// Re-key an id when its object moves during compaction.
    pub(crate) fn move_object_id(&mut self, src: ObjRef, dest: ObjRef) {
        let Some(id) = self.obj_to_id.remove(&src.as_usize()) else {
            crate::vgc_bug!("object id seen but missing from the mapping table");
        };
        self.obj_to_id.insert(dest.as_usize(), id);
        if let Some(id_to_obj) = self.id_to_obj.as_mut() {
            id_to_obj.insert(id, dest.as_usize());
        }
    }
}
