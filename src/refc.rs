//! Reference cells and ownership
//!
//! Every independent instance and array part starts with a reference cell:
//! null when free, its own address when pinned, `REF_MARK` when kept alive
//! only by weak referencers, and otherwise the address of the dependent
//! field owning it. Liveness of a dependent chain is the liveness of the
//! final independent cell it climbs to.
//!
//! Weak references live outside page memory, in the runtime's multi-map from
//! target cell to referencing fields; pruning a target asks each registered
//! field whether its holder is still alive, with a visited list guarding
//! against reference cycles.

use crate::obj::Obj;
use crate::runtime::Runtime;
use crate::types::{FieldFlags, FieldSlot, PageFlags, TypeHandle};

impl Runtime {
    /// Reference cell of the instance or array part containing `addr`.
    pub(crate) fn find_raw_refc(&self, addr: Obj) -> Obj {
        let id = self.descriptor_id(addr);
        let d = self.page(id);
        if self
            .type_flags(TypeHandle(d.ty))
            .contains(crate::types::TypeFlags::ARRAY)
        {
            self.find_part(id, addr)
        } else {
            let stride = self.paged_size(TypeHandle(d.ty));
            let off = (addr.0 - d.base) as usize;
            Obj(d.base + (off - off % stride) as u64)
        }
    }

    /// Climb the dependency chain to the final independent cell. Array pages
    /// climb regardless of page flags: a continuation part's cell points at
    /// the previous part's `next` field even when the array is independent.
    pub(crate) fn get_final_obj(&self, addr: Obj) -> Obj {
        let mut cell = self.find_raw_refc(addr);
        loop {
            let d = self.page(self.descriptor_id(cell));
            if !d.flags.contains(PageFlags::DEPENDENT)
                && !self
                    .type_flags(TypeHandle(d.ty))
                    .contains(crate::types::TypeFlags::ARRAY)
            {
                return cell;
            }
            let v = self.read_word(cell);
            if v.is_null() || v == cell || v == Obj::REF_MARK {
                return cell;
            }
            // v is the owning field; its holder's cell is the next rung.
            cell = self.find_raw_refc(v);
        }
    }

    /// Final cell of `addr`, with stale weak referencers pruned first.
    pub(crate) fn find_refc(&mut self, addr: Obj, visiting: &mut Vec<u64>) -> Obj {
        let cell = self.get_final_obj(addr);
        if self.read_word(cell) == Obj::REF_MARK {
            self.check_references(cell, visiting);
        }
        cell
    }

    /// Re-examine every field registered against `cell`, dropping edges whose
    /// holders are dead. A cell left with no live referencer is cleared.
    fn check_references(&mut self, cell: Obj, visiting: &mut Vec<u64>) {
        if visiting.contains(&cell.0) {
            return;
        }
        visiting.push(cell.0);
        if let Some(fields) = self.referencers.remove(&cell.0) {
            let mut live = Vec::new();
            for f in fields {
                let holder = self.find_refc(Obj(f), visiting);
                if self.read_word(holder).is_null() {
                    self.write_word(Obj(f), Obj::NULL);
                } else {
                    live.push(f);
                }
            }
            if live.is_empty() {
                if self.read_word(cell) == Obj::REF_MARK {
                    self.write_word(cell, Obj::NULL);
                }
            } else {
                self.referencers.insert(cell.0, live);
            }
        } else if self.read_word(cell) == Obj::REF_MARK {
            // A marked cell with no registered referencers is stale.
            self.write_word(cell, Obj::NULL);
        }
        visiting.pop();
    }

    /// Whether the object containing `addr` is reachable (pinned, owned, or
    /// weakly referenced by a live holder).
    pub fn is_referenced(&mut self, addr: Obj) -> bool {
        let mut visiting = Vec::new();
        let cell = self.find_refc(addr, &mut visiting);
        !self.read_word(cell).is_null()
    }

    /// Pin the object containing `addr`. Returns true when this call did the
    /// pinning (the object was unreferenced before).
    pub fn protect(&mut self, addr: Obj) -> bool {
        let mut visiting = Vec::new();
        let cell = self.find_refc(addr, &mut visiting);
        if self.read_word(cell).is_null() {
            self.write_word(cell, cell);
            true
        } else {
            false
        }
    }

    pub fn is_protected(&mut self, addr: Obj) -> bool {
        let mut visiting = Vec::new();
        let cell = self.find_refc(addr, &mut visiting);
        self.read_word(cell) == cell
    }

    /// Unpin the object containing `addr`. Live weak referencers demote the
    /// cell to the marked state instead of clearing it.
    pub fn unprotect(&mut self, addr: Obj) {
        let mut visiting = Vec::new();
        let cell = self.find_refc(addr, &mut visiting);
        if self.read_word(cell) == cell {
            let marked = self
                .referencers
                .get(&cell.0)
                .is_some_and(|v| !v.is_empty());
            let v = if marked { Obj::REF_MARK } else { Obj::NULL };
            self.write_word(cell, v);
        }
    }

    // ---- dependent ownership ---------------------------------------------

    /// Unlink the child held by `field`, returning it (null when empty).
    pub(crate) fn detach_field(&mut self, field: Obj) -> Obj {
        let child = self.read_word(field);
        if !child.is_null() {
            let cell = self.find_raw_refc(child);
            if self.read_word(cell) != field {
                panic!("misbound instance: detached child does not point back at the field");
            }
            // Live weak referencers keep the released child observable.
            let marked = self
                .referencers
                .get(&cell.0)
                .is_some_and(|v| !v.is_empty());
            let v = if marked { Obj::REF_MARK } else { Obj::NULL };
            self.write_word(cell, v);
            self.write_word(field, Obj::NULL);
        }
        child
    }

    /// Bind `child` to `field`, releasing whatever the field held before and
    /// transferring ownership away from any previous owner of `child`.
    /// Returns the field's previous child.
    pub(crate) fn attach_field(&mut self, field: Obj, child: Obj) -> Obj {
        let prev = self.detach_field(field);
        let cell = self.find_raw_refc(child);
        let v = self.read_word(cell);
        if !v.is_null() && v != cell && v != Obj::REF_MARK {
            // Owned elsewhere: transfer, verifying the old binding first.
            if self.read_word(v) != cell {
                panic!("misbound instance: owner field does not point back at the child");
            }
            self.write_word(v, Obj::NULL);
        }
        self.write_word(cell, field);
        self.write_word(field, cell);
        prev
    }

    /// Bind `child` to a declared dependent field. Returns the field's
    /// previous child; `None` when the field is not dependent.
    pub fn attach_dependent(&mut self, field: Obj, child: Obj) -> Option<Obj> {
        if self.get_flags(field).contains(FieldFlags::DEPENDENT) {
            Some(self.attach_field(field, child))
        } else {
            None
        }
    }

    /// Unlink a declared dependent field's child and return it.
    pub fn detach_dependent(&mut self, field: Obj) -> Option<Obj> {
        if self.get_flags(field).contains(FieldFlags::DEPENDENT) {
            Some(self.detach_field(field))
        } else {
            None
        }
    }

    // ---- weak references -------------------------------------------------

    /// Point a `REFERENCES` field at `obj`, registering the edge so the
    /// target stays observable until its last live referencer goes away.
    pub fn set_reference(&mut self, field: Obj, obj: Obj) {
        if !self.get_flags(field).contains(FieldFlags::REFERENCES) {
            panic!("misbound instance: set_reference through a non-reference field");
        }
        self.clear_reference(field);
        if obj.is_null() {
            return;
        }
        let target = self.get_final_obj(obj);
        self.referencers.entry(target.0).or_default().push(field.0);
        if self.read_word(target).is_null() {
            self.write_word(target, Obj::REF_MARK);
        }
        self.write_word(field, obj);
    }

    /// Null a `REFERENCES` field, unregistering its edge. Clearing a field
    /// that is not registered is a no-op on the map.
    pub fn clear_reference(&mut self, field: Obj) {
        let v = self.read_word(field);
        if !v.is_null() && self.get_flags(field).contains(FieldFlags::REFERENCES) {
            let target = self.get_final_obj(v);
            if let Some(fields) = self.referencers.get_mut(&target.0) {
                fields.retain(|&f| f != field.0);
                if fields.is_empty() {
                    self.referencers.remove(&target.0);
                    if self.read_word(target) == Obj::REF_MARK {
                        self.write_word(target, Obj::NULL);
                    }
                }
            }
        }
        self.write_word(field, Obj::NULL);
    }

    // ---- slot reuse ------------------------------------------------------

    /// Release every declared field of a dead instance and zero its data.
    /// `c_object` is the data-zone start.
    pub(crate) fn reset_fields(&mut self, c_object: Obj, ty: TypeHandle) {
        let size = self.object_size(ty);
        for i in 0..size {
            if let FieldSlot::Start { flags, .. } = self.fib_get(ty, i) {
                let field = c_object.add(i);
                if flags.contains(FieldFlags::DEPENDENT) {
                    self.detach_field(field);
                } else if flags.contains(FieldFlags::REFERENCES) {
                    self.clear_reference(field);
                } else if flags.contains(FieldFlags::NEEDS_FREE) {
                    let key = self.read_size(field);
                    if key != 0 {
                        self.externals.remove(&key);
                    }
                }
            }
        }
        self.zero(c_object, size);
    }
}
