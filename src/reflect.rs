//! Reflection
//!
//! Every byte of every instance can be asked what it is: the page says which
//! type governs it, the instance stride says where the object starts, and
//! the layout tables say which field (and which nested object) the byte
//! belongs to. On top of that sit named field access, object construction
//! and type construction.

use crate::error::AllocResult;
use crate::obj::{Obj, WORD};
use crate::runtime::Runtime;
use crate::types::{
    FieldFlags, FieldSlot, PageFlags, TypeFlags, TypeHandle, T_DFIA, T_DFIB, T_DYNAMIC_FIELDS,
    T_STATIC_FIELDS, T_VARIANTS,
};

/// Where an address sits inside its page: the governing type, the start of
/// the instance (or array element, or part header) containing it, the byte
/// offset inside that instance and the instance's offset-zone size.
#[derive(Clone, Copy, Debug)]
pub struct ObjInfo {
    pub page_type: TypeHandle,
    pub start: Obj,
    pub offset: usize,
    pub zone: usize,
}

impl Runtime {
    /// Locate `addr` inside its page.
    pub fn get_info(&self, addr: Obj) -> ObjInfo {
        let id = self.descriptor_id(addr);
        let d = self.page(id);
        let ty = TypeHandle(d.ty);
        if self.type_flags(ty).contains(TypeFlags::ARRAY) {
            let p = self.find_part(id, addr);
            let rel = addr.offset_from(p);
            if rel < crate::page::PART_HEADER {
                // Inside the part header, which reads as an instance of the
                // array type itself.
                return ObjInfo {
                    page_type: ty,
                    start: p,
                    offset: rel,
                    zone: self.offset_zone(ty),
                };
            }
            let content = TypeHandle(self.part_content(p));
            let stride = self.elem_size(content);
            let off = (rel - crate::page::PART_HEADER) % stride;
            ObjInfo {
                page_type: content,
                start: Obj(addr.0 - off as u64),
                offset: off,
                zone: self.offsets(content),
            }
        } else {
            let stride = self.paged_size(ty);
            let off = ((addr.0 - d.base) as usize) % stride;
            ObjInfo {
                page_type: ty,
                start: Obj(addr.0 - off as u64),
                offset: off,
                zone: self.offset_zone(ty),
            }
        }
    }

    /// Type of the field or nested object that `addr` belongs to.
    pub fn type_of(&self, addr: Obj) -> TypeHandle {
        let info = self.get_info(addr);
        if info.offset == 0 {
            return info.page_type;
        }
        if info.offset < info.zone {
            // Offset zone: table A, scanning down to the nearest claimed
            // nested slot. Slot 0 is the object itself.
            let top = self.offsets(info.page_type).saturating_sub(1);
            let mut i = info.offset.min(top);
            while i > 0 {
                if let Some((ty, _)) = self.fia_get(info.page_type, i) {
                    return TypeHandle(ty);
                }
                i -= 1;
            }
            info.page_type
        } else {
            // Data zone: table B, scanning back to the field start. Bytes
            // with no declared field fall back to the page's type.
            let mut i = info.offset - info.zone;
            loop {
                if let FieldSlot::Start { ty, .. } = self.fib_get(info.page_type, i) {
                    if !ty.is_null() {
                        return TypeHandle(ty);
                    }
                    return info.page_type;
                }
                if i == 0 {
                    return info.page_type;
                }
                i -= 1;
            }
        }
    }

    /// Start of the instance (or element, or part header) containing `addr`.
    pub fn get_obj(&self, addr: Obj) -> Obj {
        self.get_info(addr).start
    }

    /// Data-zone start for an object handle: nested-slot handles (addresses
    /// inside the offset zone) shift to the zone end, data addresses pass
    /// through unchanged.
    pub fn get_c_object(&self, addr: Obj) -> Obj {
        let info = self.get_info(addr);
        if info.offset < info.zone {
            info.start.add(info.zone)
        } else {
            addr
        }
    }

    /// Declared flags of the field at `addr`. Offset-zone bytes read as
    /// nested auto-instantiated slots.
    pub fn get_flags(&self, addr: Obj) -> FieldFlags {
        let info = self.get_info(addr);
        if info.offset < info.zone {
            return FieldFlags::NESTED | FieldFlags::AUTO_INST;
        }
        match self.fib_get(info.page_type, info.offset - info.zone) {
            FieldSlot::Start { flags, .. } => flags,
            FieldSlot::Continuation => FieldFlags::CONTINUATION,
        }
    }

    /// Address of field `field_off` of the object containing `obj`.
    /// `field_off` is a table-B data offset when `is_fib`, a table-A slot
    /// index otherwise. Pointer fields holding a value dereference.
    fn advance_obj_ptr(&self, obj: Obj, info: ObjInfo, field_off: usize, is_fib: bool) -> Obj {
        let mut fo = field_off;
        let mut deref = false;
        if is_fib {
            if let FieldSlot::Start { flags, .. } = self.fib_get(info.page_type, fo) {
                deref = flags.contains(FieldFlags::POINTER);
            }
            fo += info.zone;
            // A nested-slot handle addresses its field relative to the
            // nested object's own data offset.
            if info.offset > 0 && info.offset < self.offsets(info.page_type) {
                if let Some((_, data_off)) = self.fia_get(info.page_type, info.offset) {
                    fo += data_off;
                }
            }
        } else {
            fo += info.offset;
        }
        let addr = self.get_obj(obj).add(fo);
        if deref {
            let v = self.read_word(addr);
            if !v.is_null() {
                return v;
            }
        }
        addr
    }

    /// Look up a named dynamic field of the object containing `obj`.
    /// Pointer fields (dependents included) resolve to the pointed-at child
    /// when set, to the field word itself when empty.
    pub fn get_field(&self, obj: Obj, name: &[u8]) -> Option<Obj> {
        let ty = self.type_of(obj);
        let entry = self.dict_get(self.dynamic_fields(ty), name)?;
        let entry_ty = self.type_of(entry);
        let is_fib = self
            .type_flags(entry_ty)
            .contains(TypeFlags::FIELD_TABLE);
        let table = if is_fib { self.dfib(ty) } else { self.dfia(ty) };
        let idx = self.array_find(table, entry);
        Some(self.advance_obj_ptr(obj, self.get_info(obj), idx, is_fib))
    }

    /// Named static value of a type.
    pub fn get_static_field(&self, ty: TypeHandle, name: &[u8]) -> Option<Obj> {
        self.dict_get(self.static_fields(ty), name)
    }

    /// Bind a named static value on a type.
    pub fn set_static_field(&mut self, ty: TypeHandle, name: &[u8], value: Obj) -> AllocResult<()> {
        self.dict_set(self.static_fields(ty), name, value)
    }

    // ---- object construction ---------------------------------------------

    /// Initialize a freshly spotted instance: zero its scalars and walk its
    /// declared fields, instantiating the auto-instantiated ones. The object
    /// is pinned for the duration so nested allocation cannot reuse its
    /// still-unreferenced slot.
    pub fn prepare(&mut self, obj: Obj, ty: TypeHandle) -> AllocResult<Obj> {
        let unpin = self.protect(obj);
        let result = self.prepare_inner(obj, ty);
        if unpin {
            self.unprotect(obj);
        }
        result?;
        Ok(obj)
    }

    fn prepare_inner(&mut self, obj: Obj, ty: TypeHandle) -> AllocResult<()> {
        if self.type_flags(ty).contains(TypeFlags::PRIMITIVE) {
            let data = self.get_c_object(obj);
            self.zero(data, self.object_size(ty));
            return Ok(());
        }
        for name in self.dict_keys(self.dynamic_fields(ty)) {
            let Some(field) = self.get_field(obj, &name) else {
                continue;
            };
            let fty = self.type_of(field);
            let flags = self.get_flags(field);
            if flags.contains(FieldFlags::AUTO_INST) {
                if flags.contains(FieldFlags::DEPENDENT) {
                    let child = self.spot_dependent(field, fty)?;
                    self.prepare(child, fty)?;
                } else if flags.contains(FieldFlags::POINTER) {
                    self.zero(field, WORD);
                } else {
                    self.prepare(field, fty)?;
                }
            } else {
                let len = if flags.contains(FieldFlags::POINTER) {
                    WORD
                } else {
                    self.object_size(fty)
                };
                self.zero(field, len);
            }
        }
        Ok(())
    }

    // ---- type construction -----------------------------------------------

    /// Create a new type: `object_size` data bytes, `nested_objects` nested
    /// slots beyond the self slot, and `referencers` weak-reference credits
    /// for `REFERENCES` fields declared later. The returned type is pinned;
    /// unprotect it to let collection reclaim it.
    pub fn create_type(
        &mut self,
        nested_objects: usize,
        referencers: usize,
        object_size: usize,
        flags: TypeFlags,
    ) -> AllocResult<TypeHandle> {
        let rt = self.boot.root_type;
        let fiat = self.boot.field_info_a_type;
        let fibt = self.boot.field_info_b_type;
        let dht = self.boot.dict_header_type;
        let offsets = 1 + nested_objects;
        let cell = self.spot(rt)?;
        self.protect(cell);
        let t = TypeHandle(cell);
        self.write_size(self.type_field(t, crate::types::T_OBJECT_SIZE), object_size as u64);
        self.write_size(self.type_field(t, crate::types::T_OFFSETS), offsets as u64);
        self.write_size(
            self.type_field(t, crate::types::T_PAGED_SIZE),
            (object_size + offsets.max(WORD)) as u64,
        );
        self.set_referencers_left(t, referencers);
        self.set_type_flags(t, flags);
        self.spot_dependent(self.type_field(t, T_DYNAMIC_FIELDS), dht)?;
        self.spot_dependent(self.type_field(t, T_STATIC_FIELDS), dht)?;
        self.spot_array_dependent(self.type_field(t, T_DFIA), fiat, offsets)?;
        self.spot_array_dependent(self.type_field(t, T_DFIB), fibt, object_size)?;
        for i in 0..object_size {
            self.fib_set(t, i, FieldSlot::Continuation);
        }
        Ok(t)
    }

    /// Claim the first free table-A slot for a nested object.
    fn fill_fia_slot(&mut self, host: TypeHandle, ty: Obj, data_offset: usize) -> Obj {
        let top = self.offsets(host);
        for i in 1..top {
            if self.fia_get(host, i).is_none() {
                self.fia_set(host, i, ty, data_offset);
                return self.fia_element(host, i);
            }
        }
        panic!("type declared with too few nested-object slots");
    }

    fn consume_referencer(&mut self, host: TypeHandle) {
        let left = self.referencers_left(host);
        if left == 0 {
            panic!("type declared with too few referencer slots");
        }
        self.set_referencers_left(host, left - 1);
    }

    /// Declare a named dynamic field of `host` at `offset`. Non-primitive,
    /// non-pointer field types are flattened in place: their table-B range
    /// is copied and each of their nested slots claims a table-A slot of the
    /// host. Returns the field's byte size.
    pub fn set_dynamic_field(
        &mut self,
        host: TypeHandle,
        field_type: TypeHandle,
        name: &[u8],
        offset: usize,
        flags: FieldFlags,
    ) -> AllocResult<usize> {
        let nested = !self.type_flags(field_type).contains(TypeFlags::PRIMITIVE)
            && !flags.contains(FieldFlags::POINTER);
        let field_size;
        let entry;
        if nested {
            field_size = self.object_size(field_type);
            assert!(
                offset + field_size <= self.object_size(host),
                "field extends past the end of the type"
            );
            entry = self.fill_fia_slot(host, field_type.0, offset);
            for i in 1..self.offsets(field_type) {
                if let Some((sub_ty, sub_off)) = self.fia_get(field_type, i) {
                    self.fill_fia_slot(host, sub_ty, offset + sub_off);
                }
            }
            for i in 0..field_size {
                let slot = self.fib_get(field_type, i);
                if let FieldSlot::Start { flags: sf, .. } = slot {
                    if sf.contains(FieldFlags::REFERENCES) {
                        self.consume_referencer(host);
                    }
                }
                self.fib_set(host, offset + i, slot);
            }
        } else {
            field_size = if flags.contains(FieldFlags::POINTER) {
                WORD
            } else {
                self.object_size(field_type)
            };
            assert!(
                offset + field_size <= self.object_size(host),
                "field extends past the end of the type"
            );
            self.fib_set(
                host,
                offset,
                FieldSlot::Start {
                    ty: field_type.0,
                    flags,
                },
            );
            for i in 1..field_size {
                self.fib_set(host, offset + i, FieldSlot::Continuation);
            }
            if flags.contains(FieldFlags::REFERENCES) {
                self.consume_referencer(host);
            }
            entry = self.fib_element(host, offset);
        }
        self.dict_set(self.dynamic_fields(host), name, entry)?;
        Ok(field_size)
    }

    // ---- type variants ---------------------------------------------------

    /// Data word of slot `i` of a variant array.
    fn variant_slot(&self, var: Obj, i: usize) -> Obj {
        let content = TypeHandle(self.part_content(var));
        self.part_elems(var)
            .add(i * self.elem_size(content))
            .add(self.offsets(content))
    }

    /// Declare a variant of `base`: the base type narrowed by `(data offset,
    /// word value)` constraints an instance must satisfy to conform. The
    /// variant is a word array owned by the base type (it dies with it);
    /// slot 0 holds the base, slot 1 links further variants, and each
    /// constraint takes the next two slots.
    pub fn create_type_variant(
        &mut self,
        base: TypeHandle,
        constraints: &[(usize, u64)],
    ) -> AllocResult<Obj> {
        let szt = self.boot.size_type;
        let mut field = self.type_field(base, T_VARIANTS);
        loop {
            let cur = self.read_word(field);
            if cur.is_null() {
                break;
            }
            field = self.variant_slot(cur, 1);
        }
        let var = self.spot_array_internal(szt, 2 * (constraints.len() + 1), PageFlags::DEPENDENT)?;
        self.attach_field(field, var);
        self.write_word(self.variant_slot(var, 0), base.0);
        for (i, &(off, value)) in constraints.iter().enumerate() {
            self.write_size(self.variant_slot(var, 2 * i + 2), off as u64);
            self.write_size(self.variant_slot(var, 2 * i + 3), value);
        }
        Ok(var)
    }

    /// Whether the object containing `obj` fails to conform to `vartype`,
    /// which is either a type cell or a variant array. A plain type matches
    /// every instance of it; a variant additionally compares each
    /// constrained field word against the constraint value.
    pub fn type_mismatch(&self, vartype: Obj, obj: Obj) -> bool {
        let page_ty = TypeHandle(self.page(self.descriptor_id(vartype)).ty);
        let variant = self.type_flags(page_ty).contains(TypeFlags::ARRAY);
        let base = if variant {
            TypeHandle(self.read_word(self.variant_slot(vartype, 0)))
        } else {
            TypeHandle(vartype)
        };
        let info = self.get_info(obj);
        if info.page_type != base {
            return true;
        }
        if variant {
            let n = self.part_count(vartype);
            let mut j = 2;
            while j + 1 < n {
                let off = self.read_size(self.variant_slot(vartype, j)) as usize;
                let want = self.read_size(self.variant_slot(vartype, j + 1));
                let loc = self.advance_obj_ptr(obj, info, off, true);
                if self.read_size(loc) != want {
                    return true;
                }
                j += 2;
            }
        }
        false
    }
}
