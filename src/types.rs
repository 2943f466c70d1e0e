//! Type records and layout tables
//!
//! A type is an ordinary instance of the root type; its data zone is a fixed
//! record of words read and written through the accessors here. Each type
//! carries two layout tables, both ordinary arrays:
//!
//! * table A (`dfia`, entries of `fiat`): one entry per nested-object slot,
//!   giving the nested field's type and its offset into the data zone;
//! * table B (`dfib`, entries of `fibt`): one entry per data byte, a
//!   `FieldSlot` saying whether the byte starts a field (and with what type
//!   and flags) or continues the previous one.

use bitflags::bitflags;

use crate::index::PageId;
use crate::obj::{Obj, WORD};
use crate::runtime::Runtime;

bitflags! {
    /// Flags byte of a type record.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TypeFlags: u8 {
        /// Instances are raw scalar data with no inner structure.
        const PRIMITIVE = 0b0000_0001;
        /// Built-in type created by the bootstrap.
        const INTERNAL = 0b0000_0010;
        /// Instances are array parts; pages are scanned part-wise.
        const ARRAY = 0b0000_0100;
        /// One-byte character primitive.
        const CHAR = 0b0000_1000;
        /// The type of types.
        const ROOT = 0b0001_0000;
        /// Instances are table-B entries (used to tell the two layout
        /// tables apart when resolving a field-dictionary entry).
        const FIELD_TABLE = 0b0010_0000;
    }
}

bitflags! {
    /// Flags byte of a table-B field entry.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FieldFlags: u8 {
        /// One-word field holding an address rather than inline data.
        const POINTER = 0b0000_0001;
        /// `prepare` instantiates this field.
        const AUTO_INST = 0b0000_0010;
        /// Owning pointer: the child's cell points back at this field.
        const DEPENDENT = 0b0000_0101;
        /// Byte lives inside a nested object slot.
        const NESTED = 0b0000_1000;
        /// Field holds a key into the runtime's external value store.
        const NEEDS_FREE = 0b0010_0000;
        /// Weak reference: registered in the referencer multi-map.
        const REFERENCES = 0b0100_0001;
        /// Not a field start; the byte continues the previous field.
        const CONTINUATION = 0b1000_0000;
    }
}

bitflags! {
    /// Flags byte of a page block. `spot` only reuses slots from pages whose
    /// flags equal the request exactly.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PageFlags: u8 {
        /// Block holds dependent instances; cells are resolved through their
        /// owning field.
        const DEPENDENT = 0b0000_0001;
    }
}

/// A type, identified by the cell address of its record instance.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TypeHandle(pub Obj);

impl TypeHandle {
    #[inline]
    pub fn addr(self) -> Obj {
        self.0
    }
}

/// One byte of a table-B layout.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldSlot {
    /// The byte starts a field of type `ty` (null for padding declared as
    /// continuation-only regions never happens; `ty` is always a type cell).
    Start { ty: Obj, flags: FieldFlags },
    /// The byte belongs to the field started at a lower offset.
    Continuation,
}

// Type record field offsets within the data zone.
pub(crate) const T_DFIA: usize = 0;
pub(crate) const T_DFIB: usize = 8;
pub(crate) const T_VARIANTS: usize = 16;
pub(crate) const T_OBJECT_SIZE: usize = 24;
pub(crate) const T_OFFSETS: usize = 32;
pub(crate) const T_PAGED_SIZE: usize = 40;
pub(crate) const T_REFERENCERS: usize = 48;
pub(crate) const T_DYNAMIC_FIELDS: usize = 56;
pub(crate) const T_STATIC_FIELDS: usize = 64;
pub(crate) const T_PAGE_LIST: usize = 72;
pub(crate) const T_CLIENT_DATA: usize = 80;
pub(crate) const T_FLAGS: usize = 88;

/// Data-zone size of a type record.
pub(crate) const TYPE_SIZE: usize = T_FLAGS + 1;

impl Runtime {
    /// Start of a type record's data zone. Type records have one nested slot
    /// (the self slot), so the zone is a single word.
    #[inline]
    pub(crate) fn type_data(&self, t: TypeHandle) -> Obj {
        t.0.add(WORD)
    }

    /// Address of a record field, usable with `attach_field`.
    #[inline]
    pub(crate) fn type_field(&self, t: TypeHandle, off: usize) -> Obj {
        self.type_data(t).add(off)
    }

    #[inline]
    pub fn object_size(&self, t: TypeHandle) -> usize {
        self.read_size(self.type_field(t, T_OBJECT_SIZE)) as usize
    }

    #[inline]
    pub fn offsets(&self, t: TypeHandle) -> usize {
        self.read_size(self.type_field(t, T_OFFSETS)) as usize
    }

    #[inline]
    pub fn paged_size(&self, t: TypeHandle) -> usize {
        self.read_size(self.type_field(t, T_PAGED_SIZE)) as usize
    }

    pub(crate) fn referencers_left(&self, t: TypeHandle) -> usize {
        self.read_size(self.type_field(t, T_REFERENCERS)) as usize
    }

    pub(crate) fn set_referencers_left(&mut self, t: TypeHandle, n: usize) {
        self.write_size(self.type_field(t, T_REFERENCERS), n as u64);
    }

    #[inline]
    pub(crate) fn dfia(&self, t: TypeHandle) -> Obj {
        self.read_word(self.type_field(t, T_DFIA))
    }

    #[inline]
    pub(crate) fn dfib(&self, t: TypeHandle) -> Obj {
        self.read_word(self.type_field(t, T_DFIB))
    }

    #[inline]
    pub fn dynamic_fields(&self, t: TypeHandle) -> Obj {
        self.read_word(self.type_field(t, T_DYNAMIC_FIELDS))
    }

    #[inline]
    pub fn static_fields(&self, t: TypeHandle) -> Obj {
        self.read_word(self.type_field(t, T_STATIC_FIELDS))
    }

    /// Head of the type's page list. Stored as id + 1 so a zeroed record
    /// reads as the empty list.
    pub(crate) fn page_list(&self, t: TypeHandle) -> Option<PageId> {
        match self.read_size(self.type_field(t, T_PAGE_LIST)) {
            0 => None,
            v => Some((v - 1) as PageId),
        }
    }

    pub(crate) fn set_page_list(&mut self, t: TypeHandle, head: Option<PageId>) {
        let v = match head {
            None => 0,
            Some(id) => id as u64 + 1,
        };
        self.write_size(self.type_field(t, T_PAGE_LIST), v);
    }

    pub fn client_data(&self, t: TypeHandle) -> Obj {
        self.read_word(self.type_field(t, T_CLIENT_DATA))
    }

    pub fn set_client_data(&mut self, t: TypeHandle, v: Obj) {
        self.write_word(self.type_field(t, T_CLIENT_DATA), v);
    }

    #[inline]
    pub fn type_flags(&self, t: TypeHandle) -> TypeFlags {
        TypeFlags::from_bits_retain(self.read_byte(self.type_field(t, T_FLAGS)))
    }

    pub(crate) fn set_type_flags(&mut self, t: TypeHandle, f: TypeFlags) {
        self.write_byte(self.type_field(t, T_FLAGS), f.bits());
    }

    /// Byte size of the offset zone preceding an instance's data: one byte
    /// per nested slot, but never less than the cell word.
    #[inline]
    pub(crate) fn offset_zone(&self, t: TypeHandle) -> usize {
        self.offsets(t).max(WORD)
    }

    /// Byte stride of one array element of this type.
    #[inline]
    pub(crate) fn elem_size(&self, t: TypeHandle) -> usize {
        self.object_size(t) + self.offsets(t)
    }

    // ---- layout table access --------------------------------------------

    /// Element start of table-B entry `i` (inside the `dfib` array part).
    pub(crate) fn fib_element(&self, t: TypeHandle, i: usize) -> Obj {
        let part = self.dfib(t);
        let content = TypeHandle(self.part_content(part));
        debug_assert!(i < self.object_size(t), "table B index out of range");
        self.part_elems(part).add(i * self.elem_size(content))
    }

    pub(crate) fn fib_get(&self, t: TypeHandle, i: usize) -> FieldSlot {
        let entry = self.fib_element(t, i).add(1);
        let flags = FieldFlags::from_bits_retain(self.read_byte(entry.add(WORD)));
        if flags.contains(FieldFlags::CONTINUATION) {
            FieldSlot::Continuation
        } else {
            FieldSlot::Start {
                ty: self.read_word(entry),
                flags,
            }
        }
    }

    pub(crate) fn fib_set(&mut self, t: TypeHandle, i: usize, slot: FieldSlot) {
        let entry = self.fib_element(t, i).add(1);
        let (ty, flags) = match slot {
            FieldSlot::Start { ty, flags } => (ty, flags),
            FieldSlot::Continuation => (Obj::NULL, FieldFlags::CONTINUATION),
        };
        self.write_word(entry, ty);
        self.write_byte(entry.add(WORD), flags.bits());
    }

    /// Element start of table-A entry `i`.
    pub(crate) fn fia_element(&self, t: TypeHandle, i: usize) -> Obj {
        let part = self.dfia(t);
        let content = TypeHandle(self.part_content(part));
        debug_assert!(i < self.offsets(t), "table A index out of range");
        self.part_elems(part).add(i * self.elem_size(content))
    }

    /// Table-A entry `i`: the nested field's type cell and data offset, or
    /// `None` while the slot is unclaimed. Slot 0 is the self slot and is
    /// never stored.
    pub(crate) fn fia_get(&self, t: TypeHandle, i: usize) -> Option<(Obj, usize)> {
        let entry = self.fia_element(t, i).add(1);
        let ty = self.read_word(entry);
        if ty.is_null() {
            None
        } else {
            Some((ty, self.read_size(entry.add(WORD)) as usize))
        }
    }

    pub(crate) fn fia_set(&mut self, t: TypeHandle, i: usize, ty: Obj, data_offset: usize) {
        let entry = self.fia_element(t, i).add(1);
        self.write_word(entry, ty);
        self.write_size(entry.add(WORD), data_offset as u64);
    }
}
