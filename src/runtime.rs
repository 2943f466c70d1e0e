//! Runtime core
//!
//! `Runtime` owns everything: the page arenas, the address index over them,
//! the weak-referencer multi-map, the external value store and the bootstrap
//! type handles. All access to paged memory goes through the byte/word
//! helpers here, which resolve `Obj` handles through the index; nothing in
//! the crate holds a raw pointer into a page.

use hashbrown::HashMap;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::any::Any;

use crate::error::{AllocError, AllocResult};
use crate::index::{AddressIndex, PageId};
use crate::obj::{Obj, ADDR_BITS, PAGE_SIZE, WORD};
use crate::types::{PageFlags, TypeHandle};

/// A mapped block of one or more contiguous pages.
pub struct PageDesc {
    /// First synthetic address of the block.
    pub base: u64,
    /// Block length in bytes, a multiple of `PAGE_SIZE`.
    pub len: usize,
    /// Cell address of the type whose instances the block holds.
    pub ty: Obj,
    pub flags: PageFlags,
    /// Next block in the owning type's page list.
    pub next: Option<PageId>,
    pub(crate) data: Box<[u8]>,
}

/// Handles to the built-in types, filled in by `Runtime::setup`.
#[derive(Clone, Copy)]
pub struct Boot {
    pub root_type: TypeHandle,
    pub size_type: TypeHandle,
    pub char_type: TypeHandle,
    pub dict_header_type: TypeHandle,
    pub array_type: TypeHandle,
    pub(crate) field_info_a_type: TypeHandle,
    pub(crate) field_info_b_type: TypeHandle,
    pub(crate) dict_block_type: TypeHandle,
}

impl Boot {
    pub(crate) fn placeholder() -> Boot {
        let null = TypeHandle(Obj::NULL);
        Boot {
            root_type: null,
            size_type: null,
            char_type: null,
            dict_header_type: null,
            array_type: null,
            field_info_a_type: null,
            field_info_b_type: null,
            dict_block_type: null,
        }
    }
}

pub struct Runtime {
    pub(crate) index: AddressIndex,
    pub(crate) pages: Vec<Option<PageDesc>>,
    /// Pages currently mapped, in `PAGE_SIZE` units.
    pub(crate) mapped: usize,
    /// Weak edges: target cell address → fields referencing it.
    pub(crate) referencers: HashMap<u64, Vec<u64>>,
    /// Host values owned by `NEEDS_FREE` fields, keyed by handle.
    pub(crate) externals: HashMap<u64, Box<dyn Any>>,
    pub(crate) next_external: u64,
    pub(crate) rng: StdRng,
    pub boot: Boot,
}

impl Runtime {
    pub(crate) fn bare(rng: StdRng) -> Runtime {
        Runtime {
            index: AddressIndex::new(),
            pages: Vec::new(),
            mapped: 0,
            referencers: HashMap::new(),
            externals: HashMap::new(),
            next_external: 1,
            rng,
            boot: Boot::placeholder(),
        }
    }

    /// Number of pages currently mapped.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.mapped
    }

    #[inline]
    pub(crate) fn page(&self, id: PageId) -> &PageDesc {
        self.pages[id as usize].as_ref().expect("unmapped page id")
    }

    #[inline]
    pub(crate) fn page_mut(&mut self, id: PageId) -> &mut PageDesc {
        self.pages[id as usize].as_mut().expect("unmapped page id")
    }

    /// Page containing `addr`; panics if the address is not mapped.
    pub(crate) fn descriptor_id(&self, addr: Obj) -> PageId {
        match self.index.lookup(addr.page_base()) {
            Some(id) => id,
            None => panic!("address not mapped: {addr:?}"),
        }
    }

    pub(crate) fn try_descriptor_id(&self, addr: Obj) -> Option<PageId> {
        self.index.lookup(addr.page_base())
    }

    // ---- raw access ------------------------------------------------------

    fn slice(&self, addr: Obj, len: usize) -> &[u8] {
        let d = self.page(self.descriptor_id(addr));
        let off = (addr.0 - d.base) as usize;
        debug_assert!(off + len <= d.len, "access crosses block end: {addr:?}");
        &d.data[off..off + len]
    }

    fn slice_mut(&mut self, addr: Obj, len: usize) -> &mut [u8] {
        let id = self.descriptor_id(addr);
        let d = self.page_mut(id);
        let off = (addr.0 - d.base) as usize;
        debug_assert!(off + len <= d.len, "access crosses block end: {addr:?}");
        &mut d.data[off..off + len]
    }

    #[inline]
    pub fn read_byte(&self, addr: Obj) -> u8 {
        self.slice(addr, 1)[0]
    }

    #[inline]
    pub fn write_byte(&mut self, addr: Obj, v: u8) {
        self.slice_mut(addr, 1)[0] = v;
    }

    /// Read a little-endian word as a handle.
    #[inline]
    pub fn read_word(&self, addr: Obj) -> Obj {
        Obj(u64::from_le_bytes(
            self.slice(addr, WORD).try_into().unwrap(),
        ))
    }

    #[inline]
    pub fn write_word(&mut self, addr: Obj, v: Obj) {
        self.slice_mut(addr, WORD).copy_from_slice(&v.0.to_le_bytes());
    }

    /// Read a little-endian word as a plain number.
    #[inline]
    pub fn read_size(&self, addr: Obj) -> u64 {
        self.read_word(addr).0
    }

    #[inline]
    pub fn write_size(&mut self, addr: Obj, v: u64) {
        self.write_word(addr, Obj(v));
    }

    pub fn read_bytes(&self, addr: Obj, len: usize) -> &[u8] {
        self.slice(addr, len)
    }

    pub fn write_bytes(&mut self, addr: Obj, bytes: &[u8]) {
        self.slice_mut(addr, bytes.len()).copy_from_slice(bytes);
    }

    pub(crate) fn zero(&mut self, addr: Obj, len: usize) {
        self.slice_mut(addr, len).fill(0);
    }

    // ---- block mapping ---------------------------------------------------

    /// Pick an unused page-aligned base for a `contig`-page block.
    fn random_base(&mut self, contig: usize) -> u64 {
        let addr_mask = (1u64 << ADDR_BITS) - 1;
        let align_mask = !(PAGE_SIZE as u64 - 1);
        loop {
            let base = self.rng.random::<u64>() & addr_mask & align_mask;
            if base < PAGE_SIZE as u64 {
                continue;
            }
            if base + (contig * PAGE_SIZE) as u64 > 1 << ADDR_BITS {
                continue;
            }
            let free = (0..contig)
                .all(|k| self.index.lookup(base + (k * PAGE_SIZE) as u64).is_none());
            if free {
                return base;
            }
        }
    }

    /// Map a zeroed block of `contig` pages for instances of `ty`.
    pub(crate) fn map_block(
        &mut self,
        contig: usize,
        ty: Obj,
        flags: PageFlags,
    ) -> AllocResult<PageId> {
        let len = contig * PAGE_SIZE;
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| AllocError)?;
        buf.resize(len, 0);
        let base = self.random_base(contig);
        let desc = PageDesc {
            base,
            len,
            ty,
            flags,
            next: None,
            data: buf.into_boxed_slice(),
        };
        let id = match self.pages.iter().position(|p| p.is_none()) {
            Some(free) => {
                self.pages[free] = Some(desc);
                free as PageId
            }
            None => {
                self.pages.push(Some(desc));
                (self.pages.len() - 1) as PageId
            }
        };
        for k in 0..contig {
            self.index.register(base + (k * PAGE_SIZE) as u64, id);
        }
        self.mapped += contig;
        debug!("mapped {contig} page(s) at {base:#x}");
        Ok(id)
    }

    /// Unmap a block and drop its backing memory.
    pub(crate) fn unmap_block(&mut self, id: PageId) {
        let desc = self.pages[id as usize].take().expect("unmapped page id");
        let contig = desc.len / PAGE_SIZE;
        for k in 0..contig {
            self.index.unregister(desc.base + (k * PAGE_SIZE) as u64);
        }
        self.mapped -= contig;
        debug!("unmapped {contig} page(s) at {:#x}", desc.base);
    }

    // ---- external values -------------------------------------------------

    /// Hand a host value to the runtime; the returned key can be stored in a
    /// `NEEDS_FREE` field and is dropped with the owning instance.
    pub fn register_external(&mut self, value: Box<dyn Any>) -> u64 {
        let key = self.next_external;
        self.next_external += 1;
        self.externals.insert(key, value);
        key
    }

    /// Reclaim a registered host value by key.
    pub fn take_external(&mut self, key: u64) -> Option<Box<dyn Any>> {
        self.externals.remove(&key)
    }

    pub fn external(&self, key: u64) -> Option<&dyn Any> {
        self.externals.get(&key).map(|b| b.as_ref())
    }
}

impl Runtime {
    /// Live types: every referenced instance of the root type.
    pub fn types(&self, root: TypeHandle) -> Vec<TypeHandle> {
        let stride = self.paged_size(root);
        let mut out = Vec::new();
        let mut cursor = self.page_list(root);
        while let Some(id) = cursor {
            let d = self.page(id);
            let (base, len, next) = (d.base, d.len, d.next);
            let mut addr = Obj(base);
            while addr.0 + stride as u64 <= base + len as u64 {
                if !self.read_word(addr).is_null() {
                    out.push(TypeHandle(addr));
                }
                addr = addr.add(stride);
            }
            cursor = next;
        }
        out
    }

    /// Run `f` once per live type.
    pub fn for_each_type(&mut self, root: TypeHandle, mut f: impl FnMut(&mut Runtime, TypeHandle)) {
        for t in self.types(root) {
            f(self, t);
        }
    }
}

pub(crate) fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub(crate) fn os_rng() -> StdRng {
    StdRng::from_os_rng()
}
