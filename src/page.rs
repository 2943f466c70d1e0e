//! Page and array allocator
//!
//! Instances are "spotted": each type keeps a list of page blocks, and a spot
//! request scans blocks whose flags match for a free slot before mapping a
//! new block. Array pages all belong to the built-in array type and are
//! divided into parts; a logical array is a chain of parts linked through the
//! `next` word, growing a new part only when in-place growth is impossible.

use crate::error::AllocResult;
use crate::index::PageId;
use crate::obj::{Obj, PAGE_SIZE, WORD};
use crate::runtime::Runtime;
use crate::types::{FieldFlags, PageFlags, TypeFlags, TypeHandle};

/// Array part header: `[cell][next][content_type][count][tail_free]`.
pub(crate) const PART_HEADER: usize = 5 * WORD;

pub(crate) const P_NEXT: usize = WORD;
pub(crate) const P_CONTENT: usize = 2 * WORD;
pub(crate) const P_COUNT: usize = 3 * WORD;
pub(crate) const P_TAIL: usize = 4 * WORD;

impl Runtime {
    // ---- part geometry ---------------------------------------------------

    #[inline]
    pub(crate) fn part_next(&self, p: Obj) -> Obj {
        self.read_word(p.add(P_NEXT))
    }

    #[inline]
    pub(crate) fn part_content(&self, p: Obj) -> Obj {
        self.read_word(p.add(P_CONTENT))
    }

    #[inline]
    pub(crate) fn part_count(&self, p: Obj) -> usize {
        self.read_size(p.add(P_COUNT)) as usize
    }

    #[inline]
    pub(crate) fn part_tail(&self, p: Obj) -> usize {
        self.read_size(p.add(P_TAIL)) as usize
    }

    /// First element of a part.
    #[inline]
    pub(crate) fn part_elems(&self, p: Obj) -> Obj {
        p.add(PART_HEADER)
    }

    /// Total bytes the part spans, header included.
    pub(crate) fn part_extent(&self, p: Obj) -> usize {
        let count = self.part_count(p);
        let elems = if count == 0 {
            0
        } else {
            count * self.elem_size(TypeHandle(self.part_content(p)))
        };
        PART_HEADER + elems + self.part_tail(p)
    }

    /// The part after `p` inside the same block, if any. Parts tile a block
    /// exactly, so the successor starts where `p`'s extent ends.
    fn next_part_in_block(&self, id: PageId, p: Obj) -> Option<Obj> {
        let d = self.page(id);
        let end = d.base + d.len as u64;
        let q = p.add(self.part_extent(p));
        if q.0 < end {
            Some(q)
        } else {
            None
        }
    }

    /// The part of an array block containing `addr`.
    pub(crate) fn find_part(&self, id: PageId, addr: Obj) -> Obj {
        let mut p = Obj(self.page(id).base);
        loop {
            let extent = self.part_extent(p);
            if addr.0 < p.0 + extent as u64 {
                return p;
            }
            p = p.add(extent);
        }
    }

    /// Reset a part to free space: element fields released, bytes zeroed,
    /// tail spanning the whole extent. The cell is left untouched.
    pub(crate) fn free_part(&mut self, p: Obj) {
        let extent = self.part_extent(p);
        let count = self.part_count(p);
        if count > 0 {
            let content = TypeHandle(self.part_content(p));
            // A dead array can outlive its content type's record page; skip
            // the field walk when the record is gone.
            if self.try_descriptor_id(content.0).is_some() {
                let zone = self.offsets(content);
                let stride = self.elem_size(content);
                for i in 0..count {
                    let elem = self.part_elems(p).add(i * stride);
                    self.reset_fields(elem.add(zone), content);
                }
            }
        }
        self.zero(p.add(WORD), extent - WORD);
        self.write_size(p.add(P_TAIL), (extent - PART_HEADER) as u64);
    }

    // ---- spotting --------------------------------------------------------

    /// Find or create a free slot for an instance of `ty` on a page with
    /// exactly the requested flags. For array types `array_bytes` is the
    /// element-space requirement and the result is a free part whose tail
    /// covers it; for other types the result is a reset instance slot.
    pub(crate) fn spot_internal(
        &mut self,
        ty: TypeHandle,
        flags: PageFlags,
        array_bytes: usize,
    ) -> AllocResult<Obj> {
        let array = self.type_flags(ty).contains(TypeFlags::ARRAY);
        let mut cursor = self.page_list(ty);
        loop {
            let id = match cursor {
                Some(id) => id,
                None => {
                    let bytes = if array {
                        array_bytes + PART_HEADER
                    } else {
                        self.paged_size(ty)
                    };
                    let contig = bytes.div_ceil(PAGE_SIZE);
                    let id = self.map_block(contig, ty.0, flags)?;
                    if array {
                        let base = Obj(self.page(id).base);
                        let tail = contig * PAGE_SIZE - PART_HEADER;
                        self.write_size(base.add(P_TAIL), tail as u64);
                    }
                    let head = self.page_list(ty);
                    self.page_mut(id).next = head;
                    self.set_page_list(ty, Some(id));
                    id
                }
            };
            if self.page(id).flags == flags {
                let found = if array {
                    self.scan_array_block(id, array_bytes)
                } else {
                    self.scan_basic_block(id, ty)
                };
                if let Some(slot) = found {
                    return Ok(slot);
                }
            }
            cursor = self.page(id).next;
        }
    }

    /// First unreferenced slot of an instance block, with its fields reset.
    fn scan_basic_block(&mut self, id: PageId, ty: TypeHandle) -> Option<Obj> {
        let stride = self.paged_size(ty);
        let zone = self.offset_zone(ty);
        let d = self.page(id);
        let (base, len) = (d.base, d.len);
        let mut addr = Obj(base);
        while addr.0 + stride as u64 <= base + len as u64 {
            if !self.is_referenced(addr) {
                self.reset_fields(addr.add(zone), ty);
                return Some(addr);
            }
            addr = addr.add(stride);
        }
        None
    }

    /// First free part of an array block with at least `needed` element
    /// bytes, merging adjacent dead parts along the way.
    fn scan_array_block(&mut self, id: PageId, needed: usize) -> Option<Obj> {
        let mut cursor = Some(Obj(self.page(id).base));
        while let Some(p) = cursor {
            cursor = self.next_part_in_block(id, p);
            if self.is_referenced(p) {
                continue;
            }
            self.write_word(p, Obj::NULL);
            if self.part_count(p) > 0 {
                self.free_part(p);
            }
            self.merge_free_tail(id, p);
            if self.part_tail(p) >= needed {
                self.carve_part(p, needed);
                return Some(p);
            }
            cursor = self.next_part_in_block(id, p);
        }
        None
    }

    /// Absorb every dead part following `p` within its block into `p`'s tail.
    fn merge_free_tail(&mut self, id: PageId, p: Obj) {
        while let Some(q) = self.next_part_in_block(id, p) {
            if self.is_referenced(q) {
                break;
            }
            if self.part_count(q) > 0 {
                self.free_part(q);
            }
            let absorbed = self.part_extent(q);
            self.zero(q, PART_HEADER);
            self.write_size(p.add(P_TAIL), (self.part_tail(p) + absorbed) as u64);
        }
    }

    /// Split the spare tail of a free part off as its own free part, when it
    /// is big enough to carry a header.
    fn carve_part(&mut self, p: Obj, keep: usize) {
        let tail = self.part_tail(p);
        debug_assert!(tail >= keep);
        if tail - keep > PART_HEADER {
            let q = self.part_elems(p).add(keep);
            self.zero(q, PART_HEADER);
            self.write_size(q.add(P_TAIL), (tail - keep - PART_HEADER) as u64);
            self.write_size(p.add(P_TAIL), keep as u64);
        }
    }

    /// Allocate an unreferenced instance of `ty` on a basic page.
    pub fn spot(&mut self, ty: TypeHandle) -> AllocResult<Obj> {
        self.spot_internal(ty, PageFlags::empty(), 0)
    }

    /// Allocate a dependent instance of `ty` owned by `field`.
    pub fn spot_dependent(&mut self, field: Obj, ty: TypeHandle) -> AllocResult<Obj> {
        if !self.get_flags(field).contains(FieldFlags::DEPENDENT) {
            panic!("misbound instance: spot_dependent through a non-dependent field");
        }
        let obj = self.spot_internal(ty, PageFlags::DEPENDENT, 0)?;
        self.attach_field(field, obj);
        Ok(obj)
    }

    pub(crate) fn spot_array_internal(
        &mut self,
        content: TypeHandle,
        n: usize,
        flags: PageFlags,
    ) -> AllocResult<Obj> {
        let art = self.boot.array_type;
        let needed = n * self.elem_size(content);
        let p = self.spot_internal(art, flags, needed)?;
        self.write_word(p.add(P_CONTENT), content.0);
        self.write_size(p.add(P_COUNT), n as u64);
        self.write_size(p.add(P_TAIL), (self.part_tail(p) - needed) as u64);
        self.zero(self.part_elems(p), needed);
        Ok(p)
    }

    /// Allocate an unreferenced array of `n` elements of `content`.
    pub fn spot_array(&mut self, content: TypeHandle, n: usize) -> AllocResult<Obj> {
        self.spot_array_internal(content, n, PageFlags::empty())
    }

    /// Allocate a dependent array owned by `field`.
    pub fn spot_array_dependent(
        &mut self,
        field: Obj,
        content: TypeHandle,
        n: usize,
    ) -> AllocResult<Obj> {
        if !self.get_flags(field).contains(FieldFlags::DEPENDENT) {
            panic!("misbound instance: spot_array_dependent through a non-dependent field");
        }
        let p = self.spot_array_internal(content, n, PageFlags::DEPENDENT)?;
        self.attach_field(field, p);
        Ok(p)
    }

    // ---- array operations ------------------------------------------------

    /// Total element count of the array containing `a`, across all parts.
    pub fn array_length(&self, a: Obj) -> usize {
        let mut p = self.find_raw_refc(a);
        let mut total = 0;
        loop {
            total += self.part_count(p);
            let next = self.part_next(p);
            if next.is_null() {
                return total;
            }
            p = next;
        }
    }

    /// Start of element `i`, walking the part chain.
    pub fn array_get(&self, a: Obj, i: usize) -> Obj {
        let mut p = self.find_raw_refc(a);
        let mut i = i;
        loop {
            let count = self.part_count(p);
            if i < count {
                let stride = self.elem_size(TypeHandle(self.part_content(p)));
                return self.part_elems(p).add(i * stride);
            }
            i -= count;
            let next = self.part_next(p);
            if next.is_null() {
                panic!("array index out of range");
            }
            p = next;
        }
    }

    /// Index of the element containing `item`.
    pub fn array_find(&self, a: Obj, item: Obj) -> usize {
        let mut p = self.find_raw_refc(a);
        let mut preceding = 0;
        loop {
            let count = self.part_count(p);
            let stride = self.elem_size(TypeHandle(self.part_content(p)));
            let elems = self.part_elems(p);
            let end = elems.add(count * stride);
            if item.0 >= elems.0 && item.0 < end.0 {
                return preceding + item.offset_from(elems) / stride;
            }
            preceding += count;
            let next = self.part_next(p);
            if next.is_null() {
                panic!("address is not an element of this array");
            }
            p = next;
        }
    }

    /// Resize the array containing `a` to `new_len` elements. Surviving
    /// elements keep their bytes; dropped elements have their fields
    /// released; new elements are zeroed.
    pub fn resize_array(&mut self, a: Obj, new_len: usize) -> AllocResult<()> {
        let head = self.find_raw_refc(a);
        let total = self.array_length(head);
        if new_len < total {
            self.shrink_array(head, new_len);
        } else if new_len > total {
            self.grow_array(head, new_len - total)?;
        }
        Ok(())
    }

    fn shrink_array(&mut self, head: Obj, new_len: usize) {
        let content = TypeHandle(self.part_content(head));
        let zone = self.offsets(content);
        let stride = self.elem_size(content);
        let mut p = head;
        let mut kept = 0;
        // Find the part where the cut lands.
        loop {
            let count = self.part_count(p);
            if kept + count > new_len {
                break;
            }
            kept += count;
            let next = self.part_next(p);
            if next.is_null() {
                return;
            }
            if kept == new_len {
                // Cut exactly at a part boundary: drop the rest of the chain.
                self.write_word(p.add(P_NEXT), Obj::NULL);
                self.drop_part_chain(next);
                return;
            }
            p = next;
        }
        let keep_here = new_len - kept;
        let count = self.part_count(p);
        for i in keep_here..count {
            let elem = self.part_elems(p).add(i * stride);
            self.reset_fields(elem.add(zone), content);
            self.zero(elem, stride);
        }
        let reclaimed = (count - keep_here) * stride;
        self.write_size(p.add(P_COUNT), keep_here as u64);
        self.write_size(p.add(P_TAIL), (self.part_tail(p) + reclaimed) as u64);
        let next = self.part_next(p);
        self.write_word(p.add(P_NEXT), Obj::NULL);
        if !next.is_null() {
            self.drop_part_chain(next);
        }
        // Split the whole spare tail off as a free part, so the surviving
        // elements and the carved part still tile the block exactly.
        let spare = self.part_tail(p);
        if spare > PART_HEADER {
            let q = self.part_elems(p).add(keep_here * stride);
            self.zero(q, PART_HEADER);
            self.write_size(q.add(P_TAIL), (spare - PART_HEADER) as u64);
            self.write_size(p.add(P_TAIL), 0);
        }
    }

    /// Release every part of a detached chain tail.
    fn drop_part_chain(&mut self, first: Obj) {
        let mut p = first;
        loop {
            let next = self.part_next(p);
            self.write_word(p, Obj::NULL);
            self.free_part(p);
            if next.is_null() {
                return;
            }
            p = next;
        }
    }

    fn grow_array(&mut self, head: Obj, mut delta: usize) -> AllocResult<()> {
        let content = TypeHandle(self.part_content(head));
        let stride = self.elem_size(content);
        let mut last = head;
        loop {
            let next = self.part_next(last);
            if next.is_null() {
                break;
            }
            last = next;
        }
        // Grow in place as far as the block allows.
        let id = self.descriptor_id(last);
        self.merge_free_tail(id, last);
        let in_place = delta.min(self.part_tail(last) / stride);
        if in_place > 0 {
            let count = self.part_count(last);
            self.write_size(last.add(P_COUNT), (count + in_place) as u64);
            self.write_size(
                last.add(P_TAIL),
                (self.part_tail(last) - in_place * stride) as u64,
            );
            delta -= in_place;
        }
        if delta > 0 {
            let flags = self.page(id).flags;
            let p = self.spot_array_internal(content, delta, flags)?;
            // The continuation's cell points at the previous part's next
            // field, so liveness climbs through the head.
            self.write_word(p, last.add(P_NEXT));
            self.write_word(last.add(P_NEXT), p);
        }
        Ok(())
    }
}
