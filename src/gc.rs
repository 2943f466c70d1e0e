//! Collection
//!
//! Reclamation is two-pass: the first pass over every live type resets the
//! fields of each unreferenced slot (which detaches dependents and prunes
//! weak edges, letting further slots die), the second unmaps pages left with
//! no referenced slot and relinks each type's page list tail-first.

use log::info;

use crate::index::PageId;
use crate::obj::Obj;
use crate::runtime::Runtime;
use crate::types::{TypeFlags, TypeHandle};

impl Runtime {
    /// Number of referenced slots (or array parts) on a block.
    pub(crate) fn page_occupied_slots(&mut self, id: PageId, ty: TypeHandle) -> usize {
        let mut occupied = 0;
        for slot in self.block_slots(id, ty) {
            if self.is_referenced(slot) {
                occupied += 1;
            }
        }
        occupied
    }

    /// Cell addresses of every slot (instance or array part) on a block.
    fn block_slots(&mut self, id: PageId, ty: TypeHandle) -> Vec<Obj> {
        let d = self.page(id);
        let (base, len) = (d.base, d.len);
        let mut slots = Vec::new();
        if self.type_flags(ty).contains(TypeFlags::ARRAY) {
            let mut p = Obj(base);
            while p.0 < base + len as u64 {
                slots.push(p);
                p = p.add(self.part_extent(p));
            }
        } else {
            let stride = self.paged_size(ty);
            let mut addr = Obj(base);
            while addr.0 + stride as u64 <= base + len as u64 {
                slots.push(addr);
                addr = addr.add(stride);
            }
        }
        slots
    }

    /// Reset the fields of every unreferenced slot on a block.
    fn reset_unreferenced(&mut self, id: PageId, ty: TypeHandle) {
        let array = self.type_flags(ty).contains(TypeFlags::ARRAY);
        let zone = self.offset_zone(ty);
        for slot in self.block_slots(id, ty) {
            if self.is_referenced(slot) {
                continue;
            }
            if array {
                // A dead continuation still points at its predecessor's
                // `next` field; clear the cell so the part cannot resolve
                // through a reused head.
                self.write_word(slot, Obj::NULL);
                if self.part_count(slot) > 0 {
                    self.free_part(slot);
                }
            } else {
                self.reset_fields(slot.add(zone), ty);
            }
        }
    }

    /// Walk a page list tail-first, resetting dead slots and (when `delete`)
    /// unmapping blocks with no referenced slot. Returns the new list head.
    fn update_page_list(
        &mut self,
        head: Option<PageId>,
        ty: TypeHandle,
        delete: bool,
    ) -> Option<PageId> {
        let id = head?;
        let tail = self.page(id).next;
        let new_tail = self.update_page_list(tail, ty, delete);
        self.page_mut(id).next = new_tail;
        if delete && self.page_occupied_slots(id, ty) == 0 {
            // Slots that died after the reset pass visited them still hold
            // dependents; release them before the block goes away.
            self.reset_unreferenced(id, ty);
            self.unmap_block(id);
            return new_tail;
        }
        self.reset_unreferenced(id, ty);
        Some(id)
    }

    /// Number of referenced instances of a type.
    pub fn type_instances(&mut self, ty: TypeHandle) -> usize {
        let mut total = 0;
        let mut cursor = self.page_list(ty);
        while let Some(id) = cursor {
            total += self.page_occupied_slots(id, ty);
            cursor = self.page(id).next;
        }
        total
    }

    /// Reset one type's dead slots and unmap its empty pages.
    pub fn remove_superfluous_pages(&mut self, ty: TypeHandle) {
        for delete in [false, true] {
            let head = self.page_list(ty);
            let new_head = self.update_page_list(head, ty, delete);
            self.set_page_list(ty, new_head);
        }
    }

    /// Full collection: sweep every live type's pages twice. The first pass
    /// lets cascades settle (a detached dependent frees its own dependents),
    /// the second reclaims emptied pages.
    pub fn garbage_collect(&mut self, root: TypeHandle) {
        for delete in [false, true] {
            for ty in self.types(root) {
                let head = self.page_list(ty);
                let new_head = self.update_page_list(head, ty, delete);
                self.set_page_list(ty, new_head);
            }
        }
        info!("gc: {} page(s) mapped after collection", self.page_count());
    }
}
