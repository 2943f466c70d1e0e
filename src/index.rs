//! Address index
//!
//! A sparse radix tree over the synthetic address space, mapping page bases
//! to page ids. Each node decodes one 9-bit window of the address; nodes are
//! created lazily, and when two addresses diverge above an existing node an
//! intermediate node is spliced in at the divergence level. Leaf nodes decode
//! bits just above the page offset, so one leaf covers a 2 MiB neighborhood
//! of pages.
//!
//! Nodes live in an arena; slots refer to other nodes by arena index and to
//! pages by `PageId`. Nothing is ever freed from the arena (the node count is
//! bounded by the number of distinct address prefixes ever seen, a handful
//! per mapped block).

use log::debug;

use crate::obj::{ADDR_BITS, PAGE_BITS, PAGE_SIZE, WORD};

/// Index of a live page in the runtime's page table.
pub type PageId = u32;

/// Bits decoded per node.
const FANOUT_BITS: u32 = (PAGE_SIZE / WORD).trailing_zeros();
const FANOUT: usize = PAGE_SIZE / WORD;
const FANOUT_MASK: u64 = FANOUT as u64 - 1;

// The ladder of node shifts must reach the top of the address space.
const _: () = assert!(FANOUT_BITS >= 1);
const _: () = assert!(PAGE_BITS + 5 * FANOUT_BITS >= ADDR_BITS);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Slot {
    Empty,
    Page(PageId),
    Node(u32),
}

struct IndexNode {
    /// Address bits below the window this node decodes.
    shift: u32,
    /// Address bits above the window, identifying the region this node covers.
    prefix: u64,
    slots: Box<[Slot]>,
}

impl IndexNode {
    fn new(shift: u32, prefix: u64) -> IndexNode {
        IndexNode {
            shift,
            prefix,
            slots: vec![Slot::Empty; FANOUT].into_boxed_slice(),
        }
    }

    #[inline]
    fn window(&self, addr: u64) -> usize {
        ((addr >> self.shift) & FANOUT_MASK) as usize
    }

    #[inline]
    fn covers(&self, addr: u64) -> bool {
        chunk_prefix(addr, self.shift) == self.prefix
    }
}

/// Bits of `addr` above the window decoded at `shift`.
#[inline]
fn chunk_prefix(addr: u64, shift: u32) -> u64 {
    addr.checked_shr(shift + FANOUT_BITS).unwrap_or(0)
}

/// Sparse page-base → page-id directory.
pub struct AddressIndex {
    nodes: Vec<IndexNode>,
    root: Option<u32>,
}

impl AddressIndex {
    pub fn new() -> AddressIndex {
        AddressIndex {
            nodes: Vec::new(),
            root: None,
        }
    }

    fn new_node(&mut self, shift: u32, prefix: u64) -> u32 {
        let idx = self.nodes.len() as u32;
        debug!("index: new node at shift {shift} for prefix {prefix:#x}");
        self.nodes.push(IndexNode::new(shift, prefix));
        idx
    }

    fn new_leaf(&mut self, addr: u64, id: PageId) -> u32 {
        let leaf = self.new_node(PAGE_BITS, chunk_prefix(addr, PAGE_BITS));
        let w = self.nodes[leaf as usize].window(addr);
        self.nodes[leaf as usize].slots[w] = Slot::Page(id);
        leaf
    }

    /// Find the page containing `addr`, if any.
    pub fn lookup(&self, addr: u64) -> Option<PageId> {
        let mut cur = self.root?;
        loop {
            let node = &self.nodes[cur as usize];
            if !node.covers(addr) {
                return None;
            }
            match node.slots[node.window(addr)] {
                Slot::Empty => return None,
                Slot::Page(id) => return Some(id),
                Slot::Node(child) => cur = child,
            }
        }
    }

    /// Record that the page based at `addr` is page `id`.
    ///
    /// `addr` must be page-aligned and not currently registered.
    pub fn register(&mut self, addr: u64, id: PageId) {
        debug_assert_eq!(addr % PAGE_SIZE as u64, 0);
        let Some(mut cur) = self.root else {
            let leaf = self.new_leaf(addr, id);
            self.root = Some(leaf);
            return;
        };
        let mut parent: Option<(u32, usize)> = None;
        loop {
            let node = &self.nodes[cur as usize];
            if node.covers(addr) {
                let w = node.window(addr);
                if node.shift == PAGE_BITS {
                    debug_assert_eq!(node.slots[w], Slot::Empty, "page already registered");
                    self.nodes[cur as usize].slots[w] = Slot::Page(id);
                    return;
                }
                match node.slots[w] {
                    Slot::Empty => {
                        let leaf = self.new_leaf(addr, id);
                        self.nodes[cur as usize].slots[w] = Slot::Node(leaf);
                        return;
                    }
                    Slot::Node(child) => {
                        parent = Some((cur, w));
                        cur = child;
                    }
                    Slot::Page(_) => unreachable!("page entry above leaf level"),
                }
            } else {
                // Prefix divergence: splice an intermediate node at the first
                // level whose window distinguishes the two regions.
                let node_shift = node.shift;
                let node_prefix = node.prefix;
                assert!(
                    node_shift + FANOUT_BITS < u64::BITS,
                    "divergence above the address space"
                );
                let node_addr = node_prefix << (node_shift + FANOUT_BITS);
                let mut shift = node_shift + FANOUT_BITS;
                while chunk_prefix(addr, shift) != chunk_prefix(node_addr, shift) {
                    shift += FANOUT_BITS;
                }
                let inter = self.new_node(shift, chunk_prefix(addr, shift));
                let w_old = self.nodes[inter as usize].window(node_addr);
                self.nodes[inter as usize].slots[w_old] = Slot::Node(cur);
                match parent {
                    Some((p, w)) => self.nodes[p as usize].slots[w] = Slot::Node(inter),
                    None => self.root = Some(inter),
                }
                cur = inter;
            }
        }
    }

    /// Remove the entry for the page based at `addr`.
    pub fn unregister(&mut self, addr: u64) {
        let Some(mut cur) = self.root else {
            return;
        };
        loop {
            let node = &self.nodes[cur as usize];
            if !node.covers(addr) {
                return;
            }
            let w = node.window(addr);
            match node.slots[w] {
                Slot::Empty => return,
                Slot::Page(_) => {
                    self.nodes[cur as usize].slots[w] = Slot::Empty;
                    return;
                }
                Slot::Node(child) => cur = child,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = PAGE_SIZE as u64;

    #[test]
    fn test_empty_lookup() {
        let idx = AddressIndex::new();
        assert_eq!(idx.lookup(0x1000), None);
    }

    #[test]
    fn test_register_lookup_single() {
        let mut idx = AddressIndex::new();
        idx.register(7 * P, 3);
        assert_eq!(idx.lookup(7 * P), Some(3));
        assert_eq!(idx.lookup(8 * P), None);
        assert_eq!(idx.lookup(0), None);
    }

    #[test]
    fn test_leaf_sharing() {
        // Two pages under the same leaf prefix.
        let mut idx = AddressIndex::new();
        idx.register(0x4000_0000, 1);
        idx.register(0x4000_0000 + 5 * P, 2);
        assert_eq!(idx.lookup(0x4000_0000), Some(1));
        assert_eq!(idx.lookup(0x4000_0000 + 5 * P), Some(2));
    }

    #[test]
    fn test_prefix_divergence_split() {
        let mut idx = AddressIndex::new();
        idx.register(0x0000_1234_5678_9000 & !(P - 1), 1);
        idx.register(0x0000_7eee_0000_0000, 2);
        idx.register(0x0000_1234_0000_0000, 3);
        assert_eq!(idx.lookup(0x0000_1234_5678_9000 & !(P - 1)), Some(1));
        assert_eq!(idx.lookup(0x0000_7eee_0000_0000), Some(2));
        assert_eq!(idx.lookup(0x0000_1234_0000_0000), Some(3));
        assert_eq!(idx.lookup(0x0000_1234_5678_0000), None);
    }

    #[test]
    fn test_unregister() {
        let mut idx = AddressIndex::new();
        idx.register(0x10_0000, 9);
        idx.register(0x20_0000, 10);
        idx.unregister(0x10_0000);
        assert_eq!(idx.lookup(0x10_0000), None);
        assert_eq!(idx.lookup(0x20_0000), Some(10));
        // Unregistering an absent address is a no-op.
        idx.unregister(0x30_0000);
    }

    #[test]
    fn test_many_scattered_pages() {
        let mut idx = AddressIndex::new();
        let mut addrs = Vec::new();
        let mut x: u64 = 0x9e37_79b9_7f4a_7c15;
        for i in 0..200u32 {
            x = x.wrapping_mul(0x2545_f491_4f6c_dd1d).wrapping_add(1);
            let a = (x & ((1 << ADDR_BITS) - 1)) & !(P - 1);
            if a == 0 || idx.lookup(a).is_some() {
                continue;
            }
            idx.register(a, i);
            addrs.push((a, i));
        }
        for &(a, i) in &addrs {
            assert_eq!(idx.lookup(a), Some(i));
        }
    }
}
