//! Dictionaries
//!
//! A ternary search trie over byte strings, stored entirely in paged memory:
//! the header holds the first block and the empty key's value, each block
//! holds one key byte, an `equal` child (next byte of keys sharing this
//! prefix), an `unequal` sibling (next candidate byte at this position,
//! always greater) and a value reference. Values are weak references, so a
//! dictionary never keeps its values alive.

use crate::error::AllocResult;
use crate::obj::{Obj, WORD};
use crate::runtime::Runtime;

// Header data-zone layout.
const D_FIRST_BLOCK: usize = 0;
const D_EMPTY_KEY: usize = WORD;

// Block data-zone layout.
const B_EQUAL: usize = 0;
const B_UNEQUAL: usize = WORD;
const B_VALUE: usize = 2 * WORD;
const B_KEY_PART: usize = 3 * WORD;

impl Runtime {
    /// Value bound to `key`, if any. A null binding reads as absent.
    pub fn dict_get(&self, dict: Obj, key: &[u8]) -> Option<Obj> {
        let header = self.get_c_object(dict);
        if key.is_empty() {
            let v = self.read_word(header.add(D_EMPTY_KEY));
            return if v.is_null() { None } else { Some(v) };
        }
        let mut block = self.read_word(header.add(D_FIRST_BLOCK));
        let mut i = 0;
        while !block.is_null() {
            let data = self.get_c_object(block);
            let part = self.read_byte(data.add(B_KEY_PART));
            let c = key[i];
            if part == c {
                i += 1;
                if i == key.len() {
                    let v = self.read_word(data.add(B_VALUE));
                    return if v.is_null() { None } else { Some(v) };
                }
                block = self.read_word(data.add(B_EQUAL));
            } else if part > c {
                // Siblings are kept ordered; a greater byte means the key
                // is not here.
                return None;
            } else {
                block = self.read_word(data.add(B_UNEQUAL));
            }
        }
        None
    }

    pub fn dict_has(&self, dict: Obj, key: &[u8]) -> bool {
        self.dict_get(dict, key).is_some()
    }

    /// Bind `key` to `value`, spotting trie blocks as needed. Binding null
    /// erases the key's value (blocks are only reclaimed with the dict).
    pub fn dict_set(&mut self, dict: Obj, key: &[u8], value: Obj) -> AllocResult<()> {
        let unpin = self.protect(dict);
        let result = self.dict_set_inner(dict, key, value);
        if unpin {
            self.unprotect(dict);
        }
        result
    }

    fn dict_set_inner(&mut self, dict: Obj, key: &[u8], value: Obj) -> AllocResult<()> {
        let header = self.get_c_object(dict);
        let holder = if key.is_empty() {
            header.add(D_EMPTY_KEY)
        } else {
            let mut field = header.add(D_FIRST_BLOCK);
            if self.read_word(field).is_null() {
                self.new_dict_block(field, key[0])?;
            }
            let mut data = self.get_c_object(self.read_word(field));
            let mut i = 0;
            loop {
                let part = self.read_byte(data.add(B_KEY_PART));
                let c = key[i];
                if part == c {
                    i += 1;
                    if i == key.len() {
                        break data.add(B_VALUE);
                    }
                    field = data.add(B_EQUAL);
                    if self.read_word(field).is_null() {
                        self.new_dict_block(field, key[i])?;
                    }
                    data = self.get_c_object(self.read_word(field));
                } else if part > c {
                    // Keep siblings ordered: detach the greater block, put
                    // the new byte in its place and reattach it as the
                    // sibling of the new block.
                    let old = self.detach_field(field);
                    let unpin_old = self.protect(old);
                    let spot = self.new_dict_block(field, c);
                    if unpin_old {
                        self.unprotect(old);
                    }
                    spot?;
                    data = self.get_c_object(self.read_word(field));
                    self.attach_field(data.add(B_UNEQUAL), old);
                } else {
                    field = data.add(B_UNEQUAL);
                    if self.read_word(field).is_null() {
                        self.new_dict_block(field, c)?;
                    }
                    data = self.get_c_object(self.read_word(field));
                }
            }
        };
        self.set_reference(holder, value);
        Ok(())
    }

    /// Spot a block under the dependent `field` and give it `key_part`.
    fn new_dict_block(&mut self, field: Obj, key_part: u8) -> AllocResult<()> {
        let dbt = self.boot.dict_block_type;
        let block = self.spot_dependent(field, dbt)?;
        let data = self.get_c_object(block);
        self.write_byte(data.add(B_KEY_PART), key_part);
        Ok(())
    }

    /// Number of keys with a non-null value.
    pub fn dict_count(&self, dict: Obj) -> usize {
        let header = self.get_c_object(dict);
        let empty = !self.read_word(header.add(D_EMPTY_KEY)).is_null() as usize;
        empty + self.count_blocks(self.read_word(header.add(D_FIRST_BLOCK)))
    }

    fn count_blocks(&self, block: Obj) -> usize {
        if block.is_null() {
            return 0;
        }
        let data = self.get_c_object(block);
        let here = !self.read_word(data.add(B_VALUE)).is_null() as usize;
        here
            + self.count_blocks(self.read_word(data.add(B_EQUAL)))
            + self.count_blocks(self.read_word(data.add(B_UNEQUAL)))
    }

    /// All bound keys in ascending byte order.
    pub fn dict_keys(&self, dict: Obj) -> Vec<Vec<u8>> {
        let header = self.get_c_object(dict);
        let mut out = Vec::new();
        if !self.read_word(header.add(D_EMPTY_KEY)).is_null() {
            out.push(Vec::new());
        }
        let mut prefix = Vec::new();
        self.collect_keys(
            self.read_word(header.add(D_FIRST_BLOCK)),
            &mut prefix,
            &mut out,
        );
        out
    }

    fn collect_keys(&self, block: Obj, prefix: &mut Vec<u8>, out: &mut Vec<Vec<u8>>) {
        if block.is_null() {
            return;
        }
        let data = self.get_c_object(block);
        prefix.push(self.read_byte(data.add(B_KEY_PART)));
        if !self.read_word(data.add(B_VALUE)).is_null() {
            out.push(prefix.clone());
        }
        self.collect_keys(self.read_word(data.add(B_EQUAL)), prefix, out);
        prefix.pop();
        self.collect_keys(self.read_word(data.add(B_UNEQUAL)), prefix, out);
    }
}
