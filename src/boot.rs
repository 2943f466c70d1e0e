//! Bootstrap
//!
//! `setup` builds the environment the allocator needs to run out of the
//! allocator's own page memory. Only the eight built-in type records are
//! hand-written; once they exist (pinned, on a hand-mapped root page) the
//! ordinary spotting machinery is safe to run, and it builds the records'
//! layout tables and field dictionaries the same way any client type gets
//! them.

use crate::error::AllocResult;
use crate::obj::{Obj, WORD};
use crate::runtime::{os_rng, seeded_rng, Boot, Runtime};
use crate::types::{
    FieldFlags, FieldSlot, PageFlags, TypeFlags, TypeHandle, TYPE_SIZE, T_DFIA, T_DFIB,
    T_DYNAMIC_FIELDS, T_STATIC_FIELDS,
};

const TYPE_PAGED: usize = TYPE_SIZE + WORD;

struct TypeSpec {
    object_size: usize,
    nested: usize,
    referencers: usize,
    flags: TypeFlags,
    fields: &'static [(&'static [u8], usize)],
}

const ROOT_SPEC: TypeSpec = TypeSpec {
    object_size: TYPE_SIZE,
    nested: 0,
    referencers: 0,
    flags: TypeFlags::INTERNAL.union(TypeFlags::ROOT),
    fields: &[
        (b"dfia", 0),
        (b"dfib", 8),
        (b"variants", 16),
        (b"object_size", 24),
        (b"offsets", 32),
        (b"paged_size", 40),
        (b"referencers", 48),
        (b"dynamic_fields", 56),
        (b"static_fields", 64),
        (b"page_list", 72),
        (b"flags", 88),
    ],
};

const SIZE_SPEC: TypeSpec = TypeSpec {
    object_size: WORD,
    nested: 0,
    referencers: 0,
    flags: TypeFlags::INTERNAL.union(TypeFlags::PRIMITIVE),
    fields: &[],
};

const CHAR_SPEC: TypeSpec = TypeSpec {
    object_size: 1,
    nested: 0,
    referencers: 0,
    flags: TypeFlags::INTERNAL
        .union(TypeFlags::PRIMITIVE)
        .union(TypeFlags::CHAR),
    fields: &[],
};

const FIELD_A_SPEC: TypeSpec = TypeSpec {
    object_size: 2 * WORD,
    nested: 0,
    referencers: 0,
    flags: TypeFlags::INTERNAL,
    fields: &[(b"field_type", 0), (b"data_offset", 8)],
};

const FIELD_B_SPEC: TypeSpec = TypeSpec {
    object_size: WORD + 1,
    nested: 0,
    referencers: 0,
    flags: TypeFlags::INTERNAL.union(TypeFlags::FIELD_TABLE),
    fields: &[(b"field_type", 0), (b"flags", 8)],
};

const DICT_HEADER_SPEC: TypeSpec = TypeSpec {
    object_size: 2 * WORD,
    nested: 0,
    referencers: 1,
    flags: TypeFlags::INTERNAL,
    fields: &[(b"first_block", 0), (b"empty_key_v", 8)],
};

const DICT_BLOCK_SPEC: TypeSpec = TypeSpec {
    object_size: 3 * WORD + 1,
    nested: 0,
    referencers: 1,
    flags: TypeFlags::INTERNAL,
    fields: &[(b"equal", 0), (b"unequal", 8), (b"value", 16), (b"key_part", 24)],
};

const ARRAY_SPEC: TypeSpec = TypeSpec {
    object_size: 4 * WORD,
    nested: 0,
    referencers: 0,
    flags: TypeFlags::INTERNAL.union(TypeFlags::ARRAY),
    fields: &[
        (b"next", 0),
        (b"content_type", 8),
        (b"count", 16),
        (b"tail_free", 24),
    ],
};

const SPECS: [TypeSpec; 8] = [
    ROOT_SPEC,
    SIZE_SPEC,
    CHAR_SPEC,
    FIELD_A_SPEC,
    FIELD_B_SPEC,
    DICT_HEADER_SPEC,
    DICT_BLOCK_SPEC,
    ARRAY_SPEC,
];

impl Runtime {
    /// Build a runtime with OS-seeded page placement.
    pub fn setup() -> Runtime {
        Runtime::bootstrap(Runtime::bare(os_rng())).expect("bootstrap allocation failed")
    }

    /// Build a runtime with deterministic page placement.
    pub fn setup_seeded(seed: u64) -> Runtime {
        Runtime::bootstrap(Runtime::bare(seeded_rng(seed))).expect("bootstrap allocation failed")
    }

    fn bootstrap(mut rt: Runtime) -> AllocResult<Runtime> {
        // Root page first. Its type is the root record it will itself hold;
        // the descriptor is patched once the record's address is known.
        let root_page = rt.map_block(1, Obj::NULL, PageFlags::empty())?;
        let base = Obj(rt.page(root_page).base);
        rt.page_mut(root_page).ty = base;

        let handle = |k: usize| TypeHandle(base.add(k * TYPE_PAGED));
        rt.boot = Boot {
            root_type: handle(0),
            size_type: handle(1),
            char_type: handle(2),
            field_info_a_type: handle(3),
            field_info_b_type: handle(4),
            dict_header_type: handle(5),
            dict_block_type: handle(6),
            array_type: handle(7),
        };
        let types = [
            rt.boot.root_type,
            rt.boot.size_type,
            rt.boot.char_type,
            rt.boot.field_info_a_type,
            rt.boot.field_info_b_type,
            rt.boot.dict_header_type,
            rt.boot.dict_block_type,
            rt.boot.array_type,
        ];

        // Hand-write the eight records, pinned.
        for (t, spec) in types.iter().zip(SPECS.iter()) {
            rt.write_word(t.0, t.0);
            let offsets = 1 + spec.nested;
            rt.write_size(
                rt.type_field(*t, crate::types::T_OBJECT_SIZE),
                spec.object_size as u64,
            );
            rt.write_size(rt.type_field(*t, crate::types::T_OFFSETS), offsets as u64);
            rt.write_size(
                rt.type_field(*t, crate::types::T_PAGED_SIZE),
                (spec.object_size + offsets.max(WORD)) as u64,
            );
            rt.set_referencers_left(*t, spec.referencers);
            rt.set_type_flags(*t, spec.flags);
        }
        rt.set_page_list(rt.boot.root_type, Some(root_page));

        // Layout tables through the real array allocator. Table B does not
        // exist yet, so the declared-dependent check is bypassed and the
        // parts are attached directly.
        let fiat = rt.boot.field_info_a_type;
        let fibt = rt.boot.field_info_b_type;
        for t in types {
            let offsets = rt.offsets(t);
            let object_size = rt.object_size(t);
            let fia = rt.spot_array_internal_boot(fiat, offsets)?;
            rt.attach_field(rt.type_field(t, T_DFIA), fia);
            let fib = rt.spot_array_internal_boot(fibt, object_size)?;
            rt.attach_field(rt.type_field(t, T_DFIB), fib);
        }

        // Fill table B for each built-in.
        let szt = rt.boot.size_type;
        let chrt = rt.boot.char_type;
        let dht = rt.boot.dict_header_type;
        let dbt = rt.boot.dict_block_type;
        let art = rt.boot.array_type;
        let word_field = |ty: TypeHandle, flags: FieldFlags| (ty, flags, WORD);
        let layouts: [(TypeHandle, &[(TypeHandle, FieldFlags, usize)]); 8] = [
            (
                rt.boot.root_type,
                &[
                    word_field(art, FieldFlags::DEPENDENT),
                    word_field(art, FieldFlags::DEPENDENT),
                    word_field(art, FieldFlags::DEPENDENT),
                    word_field(szt, FieldFlags::empty()),
                    word_field(szt, FieldFlags::empty()),
                    word_field(szt, FieldFlags::empty()),
                    word_field(szt, FieldFlags::empty()),
                    word_field(dht, FieldFlags::DEPENDENT),
                    word_field(dht, FieldFlags::DEPENDENT),
                    word_field(szt, FieldFlags::empty()),
                    word_field(szt, FieldFlags::empty()),
                    (chrt, FieldFlags::empty(), 1),
                ],
            ),
            (szt, &[word_field(szt, FieldFlags::empty())]),
            (chrt, &[(chrt, FieldFlags::empty(), 1)]),
            (
                fiat,
                &[
                    word_field(szt, FieldFlags::empty()),
                    word_field(szt, FieldFlags::empty()),
                ],
            ),
            (
                fibt,
                &[
                    word_field(szt, FieldFlags::empty()),
                    (chrt, FieldFlags::empty(), 1),
                ],
            ),
            (
                dht,
                &[
                    word_field(dbt, FieldFlags::DEPENDENT),
                    word_field(szt, FieldFlags::REFERENCES),
                ],
            ),
            (
                dbt,
                &[
                    word_field(dbt, FieldFlags::DEPENDENT),
                    word_field(dbt, FieldFlags::DEPENDENT),
                    word_field(szt, FieldFlags::REFERENCES),
                    (chrt, FieldFlags::empty(), 1),
                ],
            ),
            (
                art,
                &[
                    word_field(szt, FieldFlags::empty()),
                    word_field(szt, FieldFlags::empty()),
                    word_field(szt, FieldFlags::empty()),
                    word_field(szt, FieldFlags::empty()),
                ],
            ),
        ];
        for (t, fields) in layouts {
            let mut off = 0;
            for &(fty, flags, len) in fields {
                rt.fib_set(t, off, FieldSlot::Start { ty: fty.0, flags });
                for k in 1..len {
                    rt.fib_set(t, off + k, FieldSlot::Continuation);
                }
                off += len;
            }
            debug_assert_eq!(off, rt.object_size(t));
        }

        // Field dictionaries, now that spotting dependents is fully legal.
        for t in types {
            rt.spot_dependent(rt.type_field(t, T_DYNAMIC_FIELDS), dht)?;
            rt.spot_dependent(rt.type_field(t, T_STATIC_FIELDS), dht)?;
        }
        for (t, spec) in types.iter().zip(SPECS.iter()) {
            let dict = rt.dynamic_fields(*t);
            for &(name, offset) in spec.fields {
                let entry = rt.fib_element(*t, offset);
                rt.dict_set(dict, name, entry)?;
            }
        }
        Ok(rt)
    }

    /// Array spotting without the declared-field flag check, for tables that
    /// must exist before any table can be consulted.
    fn spot_array_internal_boot(&mut self, content: TypeHandle, n: usize) -> AllocResult<Obj> {
        let art = self.boot.array_type;
        let needed = n * self.elem_size(content);
        let p = self.spot_internal(art, PageFlags::DEPENDENT, needed)?;
        self.write_word(p.add(crate::page::P_CONTENT), content.0);
        self.write_size(p.add(crate::page::P_COUNT), n as u64);
        self.write_size(
            p.add(crate::page::P_TAIL),
            (self.part_tail(p) - needed) as u64,
        );
        Ok(p)
    }
}
