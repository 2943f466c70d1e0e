use crate::{FieldFlags, Obj, Runtime, TypeFlags, TypeHandle, WORD};

fn runtime() -> Runtime {
    Runtime::setup_seeded(0x6d75_6c63_68_u64)
}

/// A 16-byte type with two word fields, `x` and `y`.
fn point_type(rt: &mut Runtime) -> TypeHandle {
    let szt = rt.boot.size_type;
    let t = rt.create_type(0, 0, 16, TypeFlags::empty()).unwrap();
    rt.set_dynamic_field(t, szt, b"x", 0, FieldFlags::empty())
        .unwrap();
    rt.set_dynamic_field(t, szt, b"y", 8, FieldFlags::empty())
        .unwrap();
    t
}

#[test]
fn test_setup_builtins() {
    let mut rt = runtime();
    let root = rt.boot.root_type;
    assert_eq!(rt.object_size(root), 89);
    assert_eq!(rt.paged_size(root), 97);
    assert!(rt.type_flags(root).contains(TypeFlags::ROOT));
    assert!(rt.type_flags(rt.boot.array_type).contains(TypeFlags::ARRAY));
    assert!(rt
        .type_flags(rt.boot.size_type)
        .contains(TypeFlags::PRIMITIVE));
    // Type records are instances of the root type.
    assert_eq!(rt.type_of(rt.boot.array_type.0), root);
    assert_eq!(rt.type_instances(root), 8);
    assert_eq!(rt.dict_count(rt.dynamic_fields(root)), 11);
}

#[test]
fn test_setup_deterministic() {
    let rt1 = Runtime::setup_seeded(5);
    let rt2 = Runtime::setup_seeded(5);
    assert_eq!(rt1.boot.root_type.0, rt2.boot.root_type.0);
}

#[test]
fn test_types_are_self_describing() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    // Reading a type record through its own reflection.
    let size_field = rt.get_field(point.0, b"object_size").unwrap();
    assert_eq!(rt.read_size(size_field), 16);
    let offs_field = rt.get_field(point.0, b"offsets").unwrap();
    assert_eq!(rt.read_size(offs_field), 1);
}

#[test]
fn test_spot_and_field_roundtrip() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let p = rt.spot(point).unwrap();
    rt.protect(p);
    rt.prepare(p, point).unwrap();
    let x = rt.get_field(p, b"x").unwrap();
    let y = rt.get_field(p, b"y").unwrap();
    assert_eq!(x, rt.get_c_object(p));
    assert_eq!(y, rt.get_c_object(p).add(WORD));
    rt.write_size(x, 7);
    rt.write_size(y, 11);
    assert_eq!(rt.read_size(rt.get_field(p, b"x").unwrap()), 7);
    assert_eq!(rt.read_size(rt.get_field(p, b"y").unwrap()), 11);
    // Interior addresses resolve back to the instance and its field types.
    assert_eq!(rt.get_obj(y.add(3)), p);
    assert_eq!(rt.type_of(y.add(3)), rt.boot.size_type);
    assert_eq!(rt.type_of(p), point);
    // get_c_object is idempotent on data addresses.
    assert_eq!(rt.get_c_object(x), x);
}

#[test]
fn test_point_lifecycle() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let root = rt.boot.root_type;
    let baseline = rt.page_count();
    let p1 = rt.spot(point).unwrap();
    rt.protect(p1);
    let p2 = rt.spot(point).unwrap();
    rt.protect(p2);
    assert_ne!(p1, p2);
    assert_eq!(rt.type_instances(point), 2);
    rt.garbage_collect(root);
    assert_eq!(rt.type_instances(point), 2);
    rt.unprotect(p1);
    rt.garbage_collect(root);
    assert_eq!(rt.type_instances(point), 1);
    assert!(rt.is_referenced(p2));
    // The page survives while p2 lives on it.
    assert!(rt.page_count() > baseline);
    rt.unprotect(p2);
    rt.garbage_collect(root);
    assert_eq!(rt.type_instances(point), 0);
    assert_eq!(rt.page_count(), baseline);
}

#[test]
fn test_slot_reuse_after_release() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let p1 = rt.spot(point).unwrap();
    rt.protect(p1);
    let x = rt.get_field(p1, b"x").unwrap();
    rt.write_size(x, 99);
    rt.unprotect(p1);
    // The slot is handed out again, with its data reset.
    let p2 = rt.spot(point).unwrap();
    assert_eq!(p1, p2);
    assert_eq!(rt.read_size(rt.get_field(p2, b"x").unwrap()), 0);
}

#[test]
fn test_dependent_auto_inst() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let szt = rt.boot.size_type;
    let node = rt.create_type(0, 0, 16, TypeFlags::empty()).unwrap();
    rt.set_dynamic_field(
        node,
        point,
        b"pt",
        0,
        FieldFlags::DEPENDENT | FieldFlags::AUTO_INST,
    )
    .unwrap();
    rt.set_dynamic_field(node, szt, b"tag", 8, FieldFlags::empty())
        .unwrap();
    let root = rt.boot.root_type;
    let n = rt.spot(node).unwrap();
    rt.protect(n);
    rt.prepare(n, node).unwrap();
    let child = rt.get_field(n, b"pt").unwrap();
    assert!(!child.is_null());
    assert_eq!(rt.type_of(child), point);
    assert!(rt.is_referenced(child));
    rt.garbage_collect(root);
    assert_eq!(rt.type_instances(point), 1);
    // Releasing the holder reclaims the child with it.
    rt.unprotect(n);
    rt.garbage_collect(root);
    assert_eq!(rt.type_instances(node), 0);
    assert_eq!(rt.type_instances(point), 0);
}

#[test]
fn test_ownership_transfer() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let node = rt.create_type(0, 0, 8, TypeFlags::empty()).unwrap();
    rt.set_dynamic_field(node, point, b"pt", 0, FieldFlags::DEPENDENT)
        .unwrap();
    let n1 = rt.spot(node).unwrap();
    rt.protect(n1);
    rt.prepare(n1, node).unwrap();
    let n2 = rt.spot(node).unwrap();
    rt.protect(n2);
    rt.prepare(n2, node).unwrap();
    let child = rt.spot(point).unwrap();
    let f1 = rt.get_field(n1, b"pt").unwrap();
    assert_eq!(rt.attach_dependent(f1, child), Some(Obj::NULL));
    assert!(rt.is_referenced(child));
    assert_eq!(rt.get_field(n1, b"pt").unwrap(), child);
    // Attaching elsewhere transfers ownership; no double owner remains.
    let f2 = rt.get_field(n2, b"pt").unwrap();
    rt.attach_dependent(f2, child);
    assert_eq!(rt.read_word(f1), Obj::NULL);
    assert_eq!(rt.get_field(n2, b"pt").unwrap(), child);
    assert!(rt.is_referenced(child));
}

#[test]
fn test_detach_releases_child() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let node = rt.create_type(0, 0, 8, TypeFlags::empty()).unwrap();
    rt.set_dynamic_field(node, point, b"pt", 0, FieldFlags::DEPENDENT)
        .unwrap();
    let n = rt.spot(node).unwrap();
    rt.protect(n);
    rt.prepare(n, node).unwrap();
    let child = rt.spot(point).unwrap();
    let f = rt.get_field(n, b"pt").unwrap();
    rt.attach_dependent(f, child);
    assert_eq!(rt.detach_dependent(f), Some(child));
    assert_eq!(rt.read_word(f), Obj::NULL);
    assert!(!rt.is_referenced(child));
}

#[test]
#[should_panic(expected = "misbound")]
fn test_spot_dependent_through_plain_field_panics() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let p = rt.spot(point).unwrap();
    rt.protect(p);
    let x = rt.get_field(p, b"x").unwrap();
    let _ = rt.spot_dependent(x, point);
}

#[test]
fn test_array_resize() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let a = rt.spot_array(point, 4).unwrap();
    rt.protect(a);
    assert_eq!(rt.array_length(a), 4);
    for i in 0..4 {
        let e = rt.array_get(a, i);
        let data = rt.get_c_object(e);
        rt.write_size(data, i as u64 + 1);
    }
    assert_eq!(rt.array_find(a, rt.array_get(a, 3)), 3);
    // Resizing to the current length changes nothing.
    rt.resize_array(a, 4).unwrap();
    assert_eq!(rt.array_length(a), 4);
    assert_eq!(rt.read_size(rt.get_c_object(rt.array_get(a, 2))), 3);
    rt.resize_array(a, 2).unwrap();
    assert_eq!(rt.array_length(a), 2);
    rt.resize_array(a, 6).unwrap();
    assert_eq!(rt.array_length(a), 6);
    // Surviving elements keep their data; grown elements are zeroed.
    assert_eq!(rt.read_size(rt.get_c_object(rt.array_get(a, 0))), 1);
    assert_eq!(rt.read_size(rt.get_c_object(rt.array_get(a, 1))), 2);
    assert_eq!(rt.read_size(rt.get_c_object(rt.array_get(a, 2))), 0);
    assert_eq!(rt.read_size(rt.get_c_object(rt.array_get(a, 5))), 0);
}

#[test]
fn test_array_multi_part_growth() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let root = rt.boot.root_type;
    let baseline = rt.page_count();
    let a = rt.spot_array(point, 100).unwrap();
    rt.protect(a);
    rt.write_size(rt.get_c_object(rt.array_get(a, 0)), 42);
    // 400 elements no longer fit in one page: the array chains a new part.
    rt.resize_array(a, 400).unwrap();
    assert_eq!(rt.array_length(a), 400);
    assert!(rt.page_count() > baseline + 1);
    let last = rt.array_get(a, 399);
    rt.write_size(rt.get_c_object(last), 7);
    assert_eq!(rt.array_find(a, last), 399);
    assert_eq!(rt.read_size(rt.get_c_object(rt.array_get(a, 0))), 42);
    // Shrinking drops the chained part; collection reclaims its block.
    rt.resize_array(a, 50).unwrap();
    assert_eq!(rt.array_length(a), 50);
    rt.garbage_collect(root);
    assert_eq!(rt.page_count(), baseline + 1);
    assert_eq!(rt.read_size(rt.get_c_object(rt.array_get(a, 0))), 42);
    rt.unprotect(a);
    rt.garbage_collect(root);
    assert_eq!(rt.page_count(), baseline);
}

#[test]
fn test_unreferenced_multi_part_array_reclaimed() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let root = rt.boot.root_type;
    let baseline = rt.page_count();
    let a = rt.spot_array(point, 100).unwrap();
    rt.protect(a);
    rt.resize_array(a, 400).unwrap();
    assert!(rt.page_count() > baseline + 1);
    // Continuation parts resolve through the head even on a basic page;
    // when the head dies every chained block is reclaimed with it.
    rt.unprotect(a);
    rt.garbage_collect(root);
    assert_eq!(rt.page_count(), baseline);
}

#[test]
fn test_shrink_leaves_walkable_block() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let root = rt.boot.root_type;
    let baseline = rt.page_count();
    let a = rt.spot_array(point, 200).unwrap();
    rt.protect(a);
    rt.write_size(rt.get_c_object(rt.array_get(a, 0)), 5);
    // Shrinking far below capacity splits the spare bytes off as a free
    // part; the parts must still tile the block for the sweep that follows.
    rt.resize_array(a, 10).unwrap();
    assert_eq!(rt.array_length(a), 10);
    rt.garbage_collect(root);
    assert_eq!(rt.array_length(a), 10);
    assert_eq!(rt.read_size(rt.get_c_object(rt.array_get(a, 0))), 5);
    assert_eq!(rt.page_count(), baseline + 1);
    rt.unprotect(a);
    rt.garbage_collect(root);
    assert_eq!(rt.page_count(), baseline);
}

#[test]
fn test_array_element_reflection() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let a = rt.spot_array(point, 3).unwrap();
    rt.protect(a);
    let e = rt.array_get(a, 1);
    assert_eq!(rt.type_of(e), point);
    assert_eq!(rt.get_obj(rt.get_c_object(e).add(WORD)), e);
    assert_eq!(rt.type_of(rt.get_c_object(e).add(WORD)), rt.boot.size_type);
}

#[test]
fn test_dict_basics() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let d = rt.spot(rt.boot.dict_header_type).unwrap();
    rt.protect(d);
    let v = rt.spot(point).unwrap();
    rt.protect(v);
    // The empty key is a valid key, held in the header itself.
    rt.dict_set(d, b"", v).unwrap();
    assert_eq!(rt.dict_get(d, b""), Some(v));
    assert_eq!(rt.dict_count(d), 1);
    // "beta" first so inserting "alpha" exercises the ordered reinsertion.
    rt.dict_set(d, b"beta", v).unwrap();
    rt.dict_set(d, b"alpha", v).unwrap();
    rt.dict_set(d, b"alp", v).unwrap();
    assert_eq!(rt.dict_get(d, b"alpha"), Some(v));
    assert_eq!(rt.dict_get(d, b"alp"), Some(v));
    assert_eq!(rt.dict_get(d, b"al"), None);
    assert_eq!(rt.dict_get(d, b"alphas"), None);
    assert!(rt.dict_has(d, b"beta"));
    assert!(!rt.dict_has(d, b"gamma"));
    assert_eq!(rt.dict_count(d), 4);
    let keys = rt.dict_keys(d);
    let expect: Vec<Vec<u8>> = vec![
        b"".to_vec(),
        b"alp".to_vec(),
        b"alpha".to_vec(),
        b"beta".to_vec(),
    ];
    assert_eq!(keys, expect);
    // Binding null erases the key.
    rt.dict_set(d, b"alp", Obj::NULL).unwrap();
    assert_eq!(rt.dict_get(d, b"alp"), None);
    assert_eq!(rt.dict_count(d), 3);
    assert_eq!(rt.dict_get(d, b"alpha"), Some(v));
}

#[test]
fn test_dict_reclaimed_with_holder() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let root = rt.boot.root_type;
    let dbt_before = rt.type_instances(rt.boot.dict_block_type);
    let d = rt.spot(rt.boot.dict_header_type).unwrap();
    rt.protect(d);
    let v = rt.spot(point).unwrap();
    rt.protect(v);
    rt.dict_set(d, b"key", v).unwrap();
    assert!(rt.type_instances(rt.boot.dict_block_type) > dbt_before);
    rt.unprotect(d);
    rt.unprotect(v);
    rt.garbage_collect(root);
    assert_eq!(rt.type_instances(rt.boot.dict_block_type), dbt_before);
}

#[test]
fn test_weak_reference_pruning() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let szt = rt.boot.size_type;
    let holder = rt.create_type(0, 1, 8, TypeFlags::empty()).unwrap();
    rt.set_dynamic_field(holder, szt, b"target", 0, FieldFlags::REFERENCES)
        .unwrap();
    let target = rt.spot(point).unwrap();
    let h = rt.spot(holder).unwrap();
    rt.protect(h);
    rt.prepare(h, holder).unwrap();
    let f = rt.get_field(h, b"target").unwrap();
    rt.set_reference(f, target);
    // The target lives through the referencer alone.
    assert!(rt.is_referenced(target));
    assert_eq!(rt.get_field(h, b"target").unwrap(), target);
    // The holder dies; the edge is pruned and the target with it.
    rt.unprotect(h);
    assert!(!rt.is_referenced(target));
    let root = rt.boot.root_type;
    rt.garbage_collect(root);
    assert_eq!(rt.type_instances(point), 0);
    assert_eq!(rt.type_instances(holder), 0);
}

#[test]
fn test_clear_reference() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let szt = rt.boot.size_type;
    let holder = rt.create_type(0, 1, 8, TypeFlags::empty()).unwrap();
    rt.set_dynamic_field(holder, szt, b"target", 0, FieldFlags::REFERENCES)
        .unwrap();
    let target = rt.spot(point).unwrap();
    let h = rt.spot(holder).unwrap();
    rt.protect(h);
    rt.prepare(h, holder).unwrap();
    let f = rt.get_field(h, b"target").unwrap();
    rt.set_reference(f, target);
    assert!(rt.is_referenced(target));
    // The field handle dereferences once set; clear through the raw address.
    let raw = rt.get_c_object(h);
    rt.clear_reference(raw);
    assert!(!rt.is_referenced(target));
    assert_eq!(rt.read_word(raw), Obj::NULL);
}

#[test]
#[should_panic(expected = "referencer")]
fn test_referencer_credits_exhausted() {
    let mut rt = runtime();
    let szt = rt.boot.size_type;
    let t = rt.create_type(0, 0, 8, TypeFlags::empty()).unwrap();
    let _ = rt.set_dynamic_field(t, szt, b"r", 0, FieldFlags::REFERENCES);
}

#[test]
#[should_panic(expected = "nested-object")]
fn test_nested_slots_exhausted() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let t = rt.create_type(0, 0, 32, TypeFlags::empty()).unwrap();
    let _ = rt.set_dynamic_field(t, point, b"a", 0, FieldFlags::empty());
}

#[test]
fn test_nested_field_flattening() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let rect = rt.create_type(2, 0, 32, TypeFlags::empty()).unwrap();
    rt.set_dynamic_field(rect, point, b"a", 0, FieldFlags::empty())
        .unwrap();
    rt.set_dynamic_field(rect, point, b"b", 16, FieldFlags::empty())
        .unwrap();
    let r = rt.spot(rect).unwrap();
    rt.protect(r);
    rt.prepare(r, rect).unwrap();
    let ha = rt.get_field(r, b"a").unwrap();
    let hb = rt.get_field(r, b"b").unwrap();
    assert_eq!(rt.type_of(ha), point);
    assert_eq!(rt.type_of(hb), point);
    // Nested fields resolve relative to the nested object's data offset.
    let ax = rt.get_field(ha, b"x").unwrap();
    let by = rt.get_field(hb, b"y").unwrap();
    let data = rt.get_c_object(r);
    assert_eq!(ax, data);
    assert_eq!(by, data.add(24));
    rt.write_size(ax, 1);
    rt.write_size(by, 4);
    assert_eq!(rt.read_size(data), 1);
    assert_eq!(rt.read_size(data.add(24)), 4);
    // Flattened table B answers for interior bytes of the copy.
    assert_eq!(rt.type_of(data.add(19)), rt.boot.size_type);
}

#[test]
fn test_static_fields() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let origin = rt.spot(point).unwrap();
    rt.protect(origin);
    rt.set_static_field(point, b"origin", origin).unwrap();
    assert_eq!(rt.get_static_field(point, b"origin"), Some(origin));
    assert_eq!(rt.get_static_field(point, b"missing"), None);
}

#[test]
fn test_type_variants() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let other = point_type(&mut rt);
    let unit_x = rt.create_type_variant(point, &[(0, 1)]).unwrap();
    let diag = rt.create_type_variant(point, &[(0, 1), (8, 1)]).unwrap();
    let p = rt.spot(point).unwrap();
    rt.protect(p);
    rt.prepare(p, point).unwrap();
    rt.write_size(rt.get_field(p, b"x").unwrap(), 1);
    assert!(!rt.type_mismatch(point.0, p));
    assert!(!rt.type_mismatch(unit_x, p));
    // y is still zero, so the two-constraint variant rejects p.
    assert!(rt.type_mismatch(diag, p));
    rt.write_size(rt.get_field(p, b"y").unwrap(), 1);
    assert!(!rt.type_mismatch(diag, p));
    // An instance of another type never conforms, constraints or not.
    let q = rt.spot(other).unwrap();
    rt.protect(q);
    rt.prepare(q, other).unwrap();
    assert!(rt.type_mismatch(point.0, q));
    assert!(rt.type_mismatch(unit_x, q));
}

#[test]
fn test_variants_die_with_their_type() {
    let mut rt = runtime();
    let root = rt.boot.root_type;
    let szt = rt.boot.size_type;
    let art = rt.boot.array_type;
    let t = rt.create_type(0, 0, 8, TypeFlags::empty()).unwrap();
    rt.set_dynamic_field(t, szt, b"v", 0, FieldFlags::empty())
        .unwrap();
    let arts_before = rt.type_instances(art);
    let v1 = rt.create_type_variant(t, &[(0, 1)]).unwrap();
    let v2 = rt.create_type_variant(t, &[(0, 2)]).unwrap();
    assert!(rt.is_referenced(v1));
    assert!(rt.is_referenced(v2));
    assert_eq!(rt.type_instances(art), arts_before + 2);
    rt.unprotect(t.0);
    rt.garbage_collect(root);
    // The type's layout tables and both chained variants go with it.
    assert_eq!(rt.type_instances(root), 8);
    assert_eq!(rt.type_instances(art), arts_before - 2);
}

#[test]
fn test_client_data() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    assert_eq!(rt.client_data(point), Obj::NULL);
    rt.set_client_data(point, Obj(0xdead));
    assert_eq!(rt.client_data(point), Obj(0xdead));
}

#[test]
fn test_external_values_dropped_on_reclaim() {
    let mut rt = runtime();
    let szt = rt.boot.size_type;
    let t = rt.create_type(0, 0, 8, TypeFlags::empty()).unwrap();
    rt.set_dynamic_field(t, szt, b"blob", 0, FieldFlags::NEEDS_FREE)
        .unwrap();
    let root = rt.boot.root_type;
    let obj = rt.spot(t).unwrap();
    rt.protect(obj);
    rt.prepare(obj, t).unwrap();
    let key = rt.register_external(Box::new(String::from("payload")));
    let f = rt.get_field(obj, b"blob").unwrap();
    rt.write_size(f, key);
    assert!(rt.external(key).is_some());
    rt.unprotect(obj);
    rt.garbage_collect(root);
    assert!(rt.external(key).is_none());
}

#[test]
fn test_for_each_type() {
    let mut rt = runtime();
    let _point = point_type(&mut rt);
    let root = rt.boot.root_type;
    let mut n = 0;
    rt.for_each_type(root, |_, _| n += 1);
    assert_eq!(n, 9);
}

#[test]
fn test_remove_superfluous_pages() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let baseline = rt.page_count();
    let p = rt.spot(point).unwrap();
    assert!(rt.page_count() > baseline);
    assert!(!rt.is_referenced(p));
    rt.remove_superfluous_pages(point);
    assert_eq!(rt.page_count(), baseline);
}

#[test]
fn test_protect_is_idempotent_observably() {
    let mut rt = runtime();
    let point = point_type(&mut rt);
    let p = rt.spot(point).unwrap();
    assert!(rt.protect(p));
    assert!(rt.is_protected(p));
    // Pinning an already-pinned object reports it did nothing.
    assert!(!rt.protect(p));
    rt.unprotect(p);
    assert!(!rt.is_referenced(p));
}
