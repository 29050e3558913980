// Snapshot serialization: deterministic bytes, magic/size header, the
// structural decode, file round trips and root-object rejection.

mod common;

use common::{init_logging, TestFrontend};
use skizo_meta::{Field, PrimType, Registry, Signature, SpecialMethod, TypeRef, PTR_SIZE};
use skizo_runtime::thunks::word_from_i32;
use skizo_runtime::{
    catch_abort, snapshot_create, snapshot_load_from_file, snapshot_save_to_file, snapshot_to_tree,
    Domain, DomainCreation, SnapshotValue, SourceRef,
};

const LABEL_OFFSET: usize = PTR_SIZE;
const COUNT_OFFSET: usize = 2 * PTR_SIZE;

unsafe extern "C-unwind" fn item_label(args: *mut *mut u8) -> *mut u8 {
    *((*args).add(LABEL_OFFSET) as *const *mut u8)
}

unsafe extern "C-unwind" fn item_set_label(args: *mut *mut u8) -> *mut u8 {
    let receiver = *args;
    *(receiver.add(LABEL_OFFSET) as *mut *mut u8) = *args.add(1);
    std::ptr::null_mut()
}

unsafe extern "C-unwind" fn item_count(args: *mut *mut u8) -> *mut u8 {
    word_from_i32(*((*args).add(COUNT_OFFSET) as *const i32))
}

unsafe extern "C-unwind" fn item_set_count(args: *mut *mut u8) -> *mut u8 {
    let receiver = *args;
    *(receiver.add(COUNT_OFFSET) as *mut i32) = *args.add(1) as usize as i32;
    std::ptr::null_mut()
}

fn add_native(
    registry: &mut Registry,
    class: skizo_meta::ClassId,
    name: &str,
    sig: Signature,
    entry: &str,
) {
    let mid = registry.new_method(class, name, sig);
    registry.method_mut(mid).special = SpecialMethod::Native;
    registry.method_mut(mid).ecall.entry_point = Some(entry.into());
    registry.register_instance_method(class, mid);
}

fn build_item(registry: &mut Registry) {
    let string_ref = registry.class_ref(registry.string_class());
    let int_ref = registry.resolved_prim_ref(PrimType::Int);

    let item = registry.new_class("Item");
    registry.class_mut(item).instance_fields = vec![
        Field::new("m_label", string_ref.clone()),
        Field::new("m_count", TypeRef::prim(PrimType::Int)),
    ];

    add_native(
        registry,
        item,
        "label",
        Signature::new(vec![], string_ref.clone()),
        "_so_snap_Item_label",
    );
    add_native(
        registry,
        item,
        "setLabel",
        Signature::new(
            vec![skizo_meta::Param::new("value", string_ref)],
            TypeRef::void(),
        ),
        "_so_snap_Item_setLabel",
    );
    add_native(
        registry,
        item,
        "count",
        Signature::new(vec![], int_ref.clone()),
        "_so_snap_Item_count",
    );
    add_native(
        registry,
        item,
        "setCount",
        Signature::new(vec![skizo_meta::Param::new("value", int_ref)], TypeRef::void()),
        "_so_snap_Item_setCount",
    );
}

fn register_item_ecalls() {
    skizo_runtime::register_ecall("_so_snap_Item_label", item_label as usize);
    skizo_runtime::register_ecall("_so_snap_Item_setLabel", item_set_label as usize);
    skizo_runtime::register_ecall("_so_snap_Item_count", item_count as usize);
    skizo_runtime::register_ecall("_so_snap_Item_setCount", item_set_count as usize);
}

fn make_item(domain: &Domain, label: &str, count: i32) -> *mut u8 {
    let class = domain
        .registry()
        .borrow()
        .class_by_name("Item")
        .expect("Item");
    let obj = domain.create_object(class);
    let label_obj = domain.create_string(label);
    unsafe {
        *(obj.add(LABEL_OFFSET) as *mut *mut u8) = label_obj;
        *(obj.add(COUNT_OFFSET) as *mut i32) = count;
    }
    obj
}

#[test]
fn test_snapshot_bytes_and_tree() {
    init_logging();
    register_item_ecalls();
    let domain = Domain::create(
        DomainCreation::new("snapshot-domain", SourceRef::Text("".into())),
        &TestFrontend::new(build_item),
    )
    .expect("domain");

    let item = make_item(&domain, "widget", 5);
    let bytes = snapshot_create(&domain, item);

    // 4-byte size header counts every byte, magic follows.
    let declared = i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    assert_eq!(declared as usize, bytes.len());
    assert_eq!(&bytes[4..10], b"SNPSH1");

    // Serialization is deterministic: a second pass is bit-exact.
    assert_eq!(snapshot_create(&domain, item), bytes);

    let tree = snapshot_to_tree(&domain, &bytes).expect("decodes");
    assert_eq!(tree.class_name, "Item");
    assert_eq!(tree.properties.len(), 2);

    let (label_setter, label_value) = &tree.properties[0];
    assert_eq!(label_setter, "setLabel");
    match label_value {
        SnapshotValue::Object(node) => assert_eq!(node.class_name, "string"),
        other => panic!("unexpected label encoding: {:?}", other),
    }

    let (count_setter, count_value) = &tree.properties[1];
    assert_eq!(count_setter, "setCount");
    match count_value {
        SnapshotValue::Embedded { class_name, bytes } => {
            assert_eq!(class_name, "int");
            assert_eq!(bytes.as_slice(), &5i32.to_ne_bytes());
        }
        other => panic!("unexpected count encoding: {:?}", other),
    }

    domain.teardown();
    Domain::set_current(None);
}

#[test]
fn test_snapshot_rejects_bad_roots() {
    init_logging();
    register_item_ecalls();
    let domain = Domain::create(
        DomainCreation::new("snapshot-reject-domain", SourceRef::Text("".into())),
        &TestFrontend::new(build_item),
    )
    .expect("domain");

    let err = catch_abort(|| snapshot_create(&domain, std::ptr::null_mut())).unwrap_err();
    assert!(err.message.contains("not supported"));

    domain.teardown();
    Domain::set_current(None);
}

#[test]
fn test_snapshot_file_round_trip() {
    init_logging();
    register_item_ecalls();
    let dir = tempfile::tempdir().expect("tempdir");
    let domain = Domain::create(
        DomainCreation::new("snapshot-io-domain", SourceRef::Text("".into())),
        &TestFrontend::new(build_item),
    )
    .expect("domain");

    let item = make_item(&domain, "disk", 9);
    let bytes = snapshot_create(&domain, item);
    let path = dir.path().join("item.snapshot");
    let path_str = path.to_string_lossy().to_string();

    snapshot_save_to_file(&domain, &bytes, &path_str);
    let loaded = snapshot_load_from_file(&domain, &path_str);
    assert_eq!(loaded, bytes);

    // Corrupt magic is rejected before any allocation.
    std::fs::write(&path, b"XXXXXXXXXXXX").expect("write");
    let err = catch_abort(|| snapshot_load_from_file(&domain, &path_str)).unwrap_err();
    assert_eq!(err.message, "Corrupt snapshot.");

    domain.teardown();
    Domain::set_current(None);
}
