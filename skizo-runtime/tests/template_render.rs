// Template rendering against live objects, including the `get`-with-
// argument fast path and the wrong-class abort.

mod common;

use common::{init_logging, TestFrontend};
use skizo_meta::{Field, PrimType, Registry, Signature, SpecialMethod, TypeRef, PTR_SIZE};
use skizo_runtime::thunks::word_from_i32;
use skizo_runtime::{catch_abort, template_for_class, Domain, DomainCreation, SourceRef};

// Person layout: vtable, name (string ref), age (i32).
const NAME_OFFSET: usize = PTR_SIZE;
const AGE_OFFSET: usize = 2 * PTR_SIZE;

unsafe extern "C-unwind" fn person_name(args: *mut *mut u8) -> *mut u8 {
    let receiver = *args;
    *(receiver.add(NAME_OFFSET) as *const *mut u8)
}

unsafe extern "C-unwind" fn person_age(args: *mut *mut u8) -> *mut u8 {
    let receiver = *args;
    word_from_i32(*(receiver.add(AGE_OFFSET) as *const i32))
}

/// `int::toString`: the receiver arrives as a pointer to the value.
unsafe extern "C-unwind" fn int_to_string(args: *mut *mut u8) -> *mut u8 {
    let value = *(*args as *const i32);
    Domain::current().create_string(&value.to_string())
}

fn build_person(registry: &mut Registry) {
    let string_ref = registry.class_ref(registry.string_class());
    let int_ref = registry.resolved_prim_ref(PrimType::Int);

    let int_class = registry.prim_class(PrimType::Int);
    let to_string = registry.new_method(int_class, "toString", Signature::new(vec![], string_ref.clone()));
    registry.method_mut(to_string).special = SpecialMethod::Native;
    registry.method_mut(to_string).ecall.entry_point = Some("_so_tmpl_int_toString".into());
    registry.register_instance_method(int_class, to_string);

    let person = registry.new_class("Person");
    registry.class_mut(person).instance_fields = vec![
        Field::new("m_name", string_ref.clone()),
        Field::new("m_age", TypeRef::prim(PrimType::Int)),
    ];

    let name = registry.new_method(person, "name", Signature::new(vec![], string_ref));
    registry.method_mut(name).special = SpecialMethod::Native;
    registry.method_mut(name).ecall.entry_point = Some("_so_tmpl_Person_name".into());
    registry.register_instance_method(person, name);

    let age = registry.new_method(person, "age", Signature::new(vec![], int_ref));
    registry.method_mut(age).special = SpecialMethod::Native;
    registry.method_mut(age).ecall.entry_point = Some("_so_tmpl_Person_age".into());
    registry.register_instance_method(person, age);

    // A second renderable class for the wrong-type check.
    registry.new_class("Stranger");
}

fn make_person(domain: &Domain, name: &str, age: i32) -> *mut u8 {
    let person_class = domain
        .registry()
        .borrow()
        .class_by_name("Person")
        .expect("Person");
    let obj = domain.create_object(person_class);
    let name_obj = domain.create_string(name);
    unsafe {
        *(obj.add(NAME_OFFSET) as *mut *mut u8) = name_obj;
        *(obj.add(AGE_OFFSET) as *mut i32) = age;
    }
    obj
}

#[test]
fn test_template_renders_properties() {
    init_logging();
    skizo_runtime::register_ecall("_so_tmpl_int_toString", int_to_string as usize);
    skizo_runtime::register_ecall("_so_tmpl_Person_name", person_name as usize);
    skizo_runtime::register_ecall("_so_tmpl_Person_age", person_age as usize);

    let domain = Domain::create(
        DomainCreation::new("template-domain", SourceRef::Text("".into())),
        &TestFrontend::new(build_person),
    )
    .expect("domain");

    let person_class = domain
        .registry()
        .borrow()
        .class_by_name("Person")
        .expect("Person");
    let template = template_for_class(&domain, "{name} is {age}", person_class);

    let person = make_person(&domain, "A", 3);
    assert_eq!(template.render(&domain, person), "A is 3");

    // Rendering twice reuses the cached toString resolution.
    let other = make_person(&domain, "B", 41);
    assert_eq!(template.render(&domain, other), "B is 41");

    // An object of a different class aborts.
    let stranger_class = domain
        .registry()
        .borrow()
        .class_by_name("Stranger")
        .expect("Stranger");
    let stranger = domain.create_object(stranger_class);
    let err = catch_abort(|| template.render(&domain, stranger)).unwrap_err();
    assert_eq!(err.message, "The rendered object is of a wrong type.");

    domain.teardown();
    Domain::set_current(None);
}

#[test]
fn test_template_parse_errors() {
    init_logging();
    let domain = Domain::create(
        DomainCreation::new("template-err-domain", SourceRef::Text("".into())),
        &TestFrontend::new(build_person),
    )
    .expect("domain");
    let person_class = domain
        .registry()
        .borrow()
        .class_by_name("Person")
        .expect("Person");

    let err = catch_abort(|| template_for_class(&domain, "{}", person_class)).unwrap_err();
    assert_eq!(err.message, "Empty placeholder not allowed.");

    let err = catch_abort(|| template_for_class(&domain, "{name {age}}", person_class)).unwrap_err();
    assert_eq!(err.message, "nested '{' not allowed");

    let err = catch_abort(|| template_for_class(&domain, "{ghost}", person_class)).unwrap_err();
    assert_eq!(err.message, "Unknown method.");

    domain.teardown();
    Domain::set_current(None);
}
