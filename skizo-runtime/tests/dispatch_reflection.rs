// Dispatch-layer behavior: interface method resolution and its cache,
// boxing round trips, dynamic invocation, event handler append/remove.

mod common;

use std::os::raw::c_void;

use common::{find_method, init_logging, TestFrontend};
use skizo_meta::{
    ClassFlags, Field, PrimType, Registry, Signature, SpecialClass, SpecialMethod, TypeRef,
    PTR_SIZE,
};
use skizo_runtime::helpers::{_soX_addhandler, _soX_findmethod, _soX_is, _soX_unbox, remove_handler};
use skizo_runtime::object::{boxed_data, so_virtmeth_of, EventHeader};
use skizo_runtime::thunks::word_from_i32;
use skizo_runtime::{catch_abort, invoke_dynamic, Domain, DomainCreation, SourceRef};

unsafe extern "C-unwind" fn impl_speak(_args: *mut *mut u8) -> *mut u8 {
    word_from_i32(123)
}

unsafe extern "C-unwind" fn gauge_level(args: *mut *mut u8) -> *mut u8 {
    word_from_i32(*((*args).add(PTR_SIZE) as *const i32))
}

fn build_dispatch_world(registry: &mut Registry) {
    let int_ref = registry.resolved_prim_ref(PrimType::Int);

    // A structural interface and an implementation.
    let talker = registry.new_class("Talker");
    registry.class_mut(talker).special = SpecialClass::Interface;
    registry.class_mut(talker).flags |= ClassFlags::ABSTRACT;
    let iface_speak = registry.new_method(talker, "speak", Signature::new(vec![], int_ref.clone()));
    registry.register_instance_method(talker, iface_speak);

    let imp = registry.new_class("Impl");
    registry.class_mut(imp).interfaces = vec![TypeRef::object("Talker")];
    let speak = registry.new_method(imp, "speak", Signature::new(vec![], int_ref.clone()));
    registry.method_mut(speak).special = SpecialMethod::Native;
    registry.method_mut(speak).ecall.entry_point = Some("_so_disp_Impl_speak".into());
    registry.register_instance_method(imp, speak);

    // A class with a property-like getter for dynamic invocation.
    let gauge = registry.new_class("Gauge");
    registry.class_mut(gauge).instance_fields =
        vec![Field::new("m_level", TypeRef::prim(PrimType::Int))];
    let level = registry.new_method(gauge, "level", Signature::new(vec![], int_ref.clone()));
    registry.method_mut(level).special = SpecialMethod::Native;
    registry.method_mut(level).ecall.entry_point = Some("_so_disp_Gauge_level".into());
    registry.register_instance_method(gauge, level);

    // A method class and a concrete handler for the event tests.
    let method_class = registry.new_class("0Method_handler");
    registry.class_mut(method_class).special = SpecialClass::MethodClass;
    let invoke = registry.new_method(method_class, "invoke", Signature::new(vec![], TypeRef::void()));
    registry.register_instance_method(method_class, invoke);
    registry.class_mut(method_class).invoke_method = Some(invoke);

    let handler = registry.new_class("0Closure_handler");
    registry.class_mut(handler).base = Some(TypeRef::object("0Method_handler"));

    let event_class = registry.new_class("0Event_handler");
    registry.class_mut(event_class).special = SpecialClass::EventClass;
    registry.class_mut(event_class).wrapped = Some(TypeRef::object("0Method_handler"));
    registry.class_mut(event_class).instance_fields =
        vec![Field::new("m_array", TypeRef::object("0Method_handler"))];
}

fn make_domain(name: &str) -> std::rc::Rc<Domain> {
    skizo_runtime::register_ecall("_so_disp_Impl_speak", impl_speak as usize);
    skizo_runtime::register_ecall("_so_disp_Gauge_level", gauge_level as usize);
    Domain::create(
        DomainCreation::new(name, SourceRef::Text("".into())),
        &TestFrontend::new(build_dispatch_world),
    )
    .expect("domain")
}

#[test]
fn test_findmethod_cache_matches_vtable() {
    init_logging();
    let domain = make_domain("dispatch-domain");

    let imp = domain.registry().borrow().class_by_name("Impl").expect("Impl");
    let obj = domain.create_object(imp);
    let iface_speak = find_method(&domain, "Talker", "speak");
    let impl_speak_id = find_method(&domain, "Impl", "speak");

    let (iface_ptr, vtable_index) = {
        let registry = domain.registry().borrow();
        (
            registry.method_ptr(iface_speak) as usize,
            registry.method(impl_speak_id).vtable_index(),
        )
    };

    let resolved = unsafe { _soX_findmethod(obj as *mut c_void, iface_ptr as *mut c_void) };
    let direct = unsafe { so_virtmeth_of(obj, vtable_index) };
    // The cached code pointer equals the vtable entry a name+signature
    // search would find.
    assert_eq!(resolved as usize, direct);
    let cached = domain
        .registry()
        .borrow()
        .class(imp)
        .cached_iface_ptr(iface_speak);
    assert_eq!(cached, Some(direct));

    domain.teardown();
    Domain::set_current(None);
}

#[test]
fn test_boxing_round_trip_preserves_bytes() {
    init_logging();
    let domain = make_domain("boxing-domain");

    let (int_class, boxed_class) = {
        let mut registry = domain.registry().borrow_mut();
        let int_ref = registry.resolved_prim_ref(PrimType::Int);
        let boxed = registry.boxed_class(&int_ref, false).expect("boxed int");
        (int_ref.resolved.expect("int"), boxed)
    };

    let boxed = domain.box_value(boxed_class, &0x2A_i32.to_ne_bytes());
    unsafe {
        assert_eq!(*(boxed_data(boxed) as *const i32), 0x2A);
    }

    // `is` delegates to the wrapped class for boxed instances.
    let int_ptr = domain.registry().borrow().class_ptr(int_class);
    assert_eq!(
        unsafe { _soX_is(boxed as *mut c_void, int_ptr as *mut c_void) },
        1
    );

    // Unboxing yields the original bytes.
    let mut out = 0i32;
    unsafe {
        _soX_unbox(
            &mut out as *mut i32 as *mut c_void,
            4,
            int_ptr as *mut c_void,
            boxed as *mut c_void,
        );
    }
    assert_eq!(out, 0x2A);

    // Unboxing into the wrong value type aborts.
    let bool_ptr = {
        let registry = domain.registry().borrow();
        registry.class_ptr(registry.prim_class(PrimType::Bool))
    };
    let err = catch_abort(|| unsafe {
        let mut sink = 0i32;
        _soX_unbox(
            &mut sink as *mut i32 as *mut c_void,
            4,
            bool_ptr as *mut c_void,
            boxed as *mut c_void,
        );
    })
    .unwrap_err();
    assert!(err.message.contains("not a boxed"));

    domain.teardown();
    Domain::set_current(None);
}

#[test]
fn test_invoke_dynamic_boxes_primitive_results() {
    init_logging();
    let domain = make_domain("invoke-domain");

    let gauge = domain.registry().borrow().class_by_name("Gauge").expect("Gauge");
    let obj = domain.create_object(gauge);
    unsafe {
        *(obj.add(PTR_SIZE) as *mut i32) = 77;
    }

    let level = find_method(&domain, "Gauge", "level");
    let result = invoke_dynamic(&domain, level, obj, std::ptr::null_mut());
    // The primitive result arrives boxed.
    unsafe {
        let class = skizo_runtime::so_class_of(result);
        assert_eq!(class.special, SpecialClass::Boxed);
        assert_eq!(*(boxed_data(result) as *const i32), 77);
    }

    domain.teardown();
    Domain::set_current(None);
}

#[test]
fn test_event_append_then_remove_restores_state() {
    init_logging();
    let domain = make_domain("event-domain");

    let (event_class, handler_class) = {
        let registry = domain.registry().borrow();
        (
            registry.class_by_name("0Event_handler").expect("event"),
            registry.class_by_name("0Closure_handler").expect("handler"),
        )
    };
    let event = domain.create_object(event_class) as *mut EventHeader;
    let first = domain.create_object(handler_class);
    let second = domain.create_object(handler_class);

    unsafe {
        _soX_addhandler(event as *mut c_void, first as *mut c_void);
        let after_first = (*event).handlers;
        assert_eq!((*after_first).length, 1);

        _soX_addhandler(event as *mut c_void, second as *mut c_void);
        assert_eq!((*(*event).handlers).length, 2);

        // Removing the handler just appended restores the prior state.
        remove_handler(event, second);
        assert_eq!((*(*event).handlers).length, 1);
        let data = skizo_runtime::object::array_data((*event).handlers as *mut u8) as *const usize;
        assert_eq!(*data, first as usize);

        remove_handler(event, first);
        assert!((*event).handlers.is_null());

        // Null handlers are rejected.
        let err = catch_abort(|| _soX_addhandler(event as *mut c_void, std::ptr::null_mut()))
            .unwrap_err();
        assert_eq!(err.code, Some(skizo_diagnostics::ErrorCode::NullDereference));
    }

    domain.teardown();
    Domain::set_current(None);
}
