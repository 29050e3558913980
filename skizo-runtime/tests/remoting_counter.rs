// Cross-domain remoting: a server domain exports `counter`; a client
// domain drives it through a foreign proxy with synchronous calls.

mod common;

use std::rc::Rc;
use std::time::Duration;

use common::{init_logging, TestFrontend};
use skizo_meta::{Field, PrimType, Registry, Signature, SpecialMethod, TypeRef, PTR_SIZE};
use skizo_runtime::thunks::{word_from_i32, word_to_i32};
use skizo_runtime::{invoke_raw, spawn_domain, Domain, DomainCreation, SourceRef};

// Counter layout: vtable word, then the i32 count.
const COUNT_OFFSET: usize = PTR_SIZE;

unsafe extern "C-unwind" fn counter_inc(args: *mut *mut u8) -> *mut u8 {
    let receiver = *args;
    let count = receiver.add(COUNT_OFFSET) as *mut i32;
    *count += 1;
    std::ptr::null_mut()
}

unsafe extern "C-unwind" fn counter_value(args: *mut *mut u8) -> *mut u8 {
    let receiver = *args;
    word_from_i32(*(receiver.add(COUNT_OFFSET) as *const i32))
}

unsafe extern "C-unwind" fn server_main(_args: *mut *mut u8) -> *mut u8 {
    // 1000 incs and one value read.
    Domain::current().serve_messages(1001);
    std::ptr::null_mut()
}

fn build_counter_class(registry: &mut Registry) {
    let counter = registry.new_class("Counter");
    registry.class_mut(counter).instance_fields =
        vec![Field::new("count", TypeRef::prim(PrimType::Int))];

    let inc = registry.new_method(counter, "inc", Signature::new(vec![], TypeRef::void()));
    registry.method_mut(inc).special = SpecialMethod::Native;
    registry.method_mut(inc).ecall.entry_point = Some("_so_Counter_inc".into());
    registry.register_instance_method(counter, inc);

    let value = registry.new_method(
        counter,
        "value",
        Signature::new(vec![], registry.resolved_prim_ref(PrimType::Int)),
    );
    registry.method_mut(value).special = SpecialMethod::Native;
    registry.method_mut(value).ecall.entry_point = Some("_so_Counter_value".into());
    registry.register_instance_method(counter, value);
}

fn build_server(registry: &mut Registry) {
    build_counter_class(registry);

    let program = registry.new_class("Program");
    let main = registry.new_method(program, "main", Signature::statik(vec![], TypeRef::void()));
    registry.method_mut(main).special = SpecialMethod::Native;
    registry.method_mut(main).ecall.entry_point = Some("_so_CounterProgram_main".into());
    registry.register_static_method(program, main);
}

fn bind_server(domain: &Rc<Domain>) {
    let counter_class = domain
        .registry()
        .borrow()
        .class_by_name("Counter")
        .expect("Counter registered");
    let counter = domain.create_object(counter_class);
    domain.export_object("counter", counter);
}

fn build_client(registry: &mut Registry) {
    build_counter_class(registry);
    // Resolving `Counter*` synthesizes the foreign proxy with sync stubs.
    let mut proxy_ref = TypeRef::foreign_of(TypeRef::object("Counter"));
    registry
        .resolve_type_ref(&mut proxy_ref)
        .expect("foreign proxy resolves");
}

#[test]
fn test_synchronous_counter_calls_in_order() {
    init_logging();
    skizo_runtime::register_ecall("_so_Counter_inc", counter_inc as usize);
    skizo_runtime::register_ecall("_so_Counter_value", counter_value as usize);
    skizo_runtime::register_ecall("_so_CounterProgram_main", server_main as usize);

    let handle = spawn_domain(
        DomainCreation::new("counter-server", SourceRef::Text("".into())),
        TestFrontend::with_bind(build_server, bind_server),
    );

    let client = Domain::create(
        DomainCreation::new("counter-client", SourceRef::Text("".into())),
        &TestFrontend::new(build_client),
    )
    .expect("client domain");

    let (foreign_class, inc, value) = {
        let registry = client.registry().borrow();
        let counter = registry.class_by_name("Counter").expect("Counter");
        let foreign = registry.foreign_proxy_for(counter).expect("proxy class");
        let inc = registry
            .instance_method_by_name(foreign, "inc")
            .expect("proxy inc");
        let value = registry
            .instance_method_by_name(foreign, "value")
            .expect("proxy value");
        (foreign, inc, value)
    };

    let proxy = client.import_object(foreign_class, handle.clone(), "counter");

    for _ in 0..1000 {
        let mut words = vec![proxy];
        invoke_raw(&client, inc, &mut words);
    }
    let mut words = vec![proxy];
    let observed = word_to_i32(invoke_raw(&client, value, &mut words));
    // Calls are processed in issue order, so the read observes every inc.
    assert_eq!(observed, 1000);

    assert!(handle.wait(Some(Duration::from_secs(30))));
    handle.join();
    client.teardown();
    Domain::set_current(None);
}
