// Domain-level scenarios: abort propagation, `Domain.try`, guarded
// division, security sandboxing, static-constructor failures.

mod common;

use common::{init_logging, TestFrontend};
use skizo_diagnostics::ErrorCode;
use skizo_meta::{Registry, Signature, SpecialMethod, TypeRef};
use skizo_runtime::helpers::{_so_int_op_divide, _soX_checktype};
use skizo_runtime::{
    catch_abort, run_string, run_string_untrusted, Domain, DomainCreation, SourceRef,
    FILE_IO_PERMISSION,
};

unsafe extern "C-unwind" fn dividing_main(_args: *mut *mut u8) -> *mut u8 {
    let _ = _so_int_op_divide(5, 0);
    std::ptr::null_mut()
}

fn build_dividing_program(registry: &mut Registry) {
    let program = registry.new_class("Program");
    let main = registry.new_method(program, "main", Signature::statik(vec![], TypeRef::void()));
    registry.method_mut(main).special = SpecialMethod::Native;
    registry.method_mut(main).ecall.entry_point = Some("_so_DivProgram_main".into());
    registry.register_static_method(program, main);
}

#[test]
fn test_division_by_zero_aborts_domain() {
    init_logging();
    skizo_runtime::register_ecall("_so_DivProgram_main", dividing_main as usize);
    let err = run_string(
        "div-domain",
        "class Program { static main() { (5 / 0).toString; } }",
        &[],
        &TestFrontend::new(build_dividing_program),
    )
    .unwrap_err();
    assert!(err.to_string().contains("Division by zero."));
}

fn empty_build(_registry: &mut Registry) {}

fn build_try_class(registry: &mut Registry) {
    let class = registry.new_class("Worker");
    let step = registry.new_method(class, "step", Signature::new(vec![], TypeRef::void()));
    registry.register_instance_method(class, step);
}

#[test]
fn test_domain_try_restores_virtual_stacks() {
    init_logging();
    let domain = Domain::create(
        DomainCreation::new("try-domain", SourceRef::Text("".into())),
        &TestFrontend::new(build_try_class),
    )
    .expect("domain");
    let step = common::find_method(&domain, "Worker", "step");

    // A frame pushed inside the guarded section is left behind by the
    // abort and must be rolled back by the virtual unwinder.
    let result = domain.try_run(|| {
        domain.push_frame(step);
        skizo_runtime::abort_with_message("boom");
    });
    let message = result.unwrap_err();
    assert!(message.starts_with("boom"));
    assert!(message.contains("Worker::step"));
    assert_eq!(domain.frame_depth(), 0);

    // A successful action passes its value through.
    assert_eq!(domain.try_run(|| 7).unwrap_or(0), 7);

    domain.teardown();
    Domain::set_current(None);
}

#[test]
fn test_untrusted_current_directory_demands_permission() {
    init_logging();
    let secure_root = tempfile::tempdir().unwrap();
    skizo_runtime::init_security(Some(secure_root.path().to_path_buf()));

    // Without FileIOPermission: denied.
    {
        let creation =
            DomainCreation::new("untrusted-no-io", SourceRef::Text("".into())).untrusted();
        let domain = Domain::create(creation, &TestFrontend::new(empty_build)).expect("domain");
        let err = catch_abort(|| domain.security().borrow().current_directory()).unwrap_err();
        assert_eq!(err.message, "Code access denied.");
        domain.teardown();
        Domain::set_current(None);
    }

    // With the permission granted: a directory under the secure root.
    {
        let creation = DomainCreation::new("untrusted-io", SourceRef::Text("".into()))
            .untrusted()
            .with_permission(FILE_IO_PERMISSION);
        let domain = Domain::create(creation, &TestFrontend::new(empty_build)).expect("domain");
        let dir = catch_abort(|| domain.security().borrow().current_directory()).unwrap();
        assert!(dir.starts_with(secure_root.path()));
        assert!(dir.is_dir());
        domain.teardown();
        assert!(!dir.exists());
        Domain::set_current(None);
    }
}

#[test]
fn test_untrusted_spawn_cannot_alter_permissions() {
    init_logging();
    let creation = DomainCreation::new("untrusted-parent", SourceRef::Text("".into()))
        .untrusted()
        .with_permission("DomainCreationPermission");
    let parent = Domain::create(creation, &TestFrontend::new(empty_build)).expect("domain");

    let child_creation = DomainCreation::new("child", SourceRef::Text("".into()))
        .with_permission("FileIOPermission");
    let err = catch_abort(|| {
        parent.create_child_domain(child_creation, TestFrontend::new(empty_build))
    })
    .unwrap_err();
    assert_eq!(
        err.message,
        "Untrusted domains aren't allowed to spawn new domains with altered permission sets."
    );

    parent.teardown();
    Domain::set_current(None);
}

#[test]
fn test_run_string_untrusted_sets_flag() {
    init_logging();
    skizo_runtime::register_ecall("_so_FlagProgram_main", flag_main as usize);
    FLAG_WAS_TRUSTED.store(true, std::sync::atomic::Ordering::SeqCst);
    run_string_untrusted(
        "flag-domain",
        "class Program { static main() {} }",
        &[],
        &TestFrontend::new(build_flag_program),
    )
    .expect("runs");
    assert!(!FLAG_WAS_TRUSTED.load(std::sync::atomic::Ordering::SeqCst));
}

static FLAG_WAS_TRUSTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

unsafe extern "C-unwind" fn flag_main(_args: *mut *mut u8) -> *mut u8 {
    FLAG_WAS_TRUSTED.store(
        Domain::current().is_trusted(),
        std::sync::atomic::Ordering::SeqCst,
    );
    std::ptr::null_mut()
}

fn build_flag_program(registry: &mut Registry) {
    let program = registry.new_class("Program");
    let main = registry.new_method(program, "main", Signature::statik(vec![], TypeRef::void()));
    registry.method_mut(main).special = SpecialMethod::Native;
    registry.method_mut(main).ecall.entry_point = Some("_so_FlagProgram_main".into());
    registry.register_static_method(program, main);
}

unsafe extern "C-unwind" fn failing_cctor(_args: *mut *mut u8) -> *mut u8 {
    skizo_runtime::abort_with_message("static ctor failed");
}

fn build_cctor_class(registry: &mut Registry) {
    let holder = registry.new_class("Holder");
    let cctor = registry.new_method(holder, "_soX_cctor", Signature::statik(vec![], TypeRef::void()));
    registry.method_mut(cctor).special = SpecialMethod::Native;
    registry.method_mut(cctor).ecall.entry_point = Some("_so_Holder_cctor".into());
    registry.class_mut(holder).static_ctor = Some(cctor);
}

#[test]
fn test_static_ctor_abort_marks_type_uninitialized() {
    init_logging();
    skizo_runtime::register_ecall("_so_Holder_cctor", failing_cctor as usize);
    let domain = Domain::create(
        DomainCreation::new("cctor-domain", SourceRef::Text("".into())),
        &TestFrontend::new(build_cctor_class),
    )
    .expect("domain");

    let holder = domain
        .registry()
        .borrow()
        .class_by_name("Holder")
        .expect("Holder");
    domain.run_static_ctor(holder);

    // The abort cleared the initialized flag.
    assert!(!domain.registry().borrow().class(holder).is_initialized());

    // Checked accesses now raise the type-initialization error.
    let class_ptr = domain.registry().borrow().class_ptr(holder);
    let err = catch_abort(|| unsafe {
        _soX_checktype(class_ptr as *mut std::os::raw::c_void);
    })
    .unwrap_err();
    assert_eq!(err.code, Some(ErrorCode::TypeInitializationError));

    domain.teardown();
    Domain::set_current(None);
}
