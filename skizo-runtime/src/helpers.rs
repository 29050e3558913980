// Runtime helpers invoked by emitted code. Precompiled on the host side,
// they remove compilation load from the embedded C backend and are the only
// way generated code transitions back into the runtime.

#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

use std::os::raw::c_void;
use std::sync::Arc;

use skizo_diagnostics::ErrorCode;
use skizo_meta::{Class, Method, PrimType, SpecialClass};

use crate::abort::{abort_with_code, abort_with_message};
use crate::domain::Domain;
use crate::object::{
    boxed_data, so_class_of, so_virtmeth_of, ArrayHeader, EventHeader, GcPtr, StringHeader,
};
use crate::remoting::DomainMessage;
use crate::strings::sostr_clone_raw;

/// Stack bigger than this is treated as an overflow, leaving room for the
/// abort/trace machinery to run.
const STACK_LIMIT_BYTES: usize = 900 * 1024;

unsafe fn class_ref<'a>(ptr: *mut c_void) -> &'a Class {
    &*(ptr as *const Class)
}

unsafe fn method_ref<'a>(ptr: *mut c_void) -> &'a Method {
    &*(ptr as *const Method)
}

// ----------------------------------------------------------------------
// Allocation.
// ----------------------------------------------------------------------

/// The memory-manager pointer is inlined into emitted code; the domain is
/// re-derived from the thread so collection can gather the full root set.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_gc_alloc(
    _mm: *mut c_void,
    sz: i32,
    vtable: *mut *mut c_void,
) -> *mut c_void {
    let domain = Domain::current();
    domain.gc_alloc(sz as usize, vtable as usize) as *mut c_void
}

/// Specialized allocator for closure environments; the vtable is built on
/// demand by the thunk manager.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_gc_alloc_env(_mm: *mut c_void, obj_class: *mut c_void) -> *mut c_void {
    let domain = Domain::current();
    let class = class_ref(obj_class);
    let size = class.gc.content_size;
    let vtable = domain.ensure_vtable(class.id);
    domain.gc_alloc(size, vtable) as *mut c_void
}

/// Registers static-variable locations as GC roots. The items are
/// references to variable slots, not the values inside them.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_gc_roots(_mm: *mut c_void, root_refs: *mut *mut c_void, count: i32) {
    let domain = Domain::current();
    let slots: Vec<usize> = (0..count as usize)
        .map(|i| root_refs.add(i) as usize)
        .collect();
    domain.memory_manager().borrow_mut().add_root_slots(&slots);
}

/// Roots every heap reference inside a static value-type variable.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_static_vt(_mm: *mut c_void, obj: *mut c_void, obj_class: *mut c_void) {
    let domain = Domain::current();
    let class = class_ref(obj_class);
    let base = obj as usize;
    let slots: Vec<usize> = class.gc.map.iter().map(|&off| base + off).collect();
    domain.memory_manager().borrow_mut().add_root_slots(&slots);
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_newarray(
    _domain: *mut c_void,
    array_length: i32,
    vtable: *mut *mut c_void,
) -> *mut c_void {
    let domain = Domain::current();
    let class: &Class = &*(*(vtable as *const *const Class));
    domain.create_array(class.id, array_length) as *mut c_void
}

// ----------------------------------------------------------------------
// VTable registration & string literals.
// ----------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_regvtable(klass: *mut c_void, vtable: *mut *mut c_void) {
    let class = class_ref(klass);
    // Slot 0 carries the class metadata for `so_class_of`.
    *(vtable as *mut usize) = klass as usize;
    class.set_vtable(vtable as usize);
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_patchstrings() {
    Domain::current().patch_string_literals();
}

// ----------------------------------------------------------------------
// Type checks, casts, unboxing.
// ----------------------------------------------------------------------

unsafe fn dynamic_class_for_check<'a>(obj: GcPtr) -> &'a Class {
    let class = so_class_of(obj);
    if class.special == SpecialClass::Boxed {
        // Boxed objects report their wrapped value type.
        if let Some(wrapped) = class.wrapped.as_ref().and_then(|w| w.resolved) {
            let domain = Domain::current();
            let registry = domain.registry().borrow();
            return &*(registry.class_ptr(wrapped));
        }
    }
    class
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_downcast(target_class: *mut c_void, objptr: *mut c_void) -> *mut c_void {
    if objptr.is_null() {
        return objptr;
    }
    let target = class_ref(target_class);
    let dynamic = dynamic_class_for_check(objptr as GcPtr);
    let domain = Domain::current();
    let assignable = domain
        .registry()
        .borrow()
        .is_assignable(dynamic.id, target.id);
    if !assignable {
        abort_with_message(format!(
            "Cannot cast an instance of `{}` to `{}`.",
            dynamic.flat_name, target.flat_name
        ));
    }
    objptr
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_is(obj: *mut c_void, type_: *mut c_void) -> i32 {
    if obj.is_null() {
        return 0;
    }
    let target = class_ref(type_);
    let dynamic = dynamic_class_for_check(obj as GcPtr);
    let domain = Domain::current();
    let assignable = domain
        .registry()
        .borrow()
        .is_assignable(dynamic.id, target.id);
    assignable as i32
}

/// Copies the wrapped value out of a boxed object. Aborts when the object
/// does not box the expected value type.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_unbox(
    vt: *mut c_void,
    vt_size: i32,
    vt_class: *mut c_void,
    intrfc_obj: *mut c_void,
) {
    if intrfc_obj.is_null() {
        abort_with_code(ErrorCode::NullDereference);
    }
    let expected = class_ref(vt_class);
    let class = so_class_of(intrfc_obj as GcPtr);
    let wrapped = class.wrapped.as_ref().and_then(|w| w.resolved);
    if class.special != SpecialClass::Boxed || wrapped != Some(expected.id) {
        abort_with_message(format!(
            "Object is not a boxed `{}`.",
            expected.flat_name
        ));
    }
    std::ptr::copy_nonoverlapping(
        boxed_data(intrfc_obj as GcPtr),
        vt as *mut u8,
        vt_size as usize,
    );
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_biteq(a: *mut c_void, b: *mut c_void, sz: i32) -> i32 {
    let a = std::slice::from_raw_parts(a as *const u8, sz as usize);
    let b = std::slice::from_raw_parts(b as *const u8, sz as usize);
    (a == b) as i32
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_zero(a: *mut c_void, sz: i32) {
    std::ptr::write_bytes(a as *mut u8, 0, sz as usize);
}

// ----------------------------------------------------------------------
// Interface dispatch.
// ----------------------------------------------------------------------

/// The driving force behind interface calls: resolves the receiver's
/// implementation of an interface method, verifying the signature, and
/// fills the per-class cache.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_findmethod(objptr: *mut c_void, p_method: *mut c_void) -> *mut c_void {
    if objptr.is_null() {
        abort_with_code(ErrorCode::NullDereference);
    }
    let iface_method = method_ref(p_method);
    let class = so_class_of(objptr as GcPtr);

    if let Some(cached) = class.cached_iface_ptr(iface_method.id) {
        return cached as *mut c_void;
    }

    let domain = Domain::current();
    let registry = domain.registry().borrow();
    let instance_method = registry
        .instance_method_by_name(class.id, &iface_method.name)
        .unwrap_or_else(|| {
            abort_with_message(format!(
                "`{}` has no method `{}`.",
                class.flat_name, iface_method.name
            ))
        });
    let found = registry.method(instance_method);
    if !found.sig.matches(&iface_method.sig) {
        abort_with_message(format!(
            "`{}::{}` does not match the interface signature.",
            class.flat_name, iface_method.name
        ));
    }
    debug_assert!(found.vtable_index() >= 0);
    let impl_ptr = so_virtmeth_of(objptr as GcPtr, found.vtable_index());
    class.cache_iface_ptr(iface_method.id, impl_ptr);
    impl_ptr as *mut c_void
}

/// Remoting variant: dispatches on the method name carried by a domain
/// message. Used in server stubs for cross-domain method calls.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_findmethod2(objptr: *mut c_void, msg: *mut c_void) -> *mut c_void {
    if objptr.is_null() {
        abort_with_code(ErrorCode::NullDereference);
    }
    let message = &*(msg as *const DomainMessage);
    let class = so_class_of(objptr as GcPtr);
    let domain = Domain::current();
    let registry = domain.registry().borrow();
    let name = message.method_name.to_utf8();
    let mid = registry
        .instance_method_by_name(class.id, &name)
        .unwrap_or_else(|| abort_with_message(format!("Unknown method `{}`.", name)));
    registry.method(mid).native_ptr() as *mut c_void
}

/// Server-stub unpacker: converts a message buffer into native argument
/// slots using the method's signature.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_unpack(args: *mut *mut c_void, da_msg: *mut c_void, p_method: *mut c_void) {
    let message = &*(da_msg as *const DomainMessage);
    let method = method_ref(p_method);
    let domain = Domain::current();
    let registry = domain.registry().borrow();
    let values = match crate::remoting::unpack_args(&registry, method, message) {
        Ok(values) => values,
        Err(err) => abort_with_message(err.to_string()),
    };
    drop(registry);
    for (i, value) in values.into_iter().enumerate() {
        let word: usize = match value {
            crate::remoting::RecvValue::Int(v) => v as isize as usize,
            crate::remoting::RecvValue::Float(v) => v.to_bits() as usize,
            crate::remoting::RecvValue::Bool(v) => v as usize,
            crate::remoting::RecvValue::Char(v) => v as usize,
            crate::remoting::RecvValue::Null => 0,
            crate::remoting::RecvValue::Str(s) => domain.create_string_shared(s) as usize,
            _ => abort_with_message("Cannot unmarshal this argument in a server stub."),
        };
        *args.add(i) = word as *mut c_void;
    }
}

// ----------------------------------------------------------------------
// Aborts.
// ----------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_abort0(err_code: i32) {
    match ErrorCode::from_i32(err_code) {
        Some(code) => abort_with_code(code),
        None => abort_with_message(format!("Abort with unknown code {}.", err_code)),
    }
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_abort(msg: *mut c_void) {
    let header = msg as *const StringHeader;
    let text = sostr_clone_raw((*header).pstr).to_utf8();
    abort_with_message(text);
}

/// Aborts with the message property of an error object; message-less
/// errors fall back to the failable-failure code.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_abort_e(err_obj: *mut c_void) {
    let header = err_obj as *const crate::object::ErrorHeader;
    if !err_obj.is_null() && !(*header).message.is_null() {
        _soX_abort((*header).message as *mut c_void);
    } else {
        abort_with_code(ErrorCode::FailableFailure);
    }
}

// ----------------------------------------------------------------------
// Static constructors.
// ----------------------------------------------------------------------

type CCtorFn = unsafe extern "C-unwind" fn(i32);

/// Invokes second-stage static-constructor code under a virtual unwinder;
/// on abort the class is left uninitialized.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_cctor(p_class: *mut c_void, cctor: *mut c_void) {
    let class = class_ref(p_class);
    let domain = Domain::current();
    let snapshot = domain.unwind_snapshot();
    let cctor: CCtorFn = std::mem::transmute(cctor);
    if crate::abort::catch_abort(|| cctor(1)).is_err() {
        class.set_initialized(false);
        domain.unwind_to(snapshot);
    }
}

/// Emitted for static methods of types carrying static constructors.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_checktype(p_class: *mut c_void) {
    if !class_ref(p_class).is_initialized() {
        abort_with_code(ErrorCode::TypeInitializationError);
    }
}

// ----------------------------------------------------------------------
// Frames, profiling, stack-overflow detection.
// ----------------------------------------------------------------------

unsafe fn detect_stack_overflow(domain: &Domain) {
    let probe = 0u8;
    let sp = &probe as *const u8 as usize;
    let base = domain.memory_manager().borrow().stack_base();
    if base != 0 && base.saturating_sub(sp) > STACK_LIMIT_BYTES {
        abort_with_code(ErrorCode::StackOverflow);
    }
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_pushframe(_domain: *mut c_void, p_method: *mut c_void) {
    let domain = Domain::current();
    detect_stack_overflow(&domain);
    domain.push_frame(method_ref(p_method).id);
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_popframe(_domain: *mut c_void) {
    Domain::current().pop_frame();
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_pushframe_prf(_domain: *mut c_void, p_method: *mut c_void) -> i32 {
    let domain = Domain::current();
    detect_stack_overflow(&domain);
    let method = method_ref(p_method);
    method.add_calls(1);
    domain.push_frame(method.id);
    crate::platform::tick_count() as i32
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_popframe_prf(_domain: *mut c_void, tc: i32) {
    let domain = Domain::current();
    if let Some(mid) = domain.pop_frame() {
        let delta = (crate::platform::tick_count() as i32).wrapping_sub(tc);
        let registry = domain.registry().borrow();
        registry.method(mid).add_total_time_ms(delta.max(0) as u64);
    }
}

// ----------------------------------------------------------------------
// Soft debugging.
// ----------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_reglocals(local_refs: *mut *mut c_void, sz: i32) {
    Domain::current().push_debug_entry(local_refs as usize, sz as usize);
}

#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_unreglocals() {
    Domain::current().pop_debug_entry();
}

// ----------------------------------------------------------------------
// Events.
// ----------------------------------------------------------------------

/// Appends a handler: a fresh array one slot larger, existing handlers
/// copied, new handler last. The old array is left to the collector.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_addhandler(event: *mut c_void, handler: *mut c_void) {
    if handler.is_null() {
        abort_with_code(ErrorCode::NullDereference);
    }
    let domain = Domain::current();
    let event = event as *mut EventHeader;

    // The backing array is typed by the handler's base method class; a
    // closure is always a subclass of its target method class.
    let handler_class = so_class_of(handler as GcPtr);
    let array_class = {
        let mut registry = domain.registry().borrow_mut();
        let base = handler_class
            .base
            .as_ref()
            .and_then(|b| b.resolved)
            .unwrap_or(handler_class.id);
        let mut tr = skizo_meta::TypeRef::array_of(registry.class_ref(base), 1);
        if registry.resolve_type_ref(&mut tr).is_err() {
            abort_with_message("Couldn't allocate a backing array for the event (::addHandler(..)).");
        }
        match tr.resolved {
            Some(id) => id,
            None => abort_with_message(
                "Couldn't allocate a backing array for the event (::addHandler(..)).",
            ),
        }
    };

    let old_count = if (*event).handlers.is_null() {
        0
    } else {
        (*(*event).handlers).length.max(0) as usize
    };
    let new_array = domain.create_array(array_class, old_count as i32 + 1) as *mut ArrayHeader;

    let dst = crate::object::array_data(new_array as GcPtr) as *mut usize;
    if old_count > 0 {
        let src = crate::object::array_data((*event).handlers as GcPtr) as *const usize;
        std::ptr::copy_nonoverlapping(src, dst, old_count);
    }
    *dst.add(old_count) = handler as usize;
    (*event).handlers = new_array;
}

/// Removes one occurrence of a handler, shrinking the backing array; the
/// event returns to its previous shape when the removed handler was the
/// last one appended. Host-side companion of `_soX_addhandler`.
pub fn remove_handler(event: *mut EventHeader, handler: GcPtr) {
    unsafe {
        if (*event).handlers.is_null() {
            return;
        }
        let old = (*event).handlers;
        let count = (*old).length.max(0) as usize;
        let data = crate::object::array_data(old as GcPtr) as *const usize;
        let found = (0..count).find(|&i| *data.add(i) == handler as usize);
        let Some(found) = found else { return };

        if count == 1 {
            (*event).handlers = std::ptr::null_mut();
            return;
        }
        let domain = Domain::current();
        let array_class = so_class_of(old as GcPtr).id;
        let new_array = domain.create_array(array_class, count as i32 - 1) as *mut ArrayHeader;
        let dst = crate::object::array_data(new_array as GcPtr) as *mut usize;
        let mut at = 0;
        for i in 0..count {
            if i != found {
                *dst.add(at) = *data.add(i);
                at += 1;
            }
        }
        (*event).handlers = new_array;
    }
}

// ----------------------------------------------------------------------
// Guarded arithmetic.
// ----------------------------------------------------------------------

/// Division is wrapped so a zero divisor aborts the domain instead of
/// crashing the whole process.
#[no_mangle]
pub unsafe extern "C-unwind" fn _so_int_op_divide(a: i32, b: i32) -> i32 {
    if b == 0 {
        abort_with_message("Division by zero.");
    }
    a.wrapping_div(b)
}

// ----------------------------------------------------------------------
// Remoting send.
// ----------------------------------------------------------------------

/// Client-stub entry: packs the argument slots into a message and performs
/// the blocking send. `args` holds pointers to the actual values.
#[no_mangle]
pub unsafe extern "C-unwind" fn _soX_msgsnd_sync(
    h_domain: *mut c_void,
    so_obj_name: *mut c_void,
    p_method: *mut c_void,
    args: *mut *mut c_void,
    blocking_ret: *mut c_void,
) {
    let domain = Domain::current();
    let method = method_ref(p_method);

    let handle = {
        let header = h_domain as *const crate::object::DomainHandleHeader;
        let ptr = (*header).wrapped;
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    };
    let object_name = sostr_clone_raw((*(so_obj_name as *const StringHeader)).pstr);

    // Load each argument slot into an invoker word.
    let mut words = Vec::with_capacity(method.sig.params.len());
    for (i, param) in method.sig.params.iter().enumerate() {
        let slot = *args.add(i) as *const u8;
        let word: *mut u8 = match param.ty.prim {
            PrimType::Int => crate::thunks::word_from_i32(*(slot as *const i32)),
            PrimType::Float => crate::thunks::word_from_f32(*(slot as *const f32)),
            PrimType::Bool => crate::thunks::word_from_bool(*(slot as *const i32) != 0),
            PrimType::Char => (*(slot as *const u16)) as usize as *mut u8,
            PrimType::Object => *(slot as *const *mut u8),
            _ => abort_with_message("This value cannot cross domains."),
        };
        words.push(word);
    }

    let ret = domain.foreign_send(handle, object_name, method.id, &words);

    if !blocking_ret.is_null() {
        match method.sig.ret.prim {
            PrimType::Void => {}
            PrimType::Int | PrimType::Bool => {
                *(blocking_ret as *mut i32) = crate::thunks::word_to_i32(ret)
            }
            PrimType::Float => *(blocking_ret as *mut f32) = crate::thunks::word_to_f32(ret),
            PrimType::Char => *(blocking_ret as *mut u16) = ret as usize as u16,
            PrimType::Object => *(blocking_ret as *mut usize) = ret as usize,
            PrimType::IntPtr => *(blocking_ret as *mut usize) = ret as usize,
        }
    }
}
