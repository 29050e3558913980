// Reflection: user-visible Type objects, property discovery, attribute
// lookup and dynamic invocation. Dynamic calls route through invoker
// thunks; boxed and foreign specials are dispatched here, which is what
// the thunk manager's stubs do for compiled code.

use std::sync::Arc;

use skizo_meta::{ClassId, MethodId, PrimType, Registry, Property, SpecialClass, SpecialMethod};

use crate::abort::abort_with_message;
use crate::domain::Domain;
use crate::object::{boxed_data, so_class_of, GcPtr, TypeHeader};
use crate::thunks::call_invoker;

// ----------------------------------------------------------------------
// Type objects.
// ----------------------------------------------------------------------

/// The lazily created, GC-rooted `Type` object wrapping a class. Cached on
/// the class itself.
pub fn type_object_for(domain: &Domain, class: ClassId) -> GcPtr {
    {
        let registry = domain.registry().borrow();
        let cached = registry.class(class).runtime_type_obj();
        if cached != 0 {
            return cached as GcPtr;
        }
    }

    let (type_class, class_ptr) = {
        let registry = domain.registry().borrow();
        (registry.type_class(), registry.class_ptr(class))
    };
    let vtable = domain.ensure_vtable(type_class);
    let obj = domain.gc_alloc(2 * skizo_meta::PTR_SIZE, vtable);
    unsafe {
        (*(obj as *mut TypeHeader)).type_handle = class_ptr;
    }
    // Rooted forever: reflection handles must survive every collection.
    domain.memory_manager().borrow_mut().add_root(obj);
    domain.registry().borrow().class(class).set_runtime_type_obj(obj as usize);
    obj
}

/// `Type.of(obj)`: boxed instances report the wrapped value type.
pub fn type_of(obj: GcPtr) -> ClassId {
    let class = unsafe { so_class_of(obj) };
    if class.special == SpecialClass::Boxed {
        if let Some(wrapped) = class.wrapped.as_ref().and_then(|w| w.resolved) {
            return wrapped;
        }
    }
    class.id
}

/// The class a `Type` object wraps.
pub fn class_of_type_object(obj: GcPtr) -> ClassId {
    unsafe { (*((*(obj as *const TypeHeader)).type_handle)).id }
}

// ----------------------------------------------------------------------
// Properties: getter/setter pairs matched by name convention
// (`foo` / `setFoo`). An emergent phenomenon, not stored metadata.
// ----------------------------------------------------------------------

fn setter_name_for(getter: &str) -> String {
    let mut chars = getter.chars();
    match chars.next() {
        Some(first) => format!("set{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => String::new(),
    }
}

pub fn get_properties(registry: &Registry, class: ClassId, is_static: bool) -> Vec<Property> {
    let c = registry.class(class);
    let pool: &[MethodId] = if is_static {
        &c.static_methods
    } else {
        &c.instance_methods
    };

    let mut out = Vec::new();
    for &getter in pool {
        let g = registry.method(getter);
        if g.sig.params.is_empty() && !g.sig.ret.is_void() {
            let wanted = setter_name_for(&g.name);
            let setter = pool.iter().copied().find(|&mid| {
                let s = registry.method(mid);
                &*s.name == wanted.as_str()
                    && s.sig.params.len() == 1
                    && s.sig.params[0].ty == g.sig.ret
            });
            out.push(Property { getter, setter });
        }
    }
    out
}

/// Class-level attribute lookup (after borrowing, so inherited attributes
/// are visible).
pub fn class_attribute(registry: &Registry, class: ClassId, name: &str) -> Option<Arc<str>> {
    registry.class(class).attribute(name).map(|a| a.value.clone())
}

pub fn method_attribute(registry: &Registry, method: MethodId, name: &str) -> Option<Arc<str>> {
    registry
        .method(method)
        .attributes
        .iter()
        .find(|a| &*a.name == name)
        .map(|a| a.value.clone())
}

// ----------------------------------------------------------------------
// Dynamic invocation.
// ----------------------------------------------------------------------

/// Invokes a method given raw invoker words (`words[0]` = receiver for
/// instance methods). Boxed ctor/method and foreign-sync specials are
/// dispatched natively.
pub fn invoke_raw(domain: &Domain, method: MethodId, words: &mut Vec<*mut u8>) -> *mut u8 {
    let (special, invoker, declaring) = {
        let registry = domain.registry().borrow();
        let m = registry.method(method);
        (m.special, m.invoker_ptr(), m.declaring_class)
    };

    match special {
        SpecialMethod::BoxedCtor => {
            // Wrap the value into a freshly allocated boxed object.
            let (wrapped, size) = {
                let registry = domain.registry().borrow();
                let class = registry.class(declaring);
                let wrapped = class.wrapped.as_ref().and_then(|w| w.resolved);
                let size = wrapped
                    .map(|id| registry.class(id).gc.content_size)
                    .unwrap_or(0);
                (wrapped, size)
            };
            let value_word = words.first().copied().unwrap_or(std::ptr::null_mut());
            let bytes = boxed_value_bytes(domain, wrapped, value_word, size);
            domain.box_value(declaring, &bytes)
        }
        SpecialMethod::BoxedMethod => {
            // Load the value out of the box and forward to the wrapped
            // class's implementation.
            let receiver = words.first().copied().unwrap_or(std::ptr::null_mut());
            if receiver.is_null() {
                abort_with_message("Null receiver in a boxed call.");
            }
            let target = {
                let registry = domain.registry().borrow();
                let name = registry.method(method).name.clone();
                let wrapped = registry
                    .class(declaring)
                    .wrapped
                    .as_ref()
                    .and_then(|w| w.resolved);
                wrapped.and_then(|w| registry.instance_method_by_name(w, &name))
            };
            let Some(target) = target else {
                abort_with_message("Boxed method has no wrapped implementation.");
            };
            let mut forwarded = words.clone();
            forwarded[0] = unsafe { boxed_data(receiver) };
            invoke_raw(domain, target, &mut forwarded)
        }
        SpecialMethod::ForeignSync => {
            let proxy = words.first().copied().unwrap_or(std::ptr::null_mut());
            domain.foreign_invoke(method, proxy, &words[1..])
        }
        _ => {
            if invoker == 0 {
                let registry = domain.registry().borrow();
                abort_with_message(format!(
                    "Method `{}` has no compiled code.",
                    registry.method(method).name
                ));
            }
            unsafe { call_invoker(invoker, words.as_mut_ptr()) }
        }
    }
}

fn boxed_value_bytes(
    domain: &Domain,
    wrapped: Option<ClassId>,
    value_word: *mut u8,
    size: usize,
) -> Vec<u8> {
    let registry = domain.registry().borrow();
    let Some(wrapped) = wrapped else {
        abort_with_message("Boxed class without a wrapped type.");
    };
    let class = registry.class(wrapped);
    match class.prim {
        PrimType::Int | PrimType::Bool => {
            crate::thunks::word_to_i32(value_word).to_ne_bytes().to_vec()
        }
        PrimType::Float => crate::thunks::word_to_f32(value_word).to_ne_bytes().to_vec(),
        PrimType::Char => (value_word as usize as u16).to_ne_bytes().to_vec(),
        PrimType::IntPtr => (value_word as usize).to_ne_bytes().to_vec(),
        PrimType::Object => {
            // Value structs arrive indirectly.
            if value_word.is_null() {
                vec![0; size]
            } else {
                unsafe { std::slice::from_raw_parts(value_word as *const u8, size).to_vec() }
            }
        }
        PrimType::Void => Vec::new(),
    }
}

/// `method.invoke(receiver, args)`: converts a `[any]` argument array into
/// the native calling convention. Value-type arguments must be boxed; the
/// receiver of a value-type method is the boxed object itself and the
/// thunk unwraps it.
pub fn invoke_dynamic(
    domain: &Domain,
    method: MethodId,
    receiver: GcPtr,
    args_array: GcPtr,
) -> GcPtr {
    let (is_static, params, ret): (bool, Vec<skizo_meta::TypeRef>, skizo_meta::TypeRef) = {
        let registry = domain.registry().borrow();
        let m = registry.method(method);
        (
            m.sig.is_static,
            m.sig.params.iter().map(|p| p.ty.clone()).collect(),
            m.sig.ret.clone(),
        )
    };

    let provided: Vec<GcPtr> = if args_array.is_null() {
        Vec::new()
    } else {
        let header = args_array as *const crate::object::ArrayHeader;
        let length = unsafe { (*header).length.max(0) as usize };
        (0..length)
            .map(|i| unsafe {
                *(crate::object::array_data(args_array).add(i * skizo_meta::PTR_SIZE)
                    as *const GcPtr)
            })
            .collect()
    };
    if provided.len() != params.len() {
        abort_with_message("Dynamic invocation argument count mismatch.");
    }

    let mut words: Vec<*mut u8> = Vec::with_capacity(params.len() + 2);
    if !is_static {
        let receiver_class = unsafe { so_class_of(receiver) };
        if receiver_class.special == SpecialClass::Boxed {
            // Value-type receiver: the thunk unwraps the box.
            let declaring = {
                let registry = domain.registry().borrow();
                registry.method(method).declaring_class
            };
            let declaring_is_boxed = declaring == receiver_class.id;
            if declaring_is_boxed {
                words.push(receiver);
            } else {
                words.push(unsafe { boxed_data(receiver) });
            }
        } else {
            words.push(receiver);
        }
    }
    for (arg, ty) in provided.iter().zip(params.iter()) {
        words.push(arg_to_word(domain, *arg, ty));
    }

    // Value-struct results come back through a trailing out-buffer slot.
    let mut ret_buffer: Vec<u8> = Vec::new();
    if let (PrimType::Object, Some(target)) = (ret.prim, ret.resolved) {
        let registry = domain.registry().borrow();
        let class = registry.class(target);
        if class.is_value_type() && class.prim == PrimType::Object {
            ret_buffer = vec![0u8; class.gc.content_size];
            drop(registry);
            words.push(ret_buffer.as_mut_ptr());
        }
    }

    let ret_word = invoke_raw(domain, method, &mut words);
    word_to_object(domain, ret_word, &ret)
}

fn arg_to_word(domain: &Domain, arg: GcPtr, ty: &skizo_meta::TypeRef) -> *mut u8 {
    let target = match ty.resolved {
        Some(id) => id,
        None => return arg,
    };
    let registry = domain.registry().borrow();
    let target_class = registry.class(target);
    if !target_class.is_value_type() {
        return arg;
    }
    drop(registry);

    // Value-type parameters must arrive boxed.
    if arg.is_null() {
        abort_with_message("A value-type argument cannot be null.");
    }
    let arg_class = unsafe { so_class_of(arg) };
    if arg_class.special != SpecialClass::Boxed {
        abort_with_message("A value-type argument must be boxed.");
    }
    let data = unsafe { boxed_data(arg) };
    let registry = domain.registry().borrow();
    match registry.class(target).prim {
        PrimType::Int | PrimType::Bool => {
            crate::thunks::word_from_i32(unsafe { *(data as *const i32) })
        }
        PrimType::Float => crate::thunks::word_from_f32(unsafe { *(data as *const f32) }),
        PrimType::Char => unsafe { *(data as *const u16) as usize as *mut u8 },
        _ => data,
    }
}

/// Boxes primitive results so dynamic callers always receive an object.
fn word_to_object(domain: &Domain, word: *mut u8, ty: &skizo_meta::TypeRef) -> GcPtr {
    if ty.is_void() {
        return std::ptr::null_mut();
    }
    let Some(target) = ty.resolved else {
        return word;
    };
    let is_value = domain.registry().borrow().class(target).is_value_type();
    if !is_value {
        return word;
    }

    let boxed_class = {
        let mut registry = domain.registry().borrow_mut();
        let tr = registry.class_ref(target);
        match registry.boxed_class(&tr, false) {
            Ok(id) => id,
            Err(err) => abort_with_message(err.to_string()),
        }
    };
    let bytes = {
        let registry = domain.registry().borrow();
        let size = registry.class(target).gc.content_size;
        boxed_value_bytes_for_prim(registry.class(target).prim, word, size)
    };
    domain.box_value(boxed_class, &bytes)
}

fn boxed_value_bytes_for_prim(prim: PrimType, word: *mut u8, size: usize) -> Vec<u8> {
    match prim {
        PrimType::Int | PrimType::Bool => crate::thunks::word_to_i32(word).to_ne_bytes().to_vec(),
        PrimType::Float => crate::thunks::word_to_f32(word).to_ne_bytes().to_vec(),
        PrimType::Char => (word as usize as u16).to_ne_bytes().to_vec(),
        PrimType::IntPtr => (word as usize).to_ne_bytes().to_vec(),
        PrimType::Object => {
            if word.is_null() {
                vec![0; size]
            } else {
                unsafe { std::slice::from_raw_parts(word as *const u8, size).to_vec() }
            }
        }
        PrimType::Void => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skizo_meta::{Signature, TypeRef};

    #[test]
    fn test_setter_name_convention() {
        assert_eq!(setter_name_for("name"), "setName");
        assert_eq!(setter_name_for("x"), "setX");
    }

    #[test]
    fn test_property_discovery() {
        let mut registry = Registry::new();
        let class = registry.new_class("Person");
        let string_ref = registry.class_ref(registry.string_class());
        let getter = registry.new_method(class, "name", Signature::new(vec![], string_ref.clone()));
        let setter = registry.new_method(
            class,
            "setName",
            Signature::new(
                vec![skizo_meta::Param::new("value", string_ref)],
                TypeRef::void(),
            ),
        );
        let unrelated = registry.new_method(class, "clear", Signature::new(vec![], TypeRef::void()));
        registry.register_instance_method(class, getter);
        registry.register_instance_method(class, setter);
        registry.register_instance_method(class, unrelated);
        skizo_meta::Linker::link(&mut registry).unwrap();

        let props = get_properties(&registry, class, false);
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].getter, getter);
        assert_eq!(props[0].setter, Some(setter));
    }
}
