// Dynamic dispatch plumbing: the uniform invoker ABI, the thunk manager
// guarding the embedded compiler (the "emitter lock"), on-demand vtables
// for free-vtable classes, closure code offsets and boxed-method thunks.
//
// Invoker ABI: one word slot per argument. Slot 0 is the receiver for
// instance methods (for value-type receivers, a pointer to the bytes);
// primitives travel widened in the slot (floats as bit patterns in the low
// word), value types indirectly via pointers; value-type results are
// written through a trailing out-buffer slot. Emitted adapters and native
// methods implement the same shape.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use log::trace;
use skizo_codegen::{CompileError, CompileResult, CompiledUnit, NativeCompiler};
use skizo_meta::{ClassId, MethodId, Registry};

use crate::object::GcPtr;

pub type InvokerFn = unsafe extern "C-unwind" fn(args: *mut *mut u8) -> *mut u8;

/// Calls an invoker thunk by address.
///
/// # Safety
/// `ptr` must be an `InvokerFn` and `args` must satisfy the invoker ABI of
/// the target method.
pub unsafe fn call_invoker(ptr: usize, args: *mut *mut u8) -> *mut u8 {
    let f: InvokerFn = std::mem::transmute(ptr);
    f(args)
}

// Word packing helpers for the invoker ABI.

pub fn word_from_i32(v: i32) -> *mut u8 {
    v as isize as *mut u8
}

pub fn word_to_i32(w: *mut u8) -> i32 {
    w as isize as i32
}

pub fn word_from_bool(v: bool) -> *mut u8 {
    (v as usize) as *mut u8
}

pub fn word_to_bool(w: *mut u8) -> bool {
    w as usize != 0
}

pub fn word_from_f32(v: f32) -> *mut u8 {
    v.to_bits() as usize as *mut u8
}

pub fn word_to_f32(w: *mut u8) -> f32 {
    f32::from_bits(w as usize as u32)
}

/// Generates, per closure class and captured object, the C trampoline that
/// exposes a bare function pointer to native code; guards the embedded
/// compiler behind one lock, which also serializes lazy class synthesis.
pub struct ThunkManager {
    compiler: Mutex<Box<dyn NativeCompiler>>,
    units: Mutex<Vec<Box<dyn CompiledUnit>>>,
    /// Backing storage for vtables built at runtime (free-vtable classes
    /// and natively installed methods).
    vtables: Mutex<Vec<Box<[usize]>>>,
    trampoline_counter: AtomicU32,
}

impl ThunkManager {
    pub fn new(compiler: Box<dyn NativeCompiler>) -> Self {
        Self {
            compiler: Mutex::new(compiler),
            units: Mutex::new(Vec::new()),
            vtables: Mutex::new(Vec::new()),
            trampoline_counter: AtomicU32::new(0),
        }
    }

    /// Compiles a translation unit under the emitter lock, retains it for
    /// the domain's lifetime and resolves the requested symbols.
    pub fn compile_and_lookup(
        &self,
        unit_text: &str,
        symbols: &[&str],
    ) -> CompileResult<Vec<usize>> {
        let mut compiler = self.compiler.lock().unwrap_or_else(|e| e.into_inner());
        let unit = compiler.compile(unit_text)?;
        let mut resolved = Vec::with_capacity(symbols.len());
        for &name in symbols {
            resolved.push(
                unit.symbol(name)
                    .ok_or_else(|| CompileError::MissingSymbol(name.to_string()))?,
            );
        }
        self.units
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(unit);
        Ok(resolved)
    }

    /// Compiles a unit and resolves every requested symbol leniently,
    /// returning 0 for absent ones. Used for the main unit, where native
    /// methods resolve through the ECall registry instead.
    pub fn compile_unit(
        &self,
        unit_text: &str,
        lookup: impl FnOnce(&dyn CompiledUnit),
    ) -> CompileResult<()> {
        let mut compiler = self.compiler.lock().unwrap_or_else(|e| e.into_inner());
        let unit = compiler.compile(unit_text)?;
        lookup(&*unit);
        self.units
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(unit);
        Ok(())
    }

    /// Builds (or rebuilds) a vtable from the methods' installed pointers
    /// and publishes it on the class. Slot 0 carries the class metadata
    /// pointer; slots 1.. the code pointers in vtable-index order.
    pub fn build_vtable(&self, registry: &Registry, class: ClassId) -> usize {
        let c = registry.class(class);
        let method_count = c.instance_methods.len();
        let mut table = vec![0usize; method_count + 1];
        table[0] = registry.class_ptr(class) as usize;
        for &mid in &c.instance_methods {
            let method = registry.method(mid);
            let index = method.vtable_index();
            if index < 0 {
                continue;
            }
            let ptr = if method.native_ptr() != 0 {
                method.native_ptr()
            } else {
                method.invoker_ptr()
            };
            table[index as usize + 1] = ptr;
        }
        let boxed = table.into_boxed_slice();
        let addr = boxed.as_ptr() as usize;
        c.set_vtable(addr);
        self.vtables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(boxed);
        trace!("built vtable for {} ({} slots)", c.flat_name, method_count + 1);
        addr
    }

    /// The stable code pointer of a closure, generated lazily per closure
    /// object: a trampoline that loads the captured environment and
    /// tail-calls the invoke method. Cached on the closure object.
    pub fn closure_code_offset(&self, registry: &Registry, closure: GcPtr) -> CompileResult<usize> {
        let header = closure as *mut crate::object::ClosureHeader;
        unsafe {
            if (*header).code_offset != 0 {
                return Ok((*header).code_offset);
            }
        }

        let class = unsafe { crate::object::so_class_of(closure) };
        let invoke = class
            .invoke_method
            .or_else(|| {
                class
                    .instance_methods
                    .iter()
                    .copied()
                    .find(|&m| &*registry.method(m).name == "invoke")
            })
            .ok_or_else(|| {
                CompileError::Backend(format!("{} has no invoke method", class.flat_name))
            })?;

        let n = self.trampoline_counter.fetch_add(1, Ordering::Relaxed);
        let symbol = format!("_soXtramp_{}", n);
        let text = closure_trampoline_text(registry, invoke, closure as usize, &symbol);
        let ptr = self.compile_and_lookup(&text, &[&symbol])?[0];
        unsafe {
            (*header).code_offset = ptr;
        }
        Ok(ptr)
    }
}

/// C text of a closure trampoline: bare parameters in, the closure object
/// inlined as the receiver.
fn closure_trampoline_text(
    registry: &Registry,
    invoke: MethodId,
    closure_addr: usize,
    symbol: &str,
) -> String {
    let method = registry.method(invoke);
    let params: Vec<String> = (0..method.sig.params.len())
        .map(|i| format!("void* a{}", i))
        .collect();
    let args: Vec<String> = (0..method.sig.params.len())
        .map(|i| format!("a{}", i))
        .collect();
    let invoke_symbol = skizo_codegen::mangle::method_symbol(registry, invoke);
    let call_args = if args.is_empty() {
        format!("(void*)0x{:x}UL", closure_addr)
    } else {
        format!("(void*)0x{:x}UL, {}", closure_addr, args.join(", "))
    };
    format!(
        "void* {invoke_symbol}(void* self{extra});\n\
         void* {symbol}({params}) {{\n    return {invoke_symbol}({call_args});\n}}\n",
        invoke_symbol = invoke_symbol,
        symbol = symbol,
        extra = if params.is_empty() {
            String::new()
        } else {
            format!(", {}", params.join(", "))
        },
        params = if params.is_empty() {
            "void".to_string()
        } else {
            params.join(", ")
        },
        call_args = call_args,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use skizo_codegen::TableCompiler;
    use skizo_meta::{Signature, TypeRef};

    #[test]
    fn test_word_round_trips() {
        assert_eq!(word_to_i32(word_from_i32(-7)), -7);
        assert_eq!(word_to_i32(word_from_i32(i32::MAX)), i32::MAX);
        assert!(word_to_bool(word_from_bool(true)));
        assert!(!word_to_bool(word_from_bool(false)));
        assert_eq!(word_to_f32(word_from_f32(3.5)), 3.5);
    }

    #[test]
    fn test_build_vtable_orders_by_index() {
        let mut registry = Registry::new();
        let class = registry.new_class("Thing");
        let a = registry.new_method(class, "a", Signature::new(vec![], TypeRef::void()));
        let b = registry.new_method(class, "b", Signature::new(vec![], TypeRef::void()));
        registry.register_instance_method(class, a);
        registry.register_instance_method(class, b);
        skizo_meta::Linker::link(&mut registry).unwrap();
        registry.method(a).set_invoker_ptr(0x100);
        registry.method(b).set_invoker_ptr(0x200);

        let thunks = ThunkManager::new(Box::new(TableCompiler::new()));
        let vtable = thunks.build_vtable(&registry, class);
        let slots = unsafe { std::slice::from_raw_parts(vtable as *const usize, 3) };
        assert_eq!(slots[0], registry.class_ptr(class) as usize);
        assert_eq!(slots[1], 0x100);
        assert_eq!(slots[2], 0x200);
        assert_eq!(registry.class(class).vtable(), vtable);
    }

    #[test]
    fn test_trampoline_text_inlines_receiver() {
        let mut registry = Registry::new();
        let class = registry.new_class("0Closure_1");
        let invoke = registry.new_method(
            class,
            "invoke",
            Signature::new(
                vec![skizo_meta::Param::new(
                    "x",
                    registry.resolved_prim_ref(skizo_meta::PrimType::Int),
                )],
                TypeRef::void(),
            ),
        );
        registry.register_instance_method(class, invoke);

        let text = closure_trampoline_text(&registry, invoke, 0xdead, "_soXtramp_0");
        assert!(text.contains("_so_0Closure_1_invoke((void*)0xdeadUL, a0)"));
        assert!(text.contains("void* _soXtramp_0(void* a0)"));
    }
}
