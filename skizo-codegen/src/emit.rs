// Composes the single C translation unit for a closed class set: prolog
// (typedefs, helper externs, struct definitions, forward declarations),
// vtable registration, then method bodies. The unit is handed to the
// embedded C compiler; the runtime installs the resulting pointers.

use std::collections::HashSet;
use std::fmt::Write as _;

use log::debug;
use skizo_meta::{
    ClassId, MethodBody, MethodId, MethodKind, PrimType, Registry, SpecialClass, SpecialMethod,
    TypeRef,
};

use crate::compiler::{CompileError, CompileResult};
use crate::mangle;

/// Instrumentation toggles, mirrored from the domain creation flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    /// Wrap tree-compiled bodies in frame push/pop pairs.
    pub stack_trace: bool,
    /// Accumulate per-method tick deltas via the profiling frame helpers.
    pub profiling: bool,
}

/// Addresses inlined into the emitted text. Metadata pointers are stable
/// for the domain's lifetime, so the unit may embed them as literals.
#[derive(Debug, Clone, Copy)]
pub struct EmitEnv {
    pub domain_addr: usize,
    pub memory_manager_addr: usize,
}

/// External contract: line-by-line compilation of parsed expression trees
/// is out of scope for the core; the embedder's emitter plugs in here.
/// Implementations receive the instrumentation options and must weave the
/// frame-pop before every return point themselves.
pub trait MethodBodySource {
    fn emit_body(
        &self,
        registry: &Registry,
        method: MethodId,
        opts: EmitOptions,
        out: &mut String,
    ) -> CompileResult<()>;
}

/// Body source for domains whose classes carry only literal C bodies and
/// native methods (every synthesized class does).
pub struct NoTreeBodies;

impl MethodBodySource for NoTreeBodies {
    fn emit_body(
        &self,
        registry: &Registry,
        method: MethodId,
        _opts: EmitOptions,
        _out: &mut String,
    ) -> CompileResult<()> {
        Err(CompileError::Backend(format!(
            "method `{}` has a tree body but no emitter is attached",
            mangle::method_symbol(registry, method)
        )))
    }
}

pub struct Emitter<'a> {
    registry: &'a Registry,
    env: EmitEnv,
    opts: EmitOptions,
}

impl<'a> Emitter<'a> {
    pub fn new(registry: &'a Registry, env: EmitEnv, opts: EmitOptions) -> Self {
        Self {
            registry,
            env,
            opts,
        }
    }

    /// Emits the full translation unit.
    pub fn emit_unit(&self, bodies: &dyn MethodBodySource) -> CompileResult<String> {
        let mut out = String::with_capacity(64 * 1024);
        self.emit_prelude(&mut out);

        let structs = self.classes_with_structs();
        for &id in &self.struct_emission_order(&structs) {
            self.emit_struct(id, &mut out);
        }

        let methods = self.methods_with_bodies();
        for &mid in &methods {
            let _ = writeln!(out, "{};", self.signature_text(mid));
        }
        out.push('\n');

        self.emit_vtables(&structs, &mut out);
        self.emit_prolog_fn(&structs, &mut out);

        for &mid in &methods {
            self.emit_method(mid, bodies, &mut out)?;
            self.emit_invoker(mid, &mut out);
        }

        debug!(
            "emitted unit: {} structs, {} methods, {} bytes",
            structs.len(),
            methods.len(),
            out.len()
        );
        Ok(out)
    }

    fn emit_prelude(&self, out: &mut String) {
        out.push_str(
            "/* Generated by the Skizo code generator. Do not edit. */\n\
             typedef int _so_bool;\n\
             typedef unsigned short _so_char;\n\
             typedef long _so_word;\n\
             #define _soX_ALIGNED __attribute__((aligned(sizeof(void*))))\n\
             \n\
             void* _soX_gc_alloc(void* mm, int sz, void** vtable);\n\
             void* _soX_gc_alloc_env(void* mm, void* objClass);\n\
             void  _soX_gc_roots(void* mm, void** rootRefs, int count);\n\
             void  _soX_static_vt(void* mm, void* obj, void* objClass);\n\
             void  _soX_regvtable(void* klass, void** vtable);\n\
             void  _soX_patchstrings(void);\n\
             void* _soX_downcast(void* targetClass, void* objptr);\n\
             void  _soX_unbox(void* vt, int vtSize, void* vtClass, void* intrfcObj);\n\
             void* _soX_findmethod(void* objptr, void* pMethod);\n\
             void* _soX_findmethod2(void* objptr, void* msg);\n\
             _so_bool _soX_is(void* obj, void* type);\n\
             _so_bool _soX_biteq(void* a, void* b, int sz);\n\
             void  _soX_zero(void* a, int sz);\n\
             void  _soX_abort0(int errCode);\n\
             void  _soX_abort(void* msg);\n\
             void  _soX_abort_e(void* errObj);\n\
             void  _soX_cctor(void* pClass, void* cctor);\n\
             void  _soX_checktype(void* pClass);\n\
             void* _soX_newarray(void* domain, int arrayLength, void** vtable);\n\
             void  _soX_pushframe(void* domain, void* pMethod);\n\
             void  _soX_popframe(void* domain);\n\
             int   _soX_pushframe_prf(void* domain, void* pMethod);\n\
             void  _soX_popframe_prf(void* domain, int tc);\n\
             void  _soX_addhandler(void* event, void* handler);\n\
             void  _soX_reglocals(void** localRefs, int sz);\n\
             void  _soX_unreglocals(void);\n\
             void  _soX_msgsnd_sync(void* hDomain, void* soObjName, void* pMethod, void** args, void* blockingRet);\n\
             void  _soX_unpack(void** args, void* daMsg, void* pMethod);\n\
             int   _so_int_op_divide(int a, int b);\n\n",
        );
    }

    // ------------------------------------------------------------------
    // Structs.
    // ------------------------------------------------------------------

    fn classes_with_structs(&self) -> HashSet<ClassId> {
        self.registry
            .class_ids()
            .filter(|&id| {
                let class = self.registry.class(id);
                if class.prim != PrimType::Object
                    || class.is_static()
                    || class.is_interface()
                    || class.special == SpecialClass::Alias
                {
                    return false;
                }
                class.struct_def.is_some()
                    || !class.instance_fields.is_empty()
                    || class.is_ref_type()
            })
            .collect()
    }

    /// Value types must be fully defined before any struct embedding them
    /// by value; reference fields only need the (implicit) declaration.
    fn struct_emission_order(&self, structs: &HashSet<ClassId>) -> Vec<ClassId> {
        let mut ordered = Vec::with_capacity(structs.len());
        let mut done = HashSet::new();
        for &id in &self.registry.class_ids().collect::<Vec<_>>() {
            if structs.contains(&id) {
                self.push_struct_ordered(id, structs, &mut done, &mut ordered);
            }
        }
        ordered
    }

    fn push_struct_ordered(
        &self,
        id: ClassId,
        structs: &HashSet<ClassId>,
        done: &mut HashSet<ClassId>,
        ordered: &mut Vec<ClassId>,
    ) {
        if !done.insert(id) {
            return;
        }
        for field in self.collect_layout_fields(id) {
            if let Some(inner) = field.1.resolved {
                if structs.contains(&inner) && self.registry.class(inner).is_value_type() {
                    self.push_struct_ordered(inner, structs, done, ordered);
                }
            }
        }
        ordered.push(id);
    }

    /// Inherited fields first (base chain order), own fields after,
    /// matching the linker-computed offsets.
    fn collect_layout_fields(&self, id: ClassId) -> Vec<(String, TypeRef)> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            chain.push(c);
            cursor = self.registry.class(c).base.as_ref().and_then(|b| b.resolved);
        }
        chain.reverse();

        let mut fields = Vec::new();
        for c in chain {
            for field in &self.registry.class(c).instance_fields {
                fields.push((field.name.to_string(), field.ty.clone()));
            }
        }
        fields
    }

    fn emit_struct(&self, id: ClassId, out: &mut String) {
        let class = self.registry.class(id);
        let tag = mangle::struct_name(self.registry, id);
        let _ = writeln!(out, "struct {} {{", tag);
        if let Some(def) = &class.struct_def {
            // Verbatim native layout; its fields are opaque to the linker.
            for line in def.lines() {
                let _ = writeln!(out, "    {}", line);
            }
        } else {
            if class.is_ref_type() {
                out.push_str("    void** _soX_vtable;\n");
            }
            for (name, ty) in self.collect_layout_fields(id) {
                let _ = writeln!(out, "    {} {} _soX_ALIGNED;", self.c_type(&ty), name);
            }
        }
        out.push_str("};\n\n");
    }

    /// The C spelling of a resolved type reference.
    pub fn c_type(&self, ty: &TypeRef) -> String {
        match ty.prim {
            PrimType::Object => match ty.resolved {
                Some(id) => {
                    let class = self.registry.class(id);
                    if class.is_value_type() {
                        format!("struct {}", mangle::struct_name(self.registry, id))
                    } else if class.is_interface() || class.special == SpecialClass::MethodClass {
                        // Dispatched through `findmethod`; no struct emitted.
                        "void*".to_string()
                    } else {
                        format!("struct {}*", mangle::struct_name(self.registry, id))
                    }
                }
                None => "void*".to_string(),
            },
            prim => prim.c_name().to_string(),
        }
    }

    // ------------------------------------------------------------------
    // VTables & prolog.
    // ------------------------------------------------------------------

    fn emit_vtables(&self, structs: &HashSet<ClassId>, out: &mut String) {
        for id in self.registry.class_ids() {
            let class = self.registry.class(id);
            if !class.has_vtable()
                || class.flags.contains(skizo_meta::ClassFlags::FREE_VTABLE)
                || class.is_interface()
                || !structs.contains(&id)
            {
                continue;
            }
            let _ = writeln!(
                out,
                "static void* {}[] = {{",
                mangle::vtable_symbol(self.registry, id)
            );
            // Slot 0 is patched with the class pointer by _soX_regvtable.
            out.push_str("    (void*)0,\n");
            for &mid in &class.instance_methods {
                let method = self.registry.method(mid);
                if self.has_emitted_body(mid) {
                    let _ = writeln!(
                        out,
                        "    (void*)&{},",
                        mangle::method_symbol(self.registry, mid)
                    );
                } else if method.special == SpecialMethod::Native {
                    let symbol = method
                        .ecall
                        .entry_point
                        .clone()
                        .unwrap_or_else(|| mangle::method_symbol(self.registry, mid).into());
                    let _ = writeln!(out, "    (void*)&{},", symbol);
                } else {
                    out.push_str("    (void*)0,\n");
                }
            }
            out.push_str("};\n\n");
        }
    }

    fn emit_prolog_fn(&self, structs: &HashSet<ClassId>, out: &mut String) {
        let _ = writeln!(out, "void {}(void) {{", mangle::PROLOG_SYMBOL);
        for id in self.registry.class_ids() {
            let class = self.registry.class(id);
            if !class.has_vtable()
                || class.flags.contains(skizo_meta::ClassFlags::FREE_VTABLE)
                || class.is_interface()
                || !structs.contains(&id)
            {
                continue;
            }
            let _ = writeln!(
                out,
                "    _soX_regvtable({}, {});",
                self.ptr_literal(self.registry.class_ptr(id) as usize),
                mangle::vtable_symbol(self.registry, id)
            );
        }
        // Every pre-allocated string literal receives the string class's
        // vtable once it is known.
        out.push_str("    _soX_patchstrings();\n}\n\n");
    }

    fn ptr_literal(&self, addr: usize) -> String {
        format!("(void*)0x{:x}UL", addr)
    }

    // ------------------------------------------------------------------
    // Method bodies.
    // ------------------------------------------------------------------

    fn methods_with_bodies(&self) -> Vec<MethodId> {
        let mut out = Vec::new();
        for id in self.registry.class_ids() {
            let class = self.registry.class(id);
            let all = class
                .instance_methods
                .iter()
                .chain(class.static_methods.iter())
                .chain(class.instance_ctors.iter())
                .chain(class.instance_dtor.iter())
                .chain(class.static_ctor.iter())
                .chain(class.static_dtor.iter());
            for &mid in all {
                // Inherited methods appear in several lists; emit once, for
                // the declaring class.
                if self.registry.method(mid).declaring_class == id && self.has_emitted_body(mid) {
                    out.push(mid);
                }
            }
        }
        out
    }

    fn has_emitted_body(&self, mid: MethodId) -> bool {
        let method = self.registry.method(mid);
        match method.special {
            // Boxed thunks are installed natively by the thunk manager.
            SpecialMethod::BoxedCtor | SpecialMethod::BoxedMethod => false,
            SpecialMethod::Native => false,
            SpecialMethod::ForeignSync => true,
            SpecialMethod::None => !matches!(method.body, MethodBody::None),
        }
    }

    fn signature_text(&self, mid: MethodId) -> String {
        let method = self.registry.method(mid);
        let class = self.registry.class(method.declaring_class);
        let ret = if method.kind == MethodKind::Ctor {
            self.c_type(&self.registry.class_ref(method.declaring_class))
        } else if method.sig.ret.is_void() {
            "void".to_string()
        } else {
            self.c_type(&method.sig.ret)
        };

        let mut params = Vec::new();
        if !method.sig.is_static && method.kind != MethodKind::Ctor {
            if class.is_value_type() {
                params.push(format!(
                    "struct {} self",
                    mangle::struct_name(self.registry, method.declaring_class)
                ));
            } else {
                params.push(format!(
                    "struct {}* self",
                    mangle::struct_name(self.registry, method.declaring_class)
                ));
            }
        }
        for p in &method.sig.params {
            params.push(format!("{} l_{}", self.c_type(&p.ty), p.name));
        }
        let params = if params.is_empty() {
            "void".to_string()
        } else {
            params.join(", ")
        };
        format!(
            "{} {}({})",
            ret,
            mangle::method_symbol(self.registry, mid),
            params
        )
    }

    fn emit_method(
        &self,
        mid: MethodId,
        bodies: &dyn MethodBodySource,
        out: &mut String,
    ) -> CompileResult<()> {
        let method = self.registry.method(mid);
        let _ = writeln!(out, "{} {{", self.signature_text(mid));

        if method.kind == MethodKind::Ctor {
            self.emit_ctor_prolog(mid, out);
        }

        match (&method.body, method.special) {
            (_, SpecialMethod::ForeignSync) => self.emit_foreign_stub(mid, out),
            (MethodBody::CText(text), _) => {
                // Literal bodies are leaves; they carry their own aborts and
                // are not frame-instrumented.
                for line in text.lines() {
                    let _ = writeln!(out, "    {}", line);
                }
            }
            (MethodBody::Tree(_), _) => {
                if self.opts.profiling {
                    let _ = writeln!(
                        out,
                        "    int _soX_tc = _soX_pushframe_prf({}, {});",
                        self.ptr_literal(self.env.domain_addr),
                        self.ptr_literal(self.registry.method_ptr(mid) as usize)
                    );
                } else if self.opts.stack_trace {
                    let _ = writeln!(
                        out,
                        "    _soX_pushframe({}, {});",
                        self.ptr_literal(self.env.domain_addr),
                        self.ptr_literal(self.registry.method_ptr(mid) as usize)
                    );
                }
                bodies.emit_body(self.registry, mid, self.opts, out)?;
                if self.opts.profiling {
                    let _ = writeln!(
                        out,
                        "    _soX_popframe_prf({}, _soX_tc);",
                        self.ptr_literal(self.env.domain_addr)
                    );
                } else if self.opts.stack_trace {
                    let _ = writeln!(
                        out,
                        "    _soX_popframe({});",
                        self.ptr_literal(self.env.domain_addr)
                    );
                }
            }
            (MethodBody::None, _) => {}
        }

        if method.kind == MethodKind::Ctor {
            out.push_str("    return self;\n");
        }
        out.push_str("}\n\n");
        Ok(())
    }

    /// Constructors allocate and zero their receiver, then run the literal
    /// body against it.
    fn emit_ctor_prolog(&self, mid: MethodId, out: &mut String) {
        let method = self.registry.method(mid);
        let class = self.registry.class(method.declaring_class);
        let tag = mangle::struct_name(self.registry, method.declaring_class);
        if class.is_value_type() {
            let _ = writeln!(out, "    struct {} self;", tag);
            let _ = writeln!(
                out,
                "    _soX_zero(&self, sizeof(struct {}));",
                tag
            );
        } else {
            let _ = writeln!(
                out,
                "    struct {tag}* self = (struct {tag}*)_soX_gc_alloc({mm}, {size}, {vtbl});",
                tag = tag,
                mm = self.ptr_literal(self.env.memory_manager_addr),
                size = class.gc.content_size,
                vtbl = mangle::vtable_symbol(self.registry, method.declaring_class)
            );
        }
    }

    /// Client stub for foreign proxies: packs argument addresses and sends
    /// the message synchronously through the proxy's domain handle.
    fn emit_foreign_stub(&self, mid: MethodId, out: &mut String) {
        let method = self.registry.method(mid);
        let n = method.sig.params.len();
        let _ = writeln!(out, "    void* l_args[{}];", n.max(1));
        for (i, p) in method.sig.params.iter().enumerate() {
            let _ = writeln!(out, "    l_args[{}] = (void*)&l_{};", i, p.name);
        }
        let has_ret = !method.sig.ret.is_void();
        if has_ret {
            let _ = writeln!(out, "    {} _soX_ret;", self.c_type(&method.sig.ret));
        }
        let _ = writeln!(
            out,
            "    _soX_msgsnd_sync(self->m_hdomain, self->m_name, {}, l_args, {});",
            self.ptr_literal(self.registry.method_ptr(mid) as usize),
            if has_ret { "(void*)&_soX_ret" } else { "(void*)0" }
        );
        if has_ret {
            out.push_str("    return _soX_ret;\n");
        }
    }

    // ------------------------------------------------------------------
    // Invoker adapters: the uniform dynamic-call ABI used by reflection,
    // templates and remoting dispatch. One word slot per argument; value
    // types indirectly, floats as bit patterns in the low word.
    // ------------------------------------------------------------------

    fn emit_invoker(&self, mid: MethodId, out: &mut String) {
        let method = self.registry.method(mid);
        let class = self.registry.class(method.declaring_class);
        let _ = writeln!(
            out,
            "void* {}(void** args) {{",
            mangle::invoker_symbol(self.registry, mid)
        );

        let mut call_args = Vec::new();
        let mut slot = 0usize;
        if !method.sig.is_static && method.kind != MethodKind::Ctor {
            let tag = mangle::struct_name(self.registry, method.declaring_class);
            if class.is_value_type() {
                call_args.push(format!("*(struct {}*)args[0]", tag));
            } else {
                call_args.push(format!("(struct {}*)args[0]", tag));
            }
            slot = 1;
        }
        for p in &method.sig.params {
            call_args.push(self.unpack_arg(&p.ty, slot));
            slot += 1;
        }

        let call = format!(
            "{}({})",
            mangle::method_symbol(self.registry, mid),
            call_args.join(", ")
        );

        let ret_ty = if method.kind == MethodKind::Ctor {
            self.registry.class_ref(method.declaring_class)
        } else {
            method.sig.ret.clone()
        };
        self.emit_invoker_return(&ret_ty, &call, slot, out);
        out.push_str("}\n\n");
    }

    fn unpack_arg(&self, ty: &TypeRef, slot: usize) -> String {
        match ty.prim {
            PrimType::Int => format!("(int)(_so_word)args[{}]", slot),
            PrimType::Bool => format!("(_so_bool)(_so_word)args[{}]", slot),
            PrimType::Char => format!("(_so_char)(_so_word)args[{}]", slot),
            PrimType::Float => format!("*(float*)&args[{}]", slot),
            PrimType::IntPtr => format!("args[{}]", slot),
            PrimType::Void => "0".to_string(),
            PrimType::Object => match ty.resolved {
                Some(id) if self.registry.class(id).is_value_type() => {
                    format!(
                        "*(struct {}*)args[{}]",
                        mangle::struct_name(self.registry, id),
                        slot
                    )
                }
                Some(id)
                    if !self.registry.class(id).is_interface()
                        && self.registry.class(id).special != SpecialClass::MethodClass =>
                {
                    format!(
                        "(struct {}*)args[{}]",
                        mangle::struct_name(self.registry, id),
                        slot
                    )
                }
                _ => format!("args[{}]", slot),
            },
        }
    }

    fn emit_invoker_return(&self, ty: &TypeRef, call: &str, next_slot: usize, out: &mut String) {
        match ty.prim {
            PrimType::Void => {
                let _ = writeln!(out, "    {};\n    return (void*)0;", call);
            }
            PrimType::Int | PrimType::Bool | PrimType::Char => {
                let _ = writeln!(out, "    return (void*)(_so_word)({});", call);
            }
            PrimType::Float => {
                let _ = writeln!(out, "    float _soX_r = {};", call);
                out.push_str("    void* _soX_w = 0;\n    *(float*)&_soX_w = _soX_r;\n    return _soX_w;\n");
            }
            PrimType::IntPtr => {
                let _ = writeln!(out, "    return (void*)({});", call);
            }
            PrimType::Object => match ty.resolved {
                Some(id) if self.registry.class(id).is_value_type() => {
                    let tag = mangle::struct_name(self.registry, id);
                    // Value-type results are written through the trailing
                    // out-buffer slot.
                    let _ = writeln!(
                        out,
                        "    *(struct {tag}*)args[{slot}] = {call};\n    return args[{slot}];",
                        tag = tag,
                        slot = next_slot,
                        call = call
                    );
                }
                _ => {
                    let _ = writeln!(out, "    return (void*)({});", call);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skizo_meta::{Linker, Signature, TypeRef};

    fn env() -> EmitEnv {
        EmitEnv {
            domain_addr: 0x1000,
            memory_manager_addr: 0x2000,
        }
    }

    #[test]
    fn test_array_class_unit_contains_range_check() {
        let mut registry = Registry::new();
        let mut tr = TypeRef::array_of(TypeRef::prim(PrimType::Int), 1);
        registry.resolve_type_ref(&mut tr).unwrap();
        Linker::link(&mut registry).unwrap();

        let emitter = Emitter::new(&registry, env(), EmitOptions::default());
        let unit = emitter.emit_unit(&NoTreeBodies).unwrap();

        let flat = registry.class(tr.resolved.unwrap()).flat_name.clone();
        assert!(unit.contains(&format!("struct _so_{}", flat)));
        assert!(unit.contains("int _soX_firstItem _soX_ALIGNED;"));
        assert!(unit.contains("_soX_abort0(0);"));
        assert!(unit.contains(&format!("_so_{}_get", flat)));
        assert!(unit.contains("_soX_patchstrings();"));
    }

    #[test]
    fn test_vtable_slot_zero_reserved() {
        let mut registry = Registry::new();
        let class = registry.new_class("Widget");
        let m = registry.new_method(class, "draw", Signature::new(vec![], TypeRef::void()));
        registry.method_mut(m).body = MethodBody::CText("/* nothing */\n".into());
        registry.register_instance_method(class, m);
        Linker::link(&mut registry).unwrap();

        let emitter = Emitter::new(&registry, env(), EmitOptions::default());
        let unit = emitter.emit_unit(&NoTreeBodies).unwrap();
        assert!(unit.contains("static void* _soX_vtbl_Widget[] = {"));
        assert!(unit.contains("(void*)0,\n    (void*)&_so_Widget_draw"));
        assert!(unit.contains("_soX_regvtable("));
    }

    #[test]
    fn test_foreign_stub_packs_and_sends() {
        let mut registry = Registry::new();
        let svc = registry.new_class("Service");
        let inc = registry.new_method(
            svc,
            "add",
            Signature::new(
                vec![skizo_meta::Param::new(
                    "delta",
                    registry.resolved_prim_ref(PrimType::Int),
                )],
                registry.resolved_prim_ref(PrimType::Int),
            ),
        );
        registry.register_instance_method(svc, inc);
        let mut tr = TypeRef::foreign_of(TypeRef::object("Service"));
        registry.resolve_type_ref(&mut tr).unwrap();
        Linker::link(&mut registry).unwrap();

        let emitter = Emitter::new(&registry, env(), EmitOptions::default());
        let unit = emitter.emit_unit(&NoTreeBodies).unwrap();
        assert!(unit.contains("_soX_msgsnd_sync(self->m_hdomain, self->m_name"));
        assert!(unit.contains("l_args[0] = (void*)&l_delta;"));
    }

    #[test]
    fn test_invoker_adapters_emitted() {
        let mut registry = Registry::new();
        let class = registry.new_class("Point2");
        let m = registry.new_method(
            class,
            "norm",
            Signature::new(vec![], registry.resolved_prim_ref(PrimType::Int)),
        );
        registry.method_mut(m).body = MethodBody::CText("return 0;\n".into());
        registry.register_instance_method(class, m);
        Linker::link(&mut registry).unwrap();

        let emitter = Emitter::new(&registry, env(), EmitOptions::default());
        let unit = emitter.emit_unit(&NoTreeBodies).unwrap();
        assert!(unit.contains("void* _soXinv_so_Point2_norm(void** args)"));
        assert!(unit.contains("return (void*)(_so_word)(_so_Point2_norm((struct _so_Point2*)args[0]));"));
    }
}
