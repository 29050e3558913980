// Turns unresolved type references into concrete classes, synthesizing
// array, failable, boxed and foreign-proxy classes on demand. Each
// synthesized shape is cached per domain so repeated spellings share one
// class.

use std::sync::Arc;

use log::trace;
use thiserror::Error;

use crate::class::{ClassFlags, GcInfo, SpecialClass};
use crate::ids::ClassId;
use crate::member::Field;
use crate::method::{MethodBody, Param, Signature, SpecialMethod};
use crate::registry::{ArrayKey, Registry, PTR_SIZE};
use crate::typeref::{PrimType, TypeRef, TypeRefKind};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("alias `{0}` does not resolve to a class")]
    UnresolvableAlias(String),
    #[error("arrays of void are not allowed")]
    VoidArray,
    #[error("Strings are a special case: they're shared among domains (string* found).")]
    ForeignString,
    #[error("Valuetypes can't be foreign.")]
    ForeignValueType,
    #[error("Static classes can't be foreign.")]
    ForeignStatic,
    #[error("Classes with native layouts (including binary blobs) can't be foreign.")]
    ForeignNativeLayout,
    #[error("`{0}` is not a value type and cannot be boxed")]
    BoxedNonValueType(String),
    #[error("boxed class for `{0}` has not been created yet")]
    BoxedMissing(String),
    #[error(transparent)]
    Link(#[from] crate::linker::LinkError),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

impl Registry {
    /// A resolved reference to a primitive class.
    pub fn resolved_prim_ref(&self, prim: PrimType) -> TypeRef {
        let id = self.prim_class(prim);
        let mut tr = TypeRef::prim(prim);
        tr.class_name = Some(self.class(id).flat_name.clone());
        tr.resolved = Some(id);
        tr
    }

    /// Converts a class into a resolved, normal-kind reference.
    pub fn class_ref(&self, id: ClassId) -> TypeRef {
        let class = self.class(id);
        let mut tr = TypeRef::object(class.flat_name.clone());
        tr.prim = if class.prim == PrimType::Object {
            PrimType::Object
        } else {
            class.prim
        };
        tr.resolved = Some(id);
        tr
    }

    /// Drives every type reference in the metadata graph to a fixed point.
    /// Synthesized classes appended during the walk are themselves walked.
    pub fn resolve_all(&mut self) -> ResolveResult<()> {
        let mut index = 0;
        while index < self.class_count() {
            let id = ClassId(index as u32);
            self.resolve_class_refs(id)?;
            index += 1;
        }
        Ok(())
    }

    fn resolve_class_refs(&mut self, id: ClassId) -> ResolveResult<()> {
        if let Some(mut tr) = self.class(id).base.clone() {
            self.resolve_type_ref(&mut tr)?;
            self.class_mut(id).base = Some(tr);
        }
        if let Some(mut tr) = self.class(id).wrapped.clone() {
            self.resolve_type_ref(&mut tr)?;
            self.class_mut(id).wrapped = Some(tr);
        }

        for i in 0..self.class(id).interfaces.len() {
            let mut tr = self.class(id).interfaces[i].clone();
            self.resolve_type_ref(&mut tr)?;
            self.class_mut(id).interfaces[i] = tr;
        }
        for i in 0..self.class(id).instance_fields.len() {
            let mut tr = self.class(id).instance_fields[i].ty.clone();
            self.resolve_type_ref(&mut tr)?;
            self.class_mut(id).instance_fields[i].ty = tr;
        }
        for i in 0..self.class(id).static_fields.len() {
            let mut tr = self.class(id).static_fields[i].ty.clone();
            self.resolve_type_ref(&mut tr)?;
            self.class_mut(id).static_fields[i].ty = tr;
        }

        let mut methods: Vec<_> = self.class(id).instance_methods.clone();
        methods.extend(self.class(id).static_methods.iter().copied());
        methods.extend(self.class(id).instance_ctors.iter().copied());
        methods.extend(self.class(id).instance_dtor);
        methods.extend(self.class(id).static_ctor);
        methods.extend(self.class(id).static_dtor);
        for mid in methods {
            let mut ret = self.method(mid).sig.ret.clone();
            self.resolve_type_ref(&mut ret)?;
            self.method_mut(mid).sig.ret = ret;
            for p in 0..self.method(mid).sig.params.len() {
                let mut tr = self.method(mid).sig.params[p].ty.clone();
                self.resolve_type_ref(&mut tr)?;
                self.method_mut(mid).sig.params[p].ty = tr;
            }
        }
        Ok(())
    }

    /// Closes one reference to a concrete class, mutating it in place. On
    /// success the reference is `{kind: Normal, array_level: 0, resolved}`.
    pub fn resolve_type_ref(&mut self, tr: &mut TypeRef) -> ResolveResult<()> {
        if tr.resolved.is_some() && tr.kind == TypeRefKind::Normal && tr.array_level == 0 {
            return Ok(());
        }

        if tr.resolved.is_none() {
            if tr.prim == PrimType::Object {
                let name = tr.class_name.clone().unwrap_or_else(|| Arc::from(""));
                let found = self
                    .class_by_name(&name)
                    .ok_or_else(|| ResolveError::UnknownClass(name.to_string()))?;
                tr.resolved = Some(found);

                // Alias redirection: replace the reference with the alias
                // target and restart resolution on it.
                if self.class(found).special == SpecialClass::Alias {
                    let mut target = self
                        .class(found)
                        .wrapped
                        .clone()
                        .ok_or_else(|| ResolveError::UnresolvableAlias(name.to_string()))?;
                    self.resolve_type_ref(&mut target)?;
                    self.class_mut(found).wrapped = Some(target.clone());
                    let (kind, level) = (tr.kind, tr.array_level);
                    *tr = target;
                    tr.kind = kind;
                    tr.array_level += level;
                    return self.resolve_type_ref(tr);
                }
            } else {
                let prim_class = self.prim_class(tr.prim);
                tr.class_name = Some(self.class(prim_class).flat_name.clone());
                tr.resolved = Some(prim_class);
            }
        }

        match tr.kind {
            TypeRefKind::Failable => {
                // Support for `[T]?`: fold the array level first.
                if tr.array_level > 0 {
                    tr.kind = TypeRefKind::Normal;
                    self.resolve_array_class(tr)?;
                    tr.kind = TypeRefKind::Failable;
                }
                self.resolve_failable_struct(tr)?;
                tr.kind = TypeRefKind::Normal;
            }
            TypeRefKind::Foreign => {
                if tr.array_level > 0 {
                    tr.kind = TypeRefKind::Normal;
                    self.resolve_array_class(tr)?;
                    tr.kind = TypeRefKind::Foreign;
                }
                self.resolve_foreign_proxy(tr)?;
                tr.kind = TypeRefKind::Normal;
            }
            TypeRefKind::Normal => {}
        }

        if tr.array_level > 0 {
            self.resolve_array_class(tr)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Array synthesis.
    // ------------------------------------------------------------------

    fn resolve_array_class(&mut self, tr: &mut TypeRef) -> ResolveResult<()> {
        debug_assert!(tr.array_level > 0);

        let key = ArrayKey::of(tr);
        if let Some(found) = self.array_cache.get(&key).map(|e| *e) {
            // `[int]` starts as "int, level 1"; after resolution it is
            // "object, level 0" pointing at the synthesized class.
            Self::install_into_ref(tr, found, self.class(found).flat_name.clone());
            return Ok(());
        }

        let mut elem = tr.clone();
        elem.array_level -= 1;
        elem.resolved = None;
        elem.kind = TypeRefKind::Normal;
        self.resolve_type_ref(&mut elem)?;
        if elem.prim == PrimType::Void || elem.resolved.is_none() {
            return Err(ResolveError::VoidArray);
        }

        let flat_name: Arc<str> = format!("0Array_{}", self.new_unique_id()).into();
        let id = self.new_class(flat_name.clone());
        {
            let struct_def = self.array_struct_def(&elem, tr.array_level);
            let class = self.class_mut(id);
            class.special = SpecialClass::Array;
            class.flags |= ClassFlags::COMPILER_GENERATED;
            class.wrapped = Some(elem.clone());
            class.struct_def = Some(struct_def.into());
            // Header + length word; elements follow, walked by the GC via
            // the element class's map.
            class.gc = GcInfo {
                map: Vec::new(),
                content_size: 2 * PTR_SIZE,
                size_for_use: PTR_SIZE,
            };
        }
        self.array_cache.insert(key, id);

        let int_ref = self.resolved_prim_ref(PrimType::Int);

        // get(index) -> element, range-checked against the abort helper.
        let get = self.new_method(
            id,
            "get",
            Signature::new(vec![Param::new("index", int_ref.clone())], elem.clone()),
        );
        self.method_mut(get).body = MethodBody::CText(
            "if(l_index < 0 || l_index >= self->_soX_length) _soX_abort0(0);\n\
             return (&self->_soX_firstItem)[l_index];\n"
                .into(),
        );
        self.register_instance_method(id, get);

        // set(index, value)
        let set = self.new_method(
            id,
            "set",
            Signature::new(
                vec![
                    Param::new("index", int_ref.clone()),
                    Param::new("value", elem.clone()),
                ],
                elem.clone(),
            ),
        );
        self.method_mut(set).body = MethodBody::CText(
            "if(l_index < 0 || l_index >= self->_soX_length) _soX_abort0(0);\n\
             (&self->_soX_firstItem)[l_index] = l_value;\n"
                .into(),
        );
        self.register_instance_method(id, set);

        let length = self.new_method(id, "length", Signature::new(vec![], int_ref));
        self.method_mut(length).body = MethodBody::CText("return self->_soX_length;\n".into());
        self.register_instance_method(id, length);

        self.link_class(id)?;
        trace!("synthesized array class {}", flat_name);
        Self::install_into_ref(tr, id, flat_name);
        Ok(())
    }

    fn array_struct_def(&self, elem: &TypeRef, level: u32) -> String {
        let header = "void** _soX_vtable;\nint _soX_length;\n";
        let elem_c = match elem.prim {
            PrimType::Object => {
                let elem_class = elem.resolved.map(|c| self.class(c));
                // All closures share one C struct to keep the emitted unit
                // small.
                let base = match elem_class.map(|c| c.special) {
                    Some(SpecialClass::MethodClass) => "struct _soX_0Closure".to_string(),
                    _ => format!(
                        "struct _so_{}",
                        elem.class_name.as_deref().unwrap_or("object")
                    ),
                };
                let by_ref = level > 1
                    || elem_class.map(|c| !c.is_value_type()).unwrap_or(true);
                if by_ref {
                    format!("{}*", base)
                } else {
                    base
                }
            }
            prim => prim.c_name().to_string(),
        };
        format!("{header}{elem_c} _soX_firstItem _soX_ALIGNED;\n")
    }

    // ------------------------------------------------------------------
    // Failable synthesis.
    // ------------------------------------------------------------------

    fn resolve_failable_struct(&mut self, tr: &mut TypeRef) -> ResolveResult<()> {
        let inner = tr.resolved.ok_or(ResolveError::VoidArray)?;
        if self.class(inner).special == SpecialClass::Failable {
            return Ok(());
        }

        let inner_name = self.class(inner).flat_name.clone();
        if let Some(found) = self.failable_cache.get(&inner_name).map(|e| *e) {
            Self::install_into_ref(tr, found, self.class(found).flat_name.clone());
            tr.kind = TypeRefKind::Failable;
            return Ok(());
        }

        let flat_name: Arc<str> = format!("0Failable_{}", self.new_unique_id()).into();
        let id = self.new_class(flat_name.clone());
        let mut wrapped = tr.clone();
        wrapped.kind = TypeRefKind::Normal;
        {
            let class = self.class_mut(id);
            class.special = SpecialClass::Failable;
            class.flags |= ClassFlags::COMPILER_GENERATED | ClassFlags::VALUETYPE;
            class.wrapped = Some(wrapped.clone());
        }
        self.failable_cache.insert(inner_name, id);

        let error_ref = self.class_ref(self.error_class());

        // Field order is load-bearing: the error pointer comes first, the
        // wrapped value after it.
        self.class_mut(id).instance_fields = vec![
            Field::new("m_error", error_ref.clone()),
            Field::new("m_value", wrapped.clone()),
        ];

        let self_ref = self.class_ref(id);
        let bool_ref = self.resolved_prim_ref(PrimType::Bool);

        let from_value = self.new_method(
            id,
            "createFromValue",
            Signature::new(vec![Param::new("_soX_value", wrapped.clone())], self_ref.clone()),
        );
        self.method_mut(from_value).body =
            MethodBody::CText("self.m_value = l__soX_value;\n".into());
        self.register_instance_ctor(id, from_value);

        let from_error = self.new_method(
            id,
            "createFromError",
            Signature::new(vec![Param::new("_soX_value", error_ref.clone())], self_ref),
        );
        self.method_mut(from_error).body =
            MethodBody::CText("self.m_error = l__soX_value;\n".into());
        self.register_instance_ctor(id, from_error);

        let success = self.new_method(id, "success", Signature::new(vec![], bool_ref));
        self.method_mut(success).body = MethodBody::CText("return self.m_error == 0;\n".into());
        self.register_instance_method(id, success);

        // unwrap aborts through the failable-failure path when the error is
        // set; `_soX_abort_e` falls back to code 4 for message-less errors.
        let unwrap_m = self.new_method(id, "unwrap", Signature::new(vec![], wrapped));
        self.method_mut(unwrap_m).body = MethodBody::CText(
            "if(self.m_error) _soX_abort_e(self.m_error);\nreturn self.m_value;\n".into(),
        );
        self.register_instance_method(id, unwrap_m);

        let error_m = self.new_method(id, "error", Signature::new(vec![], error_ref));
        self.method_mut(error_m).body = MethodBody::CText("return self.m_error;\n".into());
        self.register_instance_method(id, error_m);

        self.link_class(id)?;
        trace!("synthesized failable class {}", flat_name);
        Self::install_into_ref(tr, id, flat_name);
        tr.kind = TypeRefKind::Failable;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Foreign-proxy synthesis.
    // ------------------------------------------------------------------

    fn resolve_foreign_proxy(&mut self, tr: &mut TypeRef) -> ResolveResult<()> {
        let inner = tr.resolved.ok_or(ResolveError::ForeignValueType)?;
        if self.class(inner).special == SpecialClass::Foreign {
            return Ok(());
        }
        if inner == self.string_class() {
            return Err(ResolveError::ForeignString);
        }

        let inner_name = self.class(inner).flat_name.clone();
        if let Some(found) = self.foreign_cache.get(&inner_name).map(|e| *e) {
            Self::install_into_ref(tr, found, self.class(found).flat_name.clone());
            tr.kind = TypeRefKind::Foreign;
            return Ok(());
        }

        if self.class(inner).is_value_type() {
            return Err(ResolveError::ForeignValueType);
        }
        if self.class(inner).is_static() {
            return Err(ResolveError::ForeignStatic);
        }
        if self.class(inner).struct_def.is_some()
            || self.class(inner).special == SpecialClass::BinaryBlob
        {
            return Err(ResolveError::ForeignNativeLayout);
        }

        self.finalize_methods(inner)?;

        let flat_name: Arc<str> = format!("0Foreign_{}", self.new_unique_id()).into();
        let id = self.new_class(flat_name.clone());
        let mut base_ref = tr.clone();
        base_ref.kind = TypeRefKind::Normal;
        {
            let class = self.class_mut(id);
            class.flags |= ClassFlags::COMPILER_GENERATED;
            class.special = SpecialClass::Foreign;
            // Inheriting from the wrapped class keeps the proxy
            // vtable-compatible with it.
            class.base = Some(base_ref.clone());
            class.wrapped = Some(base_ref);
        }
        self.foreign_cache.insert(inner_name, id);

        // Field layout is mirrored by the runtime's proxy header: a domain
        // handle and the exported-object name.
        let handle_ref = self.class_ref(self.any_class());
        let string_ref = self.class_ref(self.string_class());
        self.class_mut(id).instance_fields = vec![
            Field::new("m_hdomain", handle_ref).private(),
            Field::new("m_name", string_ref).private(),
        ];

        // Synchronous method wrappers; bodies are synthesized by the
        // emitter as client stubs that pack a domain message.
        for input_mid in self.class(inner).instance_methods.clone() {
            let input = self.method(input_mid);
            let name = input.name.clone();
            let mut params = Vec::with_capacity(input.sig.params.len());
            for (j, p) in input.sig.params.iter().enumerate() {
                let pname: Arc<str> = if p.name.is_empty() {
                    format!("_soX_param_{}", j).into()
                } else {
                    p.name.clone()
                };
                params.push(Param::new(pname, p.ty.clone()));
            }
            let sig = Signature::new(params, input.sig.ret.clone());
            let mid = self.new_method(id, name, sig);
            self.method_mut(mid).special = SpecialMethod::ForeignSync;
            self.register_instance_method(id, mid);
        }

        self.link_class(id)?;
        trace!("synthesized foreign proxy {}", flat_name);
        Self::install_into_ref(tr, id, flat_name);
        tr.kind = TypeRefKind::Foreign;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Boxed synthesis. Unlike the other shapes this may run lazily, from
    // reflection, after the main link; callers serialize through the
    // emitter lock.
    // ------------------------------------------------------------------

    pub fn boxed_class(&mut self, tr: &TypeRef, must_exist: bool) -> ResolveResult<ClassId> {
        let inner = tr
            .resolved
            .ok_or_else(|| ResolveError::UnknownClass("<unresolved>".into()))?;
        if !self.class(inner).is_value_type() {
            return Err(ResolveError::BoxedNonValueType(
                self.class(inner).flat_name.to_string(),
            ));
        }

        let inner_name = self.class(inner).flat_name.clone();
        if let Some(found) = self.boxed_cache.get(&inner_name).map(|e| *e) {
            return Ok(found);
        }
        if must_exist {
            return Err(ResolveError::BoxedMissing(inner_name.to_string()));
        }

        self.finalize_methods(inner)?;

        let flat_name: Arc<str> = format!("0Boxed_{}", self.new_unique_id()).into();
        let id = self.new_class(flat_name.clone());
        {
            let class = self.class_mut(id);
            class.flags |= ClassFlags::COMPILER_GENERATED | ClassFlags::FREE_VTABLE;
            class.special = SpecialClass::Boxed;
            class.wrapped = Some(tr.clone());
        }
        self.boxed_cache.insert(inner_name, id);

        // The embedded value sits right after the vtable.
        self.class_mut(id).instance_fields = vec![Field::new("m_value", tr.clone())];

        let self_ref = self.class_ref(id);
        let ctor = self.new_method(
            id,
            "create",
            Signature::new(vec![Param::new("_soX_value", tr.clone())], self_ref),
        );
        self.method_mut(ctor).special = SpecialMethod::BoxedCtor;
        self.register_instance_ctor(id, ctor);

        // Forward the wrapped class's methods, except operators whose first
        // parameter is the value type itself: comparing a by-ref box to a
        // bare value makes no sense through an interface.
        for input_mid in self.class(inner).instance_methods.clone() {
            let input = self.method(input_mid);
            if input.name.starts_with("op_") {
                continue;
            }
            let name = input.name.clone();
            let mut params = Vec::with_capacity(input.sig.params.len());
            for (j, p) in input.sig.params.iter().enumerate() {
                let pname: Arc<str> = if p.name.is_empty() {
                    format!("_soX_param_{}", j).into()
                } else {
                    p.name.clone()
                };
                params.push(Param::new(pname, p.ty.clone()));
            }
            let sig = Signature::new(params, input.sig.ret.clone());
            let mid = self.new_method(id, name, sig);
            self.method_mut(mid).special = SpecialMethod::BoxedMethod;
            self.register_instance_method(id, mid);
        }

        // Boxed classes can be created dynamically, so vtable indices and
        // the layout must be ready immediately.
        self.link_class(id)?;
        trace!("synthesized boxed class {}", flat_name);
        Ok(id)
    }

    fn install_into_ref(tr: &mut TypeRef, id: ClassId, flat_name: Arc<str>) {
        tr.array_level = 0;
        tr.prim = PrimType::Object;
        tr.class_name = Some(flat_name);
        tr.resolved = Some(id);
        tr.kind = TypeRefKind::Normal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_resolution_folds_spelling() {
        let mut registry = Registry::new();
        let mut tr = TypeRef::array_of(TypeRef::prim(PrimType::Int), 1);
        registry.resolve_type_ref(&mut tr).unwrap();

        assert_eq!(tr.kind, TypeRefKind::Normal);
        assert_eq!(tr.array_level, 0);
        assert_eq!(tr.prim, PrimType::Object);
        let class = registry.class(tr.resolved.unwrap());
        assert_eq!(class.special, SpecialClass::Array);
        assert!(class.flat_name.starts_with("0Array_"));
        assert_eq!(registry.nice_name(class.id).as_ref(), "[int]");

        // Same spelling resolves to the same cached class.
        let mut tr2 = TypeRef::array_of(TypeRef::prim(PrimType::Int), 1);
        registry.resolve_type_ref(&mut tr2).unwrap();
        assert_eq!(tr.resolved, tr2.resolved);
    }

    #[test]
    fn test_nested_arrays_synthesize_per_level() {
        let mut registry = Registry::new();
        let mut tr = TypeRef::array_of(TypeRef::prim(PrimType::Int), 2);
        registry.resolve_type_ref(&mut tr).unwrap();
        let outer = registry.class(tr.resolved.unwrap());
        let inner = outer.wrapped.as_ref().and_then(|w| w.resolved).unwrap();
        assert_eq!(registry.class(inner).special, SpecialClass::Array);
        assert_eq!(registry.nice_name(tr.resolved.unwrap()).as_ref(), "[[int]]");
    }

    #[test]
    fn test_array_accessors_exist() {
        let mut registry = Registry::new();
        let mut tr = TypeRef::array_of(TypeRef::prim(PrimType::Int), 1);
        registry.resolve_type_ref(&mut tr).unwrap();
        let id = tr.resolved.unwrap();
        let get = registry.instance_method_by_name(id, "get").unwrap();
        assert!(matches!(registry.method(get).body, MethodBody::CText(_)));
        assert!(registry.instance_method_by_name(id, "set").is_some());
        assert!(registry.instance_method_by_name(id, "length").is_some());
    }

    #[test]
    fn test_failable_layout_and_methods() {
        let mut registry = Registry::new();
        let mut tr = TypeRef::failable_of(TypeRef::prim(PrimType::Int));
        registry.resolve_type_ref(&mut tr).unwrap();
        let id = tr.resolved.unwrap();
        let class = registry.class(id);

        assert_eq!(class.special, SpecialClass::Failable);
        assert!(class.is_value_type());
        // Error pointer first, value second.
        assert_eq!(&*class.instance_fields[0].name, "m_error");
        assert_eq!(class.instance_fields[0].offset, 0);
        assert_eq!(&*class.instance_fields[1].name, "m_value");
        assert_eq!(class.instance_fields[1].offset, PTR_SIZE);
        assert_eq!(class.gc.map, vec![0]);
        assert!(registry.instance_method_by_name(id, "unwrap").is_some());
        assert!(registry.instance_method_by_name(id, "success").is_some());
        assert_eq!(registry.nice_name(id).as_ref(), "int?");
    }

    #[test]
    fn test_foreign_proxy_rejects_strings_and_valuetypes() {
        let mut registry = Registry::new();
        let mut s = TypeRef::foreign_of(TypeRef::object("string"));
        assert_eq!(
            registry.resolve_type_ref(&mut s),
            Err(ResolveError::ForeignString)
        );

        let mut v = TypeRef::foreign_of(TypeRef::prim(PrimType::Int));
        assert_eq!(
            registry.resolve_type_ref(&mut v),
            Err(ResolveError::ForeignValueType)
        );
    }

    #[test]
    fn test_foreign_proxy_copies_methods() {
        let mut registry = Registry::new();
        let svc = registry.new_class("Service");
        let ping = registry.new_method(
            svc,
            "ping",
            Signature::new(vec![], registry.resolved_prim_ref(PrimType::Int)),
        );
        registry.register_instance_method(svc, ping);

        let mut tr = TypeRef::foreign_of(TypeRef::object("Service"));
        registry.resolve_type_ref(&mut tr).unwrap();
        let proxy = tr.resolved.unwrap();
        let class = registry.class(proxy);

        assert_eq!(class.special, SpecialClass::Foreign);
        assert_eq!(&*class.instance_fields[0].name, "m_hdomain");
        assert_eq!(&*class.instance_fields[1].name, "m_name");
        let proxy_ping = registry.instance_method_by_name(proxy, "ping").unwrap();
        assert_eq!(
            registry.method(proxy_ping).special,
            SpecialMethod::ForeignSync
        );
        // Proxy inherits from the target for vtable compatibility.
        assert!(registry.is_subclass_of(proxy, svc));
    }

    #[test]
    fn test_boxed_class_skips_operators() {
        let mut registry = Registry::new();
        let int_ref = registry.resolved_prim_ref(PrimType::Int);
        let int_class = int_ref.resolved.unwrap();

        let to_string = registry.new_method(
            int_class,
            "toString",
            Signature::new(vec![], registry.class_ref(registry.string_class())),
        );
        registry.register_instance_method(int_class, to_string);
        let op_add = registry.new_method(
            int_class,
            "op_add",
            Signature::new(vec![Param::new("other", int_ref.clone())], int_ref.clone()),
        );
        registry.register_instance_method(int_class, op_add);

        let boxed = registry.boxed_class(&int_ref, false).unwrap();
        assert_eq!(registry.class(boxed).special, SpecialClass::Boxed);
        assert!(registry.instance_method_by_name(boxed, "toString").is_some());
        assert!(registry.instance_method_by_name(boxed, "op_add").is_none());
        // Cached: second request must not synthesize again.
        assert_eq!(registry.boxed_class(&int_ref, true).unwrap(), boxed);
        let class = registry.class(boxed);
        // The wrapped value is embedded right after the vtable.
        assert_eq!(class.instance_fields[0].offset, PTR_SIZE);
        assert_eq!(class.gc.content_size, 2 * PTR_SIZE);
    }

    #[test]
    fn test_alias_redirection() {
        let mut registry = Registry::new();
        let alias = registry.new_class("Number");
        registry.class_mut(alias).special = SpecialClass::Alias;
        registry.class_mut(alias).wrapped = Some(TypeRef::prim(PrimType::Int));

        let mut tr = TypeRef::object("Number");
        registry.resolve_type_ref(&mut tr).unwrap();
        assert_eq!(tr.resolved, Some(registry.prim_class(PrimType::Int)));
    }

    #[test]
    fn test_unknown_class_fails() {
        let mut registry = Registry::new();
        let mut tr = TypeRef::object("Ghost");
        assert_eq!(
            registry.resolve_type_ref(&mut tr),
            Err(ResolveError::UnknownClass("Ghost".into()))
        );
    }
}
