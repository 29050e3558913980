// Per-domain class/method arena. Append-only: ids handed out stay valid for
// the domain's lifetime, and `Box` keeps class addresses stable so emitted
// code can hold raw metadata pointers.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use log::trace;

use crate::class::{Class, ClassFlags, GcInfo, SpecialClass};
use crate::ids::{ClassId, MethodId};
use crate::member::MemberKind;
use crate::method::{Method, MethodKind, Signature};
use crate::typeref::{PrimType, TypeRef};

pub const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// Cache key for synthesized array classes: the pre-resolution spelling of
/// the array reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ArrayKey {
    pub prim: PrimType,
    pub name: Option<Arc<str>>,
    pub level: u32,
}

impl ArrayKey {
    pub fn of(tr: &TypeRef) -> Self {
        Self {
            prim: tr.prim,
            name: tr.class_name.clone(),
            level: tr.array_level,
        }
    }
}

pub struct Registry {
    classes: Vec<Box<Class>>,
    methods: Vec<Box<Method>>,
    by_flat_name: HashMap<Arc<str>, ClassId>,
    prim_map: HashMap<PrimType, ClassId>,

    // Synthesized-class caches. Concurrent maps because boxed classes can be
    // created lazily from reflection while the emitter lock is held.
    pub(crate) array_cache: DashMap<ArrayKey, ClassId>,
    pub(crate) failable_cache: DashMap<Arc<str>, ClassId>,
    pub(crate) boxed_cache: DashMap<Arc<str>, ClassId>,
    pub(crate) foreign_cache: DashMap<Arc<str>, ClassId>,
    nice_name_cache: DashMap<Arc<str>, ClassId>,

    unique_counter: u32,

    string_class: Option<ClassId>,
    error_class: Option<ClassId>,
    any_class: Option<ClassId>,
    type_class: Option<ClassId>,
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Self {
            classes: Vec::new(),
            methods: Vec::new(),
            by_flat_name: HashMap::new(),
            prim_map: HashMap::new(),
            array_cache: DashMap::new(),
            failable_cache: DashMap::new(),
            boxed_cache: DashMap::new(),
            foreign_cache: DashMap::new(),
            nice_name_cache: DashMap::new(),
            unique_counter: 0,
            string_class: None,
            error_class: None,
            any_class: None,
            type_class: None,
        };
        registry.install_builtins();
        registry
    }

    // ------------------------------------------------------------------
    // Arena access.
    // ------------------------------------------------------------------

    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.index()]
    }

    pub fn class_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id.index()]
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self.methods[id.index()]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut Method {
        &mut self.methods[id.index()]
    }

    /// Stable address of the class metadata, for embedding into emitted code
    /// and into vtable slot 0.
    pub fn class_ptr(&self, id: ClassId) -> *const Class {
        &*self.classes[id.index()]
    }

    /// Reverse of `class_ptr`. Callers guarantee the pointer came from this
    /// registry; used by the GC reading vtable slot 0.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by `class_ptr`.
    pub unsafe fn class_from_ptr<'a>(ptr: *const Class) -> &'a Class {
        &*ptr
    }

    /// Stable address of method metadata, for embedding into emitted code
    /// (interface call sites, remoting stubs).
    pub fn method_ptr(&self, id: MethodId) -> *const Method {
        &*self.methods[id.index()]
    }

    /// # Safety
    /// `ptr` must be a pointer previously returned by `method_ptr`.
    pub unsafe fn method_from_ptr<'a>(ptr: *const Method) -> &'a Method {
        &*ptr
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn class_ids(&self) -> impl Iterator<Item = ClassId> {
        (0..self.classes.len() as u32).map(ClassId)
    }

    pub fn new_unique_id(&mut self) -> u32 {
        self.unique_counter += 1;
        self.unique_counter
    }

    // ------------------------------------------------------------------
    // Creation & lookup.
    // ------------------------------------------------------------------

    pub fn new_class(&mut self, flat_name: impl Into<Arc<str>>) -> ClassId {
        let flat_name: Arc<str> = flat_name.into();
        let id = ClassId(self.classes.len() as u32);
        debug_assert!(
            !self.by_flat_name.contains_key(&flat_name),
            "duplicate class name {flat_name}"
        );
        self.classes.push(Box::new(Class::new(id, flat_name.clone())));
        self.by_flat_name.insert(flat_name, id);
        id
    }

    pub fn class_by_name(&self, flat_name: &str) -> Option<ClassId> {
        self.by_flat_name.get(flat_name).copied()
    }

    pub fn prim_class(&self, prim: PrimType) -> ClassId {
        self.prim_map[&prim]
    }

    pub fn string_class(&self) -> ClassId {
        self.string_class.unwrap_or(ClassId(0))
    }

    pub fn error_class(&self) -> ClassId {
        self.error_class.unwrap_or(ClassId(0))
    }

    pub fn any_class(&self) -> ClassId {
        self.any_class.unwrap_or(ClassId(0))
    }

    pub fn type_class(&self) -> ClassId {
        self.type_class.unwrap_or(ClassId(0))
    }

    /// The user-visible name: `[int]` for arrays, `int?` for failables,
    /// `Obj*` for foreign proxies, the wrapped name for boxed classes.
    pub fn nice_name(&self, id: ClassId) -> Arc<str> {
        let class = self.class(id);
        if let Some(name) = class.nice_name.get() {
            return name.clone();
        }
        let computed: Arc<str> = match class.special {
            SpecialClass::Array => {
                let inner = self.wrapped_nice_name(class);
                format!("[{}]", inner).into()
            }
            SpecialClass::Failable => {
                let inner = self.wrapped_nice_name(class);
                format!("{}?", inner).into()
            }
            SpecialClass::Foreign => {
                let inner = self.wrapped_nice_name(class);
                format!("{}*", inner).into()
            }
            SpecialClass::Boxed => self.wrapped_nice_name(class),
            _ => class.flat_name.clone(),
        };
        let name = class.nice_name.get_or_init(|| computed).clone();
        self.nice_name_cache.insert(name.clone(), id);
        name
    }

    fn wrapped_nice_name(&self, class: &Class) -> Arc<str> {
        match class.wrapped.as_ref().and_then(|w| w.resolved) {
            Some(inner) => self.nice_name(inner),
            None => class.flat_name.clone(),
        }
    }

    /// The synthesized foreign-proxy class for a target class, if one was
    /// resolved in this domain.
    pub fn foreign_proxy_for(&self, class: ClassId) -> Option<ClassId> {
        let name = self.class(class).flat_name.clone();
        self.foreign_cache.get(&name).map(|e| *e)
    }

    /// The synthesized boxed class for a value type, if already created.
    pub fn boxed_class_for(&self, class: ClassId) -> Option<ClassId> {
        let name = self.class(class).flat_name.clone();
        self.boxed_cache.get(&name).map(|e| *e)
    }

    /// Reflection-facing lookup by nice name. Falls back to a scan the first
    /// time a synthesized name is requested.
    pub fn class_by_nice_name(&self, name: &str) -> Option<ClassId> {
        if let Some(found) = self.nice_name_cache.get(name) {
            return Some(*found);
        }
        if let Some(id) = self.class_by_name(name) {
            return Some(id);
        }
        self.class_ids().find(|&id| &*self.nice_name(id) == name)
    }

    // ------------------------------------------------------------------
    // Member registration. Routed through the registry because methods
    // live in the shared arena.
    // ------------------------------------------------------------------

    pub fn new_method(
        &mut self,
        declaring_class: ClassId,
        name: impl Into<Arc<str>>,
        sig: Signature,
    ) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        self.methods
            .push(Box::new(Method::new(id, declaring_class, name.into(), sig)));
        id
    }

    pub fn register_instance_method(&mut self, class: ClassId, method: MethodId) {
        let name = self.method(method).name.clone();
        let c = self.class_mut(class);
        c.name_set.insert(name, MemberKind::InstanceMethod);
        c.instance_methods.push(method);
    }

    pub fn register_static_method(&mut self, class: ClassId, method: MethodId) {
        let name = self.method(method).name.clone();
        self.method_mut(method).sig.is_static = true;
        let c = self.class_mut(class);
        c.name_set.insert(name, MemberKind::StaticMethod);
        c.static_methods.push(method);
    }

    pub fn register_instance_ctor(&mut self, class: ClassId, method: MethodId) {
        let name = self.method(method).name.clone();
        self.method_mut(method).kind = MethodKind::Ctor;
        let c = self.class_mut(class);
        c.name_set.insert(name, MemberKind::Ctor);
        c.instance_ctors.push(method);
    }

    /// Finds an instance method by name; the method list must be finalized
    /// so inherited methods are visible.
    pub fn instance_method_by_name(&self, class: ClassId, name: &str) -> Option<MethodId> {
        self.class(class)
            .instance_methods
            .iter()
            .copied()
            .find(|&m| &*self.method(m).name == name)
    }

    pub fn static_method_by_name(&self, class: ClassId, name: &str) -> Option<MethodId> {
        let c = self.class(class);
        c.static_methods
            .iter()
            .chain(c.instance_ctors.iter())
            .copied()
            .find(|&m| &*self.method(m).name == name)
    }

    /// Mirrors member resolution used by templates: instance methods of the
    /// given kind only.
    pub fn my_method(&self, class: ClassId, name: &str, kind: MethodKind) -> Option<MethodId> {
        self.class(class)
            .instance_methods
            .iter()
            .copied()
            .find(|&m| {
                let method = self.method(m);
                &*method.name == name && method.kind == kind
            })
    }

    // ------------------------------------------------------------------
    // Relationship checks.
    // ------------------------------------------------------------------

    pub fn is_subclass_of(&self, class: ClassId, other: ClassId) -> bool {
        let mut cursor = self.class(class).base.as_ref().and_then(|b| b.resolved);
        while let Some(base) = cursor {
            if base == other {
                return true;
            }
            cursor = self.class(base).base.as_ref().and_then(|b| b.resolved);
        }
        false
    }

    /// Structural interface check: every interface method must be matched by
    /// an instance method with the same name and signature. Cached.
    pub fn does_implement_interface(&self, class: ClassId, iface: ClassId) -> bool {
        if let Some(hit) = self.class(class).iface_check_cache.get(&iface) {
            return *hit;
        }
        let result = self.does_implement_interface_no_cache(class, iface);
        self.class(class).iface_check_cache.insert(iface, result);
        result
    }

    pub fn does_implement_interface_no_cache(&self, class: ClassId, iface: ClassId) -> bool {
        if !self.class(iface).is_interface() {
            return false;
        }
        for &iface_method in &self.class(iface).instance_methods {
            let im = self.method(iface_method);
            let matched = self.instance_method_by_name(class, &im.name);
            match matched {
                Some(own) if self.method(own).sig.matches(&im.sig) => {}
                _ => return false,
            }
        }
        true
    }

    /// Assignability as used by `downcast` and `is`: identity, upcast,
    /// downcast-checked subclassing, or interface implementation.
    pub fn is_assignable(&self, from: ClassId, to: ClassId) -> bool {
        if from == to {
            return true;
        }
        if to == self.any_class() {
            return true;
        }
        if self.class(to).is_interface() {
            return self.does_implement_interface(from, to);
        }
        self.is_subclass_of(from, to)
    }

    // ------------------------------------------------------------------
    // Built-in classes. The shapes mirror the intrinsic object headers the
    // runtime defines; keep them in sync.
    // ------------------------------------------------------------------

    fn install_builtins(&mut self) {
        for (prim, name) in [
            (PrimType::Void, "void"),
            (PrimType::Int, "int"),
            (PrimType::Float, "float"),
            (PrimType::Bool, "bool"),
            (PrimType::Char, "char"),
            (PrimType::IntPtr, "intptr"),
        ] {
            let id = self.new_class(name);
            let size = prim.byte_size();
            let class = self.class_mut(id);
            class.prim = prim;
            class.flags |= ClassFlags::VALUETYPE
                | ClassFlags::METHODLIST_FINALIZED
                | ClassFlags::SIZE_CALCULATED;
            class.gc = GcInfo {
                map: Vec::new(),
                content_size: size,
                size_for_use: size,
            };
            self.prim_map.insert(prim, id);
        }

        // `any`: the root interface every class is assignable to.
        let any = self.new_class("any");
        {
            let class = self.class_mut(any);
            class.special = SpecialClass::Interface;
            class.flags |=
                ClassFlags::ABSTRACT | ClassFlags::METHODLIST_FINALIZED | ClassFlags::SIZE_CALCULATED;
            class.gc.size_for_use = PTR_SIZE;
        }
        self.any_class = Some(any);

        // `string`: wraps a reference-counted immutable UTF-16 buffer that
        // is not a GC object, hence the verbatim struct def and empty map.
        let string = self.new_class("string");
        {
            let class = self.class_mut(string);
            class.struct_def = Some("void** _soX_vtable;\nvoid* _soX_pstr;\n".into());
            class.flags |= ClassFlags::METHODLIST_FINALIZED | ClassFlags::SIZE_CALCULATED;
            class.gc = GcInfo {
                map: Vec::new(),
                content_size: 2 * PTR_SIZE,
                size_for_use: PTR_SIZE,
            };
        }
        self.string_class = Some(string);

        // `Error`: a message string, GC-visible.
        let error = self.new_class("Error");
        {
            let class = self.class_mut(error);
            class.struct_def = Some("void** _soX_vtable;\nstruct _so_string* m_message;\n".into());
            class.flags |= ClassFlags::METHODLIST_FINALIZED | ClassFlags::SIZE_CALCULATED;
            class.gc = GcInfo {
                map: vec![PTR_SIZE],
                content_size: 2 * PTR_SIZE,
                size_for_use: PTR_SIZE,
            };
        }
        self.error_class = Some(error);

        // `DomainHandle`: wraps the host-side gateway to another domain.
        // The wrapped pointer is host-owned, not a GC reference.
        let handle = self.new_class("DomainHandle");
        {
            let class = self.class_mut(handle);
            class.struct_def = Some("void** _soX_vtable;\nvoid* _soX_wrapped;\n".into());
            class.flags |= ClassFlags::METHODLIST_FINALIZED | ClassFlags::SIZE_CALCULATED;
            class.gc = GcInfo {
                map: Vec::new(),
                content_size: 2 * PTR_SIZE,
                size_for_use: PTR_SIZE,
            };
        }

        // `Type`: reflection wrapper around a class-metadata handle. The
        // handle is not a GC reference.
        let ty = self.new_class("Type");
        {
            let class = self.class_mut(ty);
            class.struct_def = Some("void** _soX_vtable;\nvoid* _soX_typeHandle;\n".into());
            class.flags |= ClassFlags::METHODLIST_FINALIZED | ClassFlags::SIZE_CALCULATED;
            class.gc = GcInfo {
                map: Vec::new(),
                content_size: 2 * PTR_SIZE,
                size_for_use: PTR_SIZE,
            };
        }
        self.type_class = Some(ty);

        trace!("installed {} builtin classes", self.classes.len());
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
