// Class metadata. Immutable after link except the runtime-installed caches
// (vtable, interface dispatch, reflection back-pointer), which are atomics
// so sealed classes can be read from the domain thread without locking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;
use dashmap::DashMap;
use skizo_diagnostics::SourceLoc;

use crate::ids::{ClassId, MethodId};
use crate::member::{AccessModifier, Attribute, Const, Field, MemberKind};
use crate::typeref::{PrimType, TypeRef};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        /// Copy semantics.
        const VALUETYPE = 1 << 0;
        const STATIC = 1 << 1;
        const ABSTRACT = 1 << 2;
        const COMPILER_GENERATED = 1 << 3;
        /// Method list includes inherited methods and vtable indices are
        /// assigned.
        const METHODLIST_FINALIZED = 1 << 4;
        const SIZE_CALCULATED = 1 << 5;
        const ATTRIBUTES_BORROWED = 1 << 6;
        /// Cleared when the static constructor aborts; checked accesses then
        /// raise the type-initialization error.
        const INITIALIZED = 1 << 7;
        /// The vtable is owned by the class, not by the compiled unit.
        const FREE_VTABLE = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpecialClass {
    #[default]
    None,
    Array,
    Failable,
    Foreign,
    Boxed,
    MethodClass,
    EventClass,
    Interface,
    /// `[nativeSize=N]` value types with an opaque layout.
    BinaryBlob,
    Alias,
    ClosureEnv,
}

/// Layout facts the collector needs per class.
#[derive(Debug, Clone, Default)]
pub struct GcInfo {
    /// Byte offsets inside the object that hold heap references.
    pub map: Vec<usize>,
    /// Total object size in bytes (header included for reference classes).
    pub content_size: usize,
    /// Slot size inside an array: pointer-sized for reference classes,
    /// content size for value types.
    pub size_for_use: usize,
}

#[derive(Debug)]
pub struct Class {
    pub id: ClassId,
    /// Internal, mangled name used by emitted code (`0Array_3`).
    pub flat_name: Arc<str>,
    pub prim: PrimType,
    pub special: SpecialClass,
    pub flags: ClassFlags,
    pub access: AccessModifier,
    pub base: Option<TypeRef>,
    /// Element type for arrays, value type for boxed, alias target, handler
    /// class for events, inner type for failables.
    pub wrapped: Option<TypeRef>,

    pub instance_fields: Vec<Field>,
    pub static_fields: Vec<Field>,
    pub instance_ctors: Vec<MethodId>,
    pub instance_methods: Vec<MethodId>,
    pub static_methods: Vec<MethodId>,
    pub instance_dtor: Option<MethodId>,
    pub static_ctor: Option<MethodId>,
    pub static_dtor: Option<MethodId>,
    pub consts: Vec<Const>,
    pub attributes: Vec<Attribute>,
    /// Interfaces this class declares. Structural checks may discover more.
    pub interfaces: Vec<TypeRef>,

    /// Verbatim C struct body; when set, the emitter uses it instead of the
    /// linker-computed field layout. Fields it declares are invisible to the
    /// GC map unless listed in `gc.map` by hand.
    pub struct_def: Option<Arc<str>>,
    pub source: SourceLoc,
    pub gc: GcInfo,
    /// Size in bytes of the per-class static storage block; laid out by the
    /// linker alongside the instance layout.
    pub static_size: usize,
    /// The invoke method of method classes.
    pub invoke_method: Option<MethodId>,

    pub(crate) name_set: HashMap<Arc<str>, MemberKind>,

    // Runtime caches; not part of the sealed metadata.
    vtable: AtomicUsize,
    runtime_type_obj: AtomicUsize,
    initialized: AtomicBool,
    /// interface method -> resolved code pointer, filled by `findmethod`.
    pub(crate) iface_ptr_cache: DashMap<MethodId, usize>,
    /// interface method -> implementing method, recorded by the linker.
    pub(crate) iface_impl_cache: DashMap<MethodId, MethodId>,
    /// interface class -> does this class implement it (structural check).
    pub(crate) iface_check_cache: DashMap<ClassId, bool>,
    pub(crate) nice_name: OnceLock<Arc<str>>,
}

impl Class {
    pub(crate) fn new(id: ClassId, flat_name: Arc<str>) -> Self {
        Self {
            id,
            flat_name,
            prim: PrimType::Object,
            special: SpecialClass::None,
            flags: ClassFlags::INITIALIZED,
            access: AccessModifier::Public,
            base: None,
            wrapped: None,
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            instance_ctors: Vec::new(),
            instance_methods: Vec::new(),
            static_methods: Vec::new(),
            instance_dtor: None,
            static_ctor: None,
            static_dtor: None,
            consts: Vec::new(),
            attributes: Vec::new(),
            interfaces: Vec::new(),
            struct_def: None,
            source: SourceLoc::unknown(),
            gc: GcInfo::default(),
            static_size: 0,
            invoke_method: None,
            name_set: HashMap::new(),
            vtable: AtomicUsize::new(0),
            runtime_type_obj: AtomicUsize::new(0),
            initialized: AtomicBool::new(true),
            iface_ptr_cache: DashMap::new(),
            iface_impl_cache: DashMap::new(),
            iface_check_cache: DashMap::new(),
            nice_name: OnceLock::new(),
        }
    }

    pub fn is_value_type(&self) -> bool {
        self.flags.contains(ClassFlags::VALUETYPE)
    }

    pub fn is_ref_type(&self) -> bool {
        !self.is_value_type() && self.prim == PrimType::Object
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(ClassFlags::STATIC)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(ClassFlags::ABSTRACT)
    }

    pub fn is_compiler_generated(&self) -> bool {
        self.flags.contains(ClassFlags::COMPILER_GENERATED)
    }

    pub fn is_method_list_finalized(&self) -> bool {
        self.flags.contains(ClassFlags::METHODLIST_FINALIZED)
    }

    pub fn is_size_calculated(&self) -> bool {
        self.flags.contains(ClassFlags::SIZE_CALCULATED)
    }

    pub fn is_interface(&self) -> bool {
        self.special == SpecialClass::Interface
    }

    /// Whether instances carry a vtable header. Value types embed bare
    /// bytes; everything heap-allocated dispatches through a vtable.
    pub fn has_vtable(&self) -> bool {
        !self.is_value_type() && self.prim == PrimType::Object && !self.is_static()
    }

    pub fn member_kind(&self, name: &str) -> Option<MemberKind> {
        self.name_set.get(name).copied()
    }

    /// The installed vtable (pointer to slot 0), or 0 before registration.
    pub fn vtable(&self) -> usize {
        self.vtable.load(Ordering::Acquire)
    }

    pub fn set_vtable(&self, vtable: usize) {
        self.vtable.store(vtable, Ordering::Release);
    }

    /// Reflection back-pointer to the GC-rooted `Type` object; set once.
    pub fn runtime_type_obj(&self) -> usize {
        self.runtime_type_obj.load(Ordering::Acquire)
    }

    pub fn set_runtime_type_obj(&self, obj: usize) {
        self.runtime_type_obj.store(obj, Ordering::Release);
    }

    /// False after the static constructor aborted.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::Release);
    }

    pub fn cached_iface_ptr(&self, iface_method: MethodId) -> Option<usize> {
        self.iface_ptr_cache.get(&iface_method).map(|e| *e)
    }

    pub fn cache_iface_ptr(&self, iface_method: MethodId, code_ptr: usize) {
        self.iface_ptr_cache.insert(iface_method, code_ptr);
    }

    pub fn linked_iface_impl(&self, iface_method: MethodId) -> Option<MethodId> {
        self.iface_impl_cache.get(&iface_method).map(|e| *e)
    }

    /// Reads a `[name=N]` integer attribute. `Err` when present but not an
    /// integer, `Ok(None)` when absent.
    pub fn int_attribute(&self, name: &str) -> Result<Option<i32>, String> {
        for attr in &self.attributes {
            if &*attr.name == name {
                return attr
                    .value
                    .parse::<i32>()
                    .map(Some)
                    .map_err(|_| format!("attribute [{}] expects an integer value", name));
            }
        }
        Ok(None)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| &*a.name == name)
    }
}
