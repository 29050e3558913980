// Method metadata. A method owns its signature and body representation;
// machine-code pointers are installed by the runtime after compilation.

use std::any::Any;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use skizo_diagnostics::SourceLoc;

use crate::ids::{ClassId, MethodId};
use crate::member::{AccessModifier, Attribute};
use crate::typeref::TypeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodKind {
    #[default]
    Normal,
    Ctor,
    Dtor,
}

/// Methods the emitter treats specially instead of compiling a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpecialMethod {
    #[default]
    None,
    /// Implemented by a registered native entry point (an ECall).
    Native,
    /// Foreign-proxy wrapper: the emitter generates a client stub that packs
    /// arguments into a domain message and sends it synchronously.
    ForeignSync,
    /// Boxed-class constructor thunk.
    BoxedCtor,
    /// Boxed-class forwarder thunk.
    BoxedMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConv {
    #[default]
    Cdecl,
}

/// Binding of a method to a registered native function.
#[derive(Debug, Clone, Default)]
pub struct ECallDesc {
    pub call_conv: CallConv,
    pub entry_point: Option<Arc<str>>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Arc<str>,
    pub ty: TypeRef,
}

impl Param {
    pub fn new(name: impl Into<Arc<str>>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: TypeRef,
    pub is_static: bool,
}

impl Signature {
    pub fn new(params: Vec<Param>, ret: TypeRef) -> Self {
        Self {
            params,
            ret,
            is_static: false,
        }
    }

    pub fn statik(params: Vec<Param>, ret: TypeRef) -> Self {
        Self {
            params,
            ret,
            is_static: true,
        }
    }

    /// Parameter count, pairwise equal resolved parameter types, equal
    /// resolved return type. Staticness is checked by override matching,
    /// not here, mirroring how interface dispatch compares signatures.
    pub fn matches(&self, other: &Signature) -> bool {
        self.params.len() == other.params.len()
            && self.ret == other.ret
            && self
                .params
                .iter()
                .zip(other.params.iter())
                .all(|(a, b)| a.ty == b.ty)
    }
}

/// An expression tree produced by the external parser. The core never looks
/// inside; it hands the tree to the external body emitter.
pub type ExprTree = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
pub enum MethodBody {
    #[default]
    None,
    /// Literal C text supplied at class-synthesis time. Parameters are
    /// visible as `l_<name>`, the receiver as `self`.
    CText(Arc<str>),
    /// Parsed source body; compiled through the external emitter contract.
    Tree(ExprTree),
}

impl std::fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MethodBody::None => write!(f, "None"),
            MethodBody::CText(t) => write!(f, "CText({} bytes)", t.len()),
            MethodBody::Tree(_) => write!(f, "Tree(..)"),
        }
    }
}

#[derive(Debug)]
pub struct Method {
    pub id: MethodId,
    pub name: Arc<str>,
    pub kind: MethodKind,
    pub special: SpecialMethod,
    pub access: AccessModifier,
    pub declaring_class: ClassId,
    pub sig: Signature,
    pub body: MethodBody,
    pub ecall: ECallDesc,
    pub attributes: Vec<Attribute>,
    pub source: SourceLoc,

    /// Slot in the declaring class's vtable, or -1 for non-virtual methods.
    /// Assigned once by the linker; atomic so sealed metadata stays `Sync`.
    vtable_index: AtomicI32,

    /// Raw code pointer of the compiled body, installed by the runtime.
    native_ptr: AtomicUsize,
    /// Uniform-ABI invoker thunk used by reflection, templates and remoting.
    invoker_ptr: AtomicUsize,

    // Profiling counters, accumulated by the frame helpers.
    call_count: AtomicU64,
    total_time_ms: AtomicU64,
}

impl Method {
    pub(crate) fn new(id: MethodId, declaring_class: ClassId, name: Arc<str>, sig: Signature) -> Self {
        Self {
            id,
            name,
            kind: MethodKind::Normal,
            special: SpecialMethod::None,
            access: AccessModifier::Public,
            declaring_class,
            sig,
            body: MethodBody::None,
            ecall: ECallDesc::default(),
            attributes: Vec::new(),
            source: SourceLoc::unknown(),
            vtable_index: AtomicI32::new(-1),
            native_ptr: AtomicUsize::new(0),
            invoker_ptr: AtomicUsize::new(0),
            call_count: AtomicU64::new(0),
            total_time_ms: AtomicU64::new(0),
        }
    }

    pub fn vtable_index(&self) -> i32 {
        self.vtable_index.load(Ordering::Relaxed)
    }

    pub fn set_vtable_index(&self, index: i32) {
        self.vtable_index.store(index, Ordering::Relaxed);
    }

    pub fn native_ptr(&self) -> usize {
        self.native_ptr.load(Ordering::Relaxed)
    }

    pub fn set_native_ptr(&self, ptr: usize) {
        self.native_ptr.store(ptr, Ordering::Relaxed);
    }

    pub fn invoker_ptr(&self) -> usize {
        self.invoker_ptr.load(Ordering::Relaxed)
    }

    pub fn set_invoker_ptr(&self, ptr: usize) {
        self.invoker_ptr.store(ptr, Ordering::Relaxed);
    }

    pub fn add_calls(&self, n: u64) {
        self.call_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_total_time_ms(&self, delta: u64) {
        self.total_time_ms.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn total_time_ms(&self) -> u64 {
        self.total_time_ms.load(Ordering::Relaxed)
    }

    /// Property-like: zero parameters, non-void return, instance method.
    pub fn is_property_like(&self) -> bool {
        !self.sig.is_static && self.sig.params.is_empty() && !self.sig.ret.is_void()
    }

    /// Overriding requires a name+signature match with equal staticness.
    pub fn overrides(&self, base: &Method) -> bool {
        self.name == base.name
            && self.sig.is_static == base.sig.is_static
            && self.sig.matches(&base.sig)
    }
}
