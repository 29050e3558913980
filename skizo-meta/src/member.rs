// Non-method class members: fields, constants, attributes.

use std::sync::Arc;

use crate::ids::MethodId;
use crate::typeref::TypeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessModifier {
    #[default]
    Public,
    Private,
    Protected,
    Internal,
}

/// What a name in a class's name set refers to. Used for collision checks
/// and identifier resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    InstanceField,
    StaticField,
    InstanceMethod,
    StaticMethod,
    Ctor,
    Const,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: Arc<str>,
    pub ty: TypeRef,
    pub access: AccessModifier,
    /// Byte offset inside the object layout; assigned by the linker.
    pub offset: usize,
    /// Marked with `[event]`; the linker wires handler-array creation.
    pub is_event: bool,
}

impl Field {
    pub fn new(name: impl Into<Arc<str>>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            access: AccessModifier::Public,
            offset: 0,
            is_event: false,
        }
    }

    pub fn private(mut self) -> Self {
        self.access = AccessModifier::Private;
        self
    }
}

#[derive(Debug, Clone)]
pub enum ConstValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Char(u16),
    Str(Arc<str>),
}

#[derive(Debug, Clone)]
pub struct Const {
    pub name: Arc<str>,
    pub ty: TypeRef,
    pub value: ConstValue,
}

/// `[name=value]` metadata attached to classes and methods. Values are
/// stored as written; typed readers parse on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: Arc<str>,
    pub value: Arc<str>,
}

impl Attribute {
    pub fn new(name: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A getter/setter pair matched by name convention (`foo` / `setFoo`).
/// Properties are an emergent phenomenon: no dedicated metadata exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub getter: MethodId,
    pub setter: Option<MethodId>,
}

/// Attribute names with wired-in semantics.
pub mod well_known_attrs {
    /// Forces a value type to be an opaque blob of N bytes.
    pub const NATIVE_SIZE: &str = "nativeSize";
    /// Requests accessor synthesis from the parser.
    pub const PROPERTY: &str = "property";
    pub const EVENT: &str = "event";
    /// Emits a ctor/dtor pair around embedder-supplied `_so_%CLASS%_ctorImpl`.
    pub const PTR_WRAPPER: &str = "ptrWrapper";
}
