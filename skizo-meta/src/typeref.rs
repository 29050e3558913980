// Type references: the unresolved "spelling" of a type as the parser saw it,
// later closed to a concrete class by the resolver.

use std::sync::Arc;

use crate::ids::ClassId;

/// Primitive tag of a type reference or class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimType {
    Void,
    Int,
    Float,
    Bool,
    Char,
    IntPtr,
    Object,
}

impl PrimType {
    /// Natural width of a primitive value embedded in an object layout.
    pub fn byte_size(self) -> usize {
        match self {
            PrimType::Void => 0,
            PrimType::Int | PrimType::Float | PrimType::Bool => 4,
            PrimType::Char => 2,
            PrimType::IntPtr | PrimType::Object => std::mem::size_of::<usize>(),
        }
    }

    /// The C spelling used by the emitter for this primitive.
    pub fn c_name(self) -> &'static str {
        match self {
            PrimType::Void => "void",
            PrimType::Int => "int",
            PrimType::Float => "float",
            PrimType::Bool => "_so_bool",
            PrimType::Char => "_so_char",
            PrimType::IntPtr => "void*",
            PrimType::Object => "void*",
        }
    }
}

/// Failable (`T?`) and foreign (`T*`) spellings are folded into synthesized
/// classes during resolution; `Normal` is the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeRefKind {
    #[default]
    Normal,
    Failable,
    Foreign,
}

/// A mutable reference to a type. After `Registry::resolve_type_ref`
/// succeeds: `kind == Normal`, `array_level == 0` and `resolved` is set,
/// the original spelling having been folded into a synthesized class.
#[derive(Debug, Clone)]
pub struct TypeRef {
    pub kind: TypeRefKind,
    pub array_level: u32,
    pub prim: PrimType,
    pub class_name: Option<Arc<str>>,
    pub resolved: Option<ClassId>,
}

impl TypeRef {
    pub fn object(class_name: impl Into<Arc<str>>) -> Self {
        Self {
            kind: TypeRefKind::Normal,
            array_level: 0,
            prim: PrimType::Object,
            class_name: Some(class_name.into()),
            resolved: None,
        }
    }

    pub fn prim(prim: PrimType) -> Self {
        Self {
            kind: TypeRefKind::Normal,
            array_level: 0,
            prim,
            class_name: None,
            resolved: None,
        }
    }

    pub fn void() -> Self {
        Self::prim(PrimType::Void)
    }

    /// `[T]` with the given nesting level.
    pub fn array_of(mut inner: TypeRef, level: u32) -> Self {
        inner.array_level += level;
        inner
    }

    /// `T?`
    pub fn failable_of(mut inner: TypeRef) -> Self {
        inner.kind = TypeRefKind::Failable;
        inner
    }

    /// `T*`
    pub fn foreign_of(mut inner: TypeRef) -> Self {
        inner.kind = TypeRefKind::Foreign;
        inner
    }

    pub fn is_void(&self) -> bool {
        self.prim == PrimType::Void && self.array_level == 0
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }
}

/// Structural equality used for signature matching. Resolved references
/// compare by class identity; unresolved ones by spelling.
impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.resolved, other.resolved) {
            return a == b;
        }
        self.kind == other.kind
            && self.array_level == other.array_level
            && self.prim == other.prim
            && self.class_name == other.class_name
    }
}

impl Eq for TypeRef {}
