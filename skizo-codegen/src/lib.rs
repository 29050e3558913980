//! Skizo code generator bridge: composes the C translation unit for a
//! closed class set (structs, vtable registration, method bodies, dynamic
//! invoker adapters) and hands it to the embedded C compiler behind the
//! [`NativeCompiler`] contract.

pub mod compiler;
pub mod emit;
pub mod mangle;

pub use compiler::{CompileError, CompileResult, CompiledUnit, NativeCompiler, TableCompiler};
pub use emit::{EmitEnv, EmitOptions, Emitter, MethodBodySource, NoTreeBodies};
