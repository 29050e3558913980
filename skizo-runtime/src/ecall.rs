// Process-wide ECall registry: named native functions callable from user
// code. A single-init singleton with an initialize/teardown pair driven by
// the embedder; domains consult it when installing native method bodies.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use log::trace;

fn registry() -> &'static RwLock<HashMap<String, usize>> {
    static ECALLS: OnceLock<RwLock<HashMap<String, usize>>> = OnceLock::new();
    ECALLS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers (or replaces) a native entry point. `ptr` must be an invoker
/// thunk following the uniform dynamic-call ABI.
pub fn register_ecall(name: impl Into<String>, ptr: usize) {
    let name = name.into();
    trace!("ecall registered: {}", name);
    registry()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name, ptr);
}

pub fn lookup_ecall(name: &str) -> Option<usize> {
    registry()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .copied()
}

/// Embedder teardown: clears every registration.
pub fn clear_ecalls() {
    registry()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}
