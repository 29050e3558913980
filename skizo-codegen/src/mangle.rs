// Symbol mangling shared by the emitter and the runtime installer. Flat
// class names are already C-safe (`0Array_3` style names are prefixed).

use skizo_meta::{ClassId, MethodId, Registry};

/// C struct tag for a class: `_so_<flat>`.
pub fn struct_name(registry: &Registry, class: ClassId) -> String {
    format!("_so_{}", registry.class(class).flat_name)
}

/// External symbol of a method body: `_so_<flat>_<method>`.
pub fn method_symbol(registry: &Registry, method: MethodId) -> String {
    let m = registry.method(method);
    format!(
        "_so_{}_{}",
        registry.class(m.declaring_class).flat_name,
        m.name
    )
}

/// Symbol of the uniform-ABI invoker adapter for a method.
pub fn invoker_symbol(registry: &Registry, method: MethodId) -> String {
    format!("_soXinv{}", method_symbol(registry, method))
}

/// Name of the static vtable array emitted for a class.
pub fn vtable_symbol(registry: &Registry, class: ClassId) -> String {
    format!("_soX_vtbl_{}", registry.class(class).flat_name)
}

/// The prolog function that registers vtables and patches string literals.
pub const PROLOG_SYMBOL: &str = "_soX_prolog";

#[cfg(test)]
mod tests {
    use super::*;
    use skizo_meta::{Signature, TypeRef};

    #[test]
    fn test_symbols() {
        let mut registry = Registry::new();
        let class = registry.new_class("Program");
        let main = registry.new_method(class, "main", Signature::statik(vec![], TypeRef::void()));
        assert_eq!(struct_name(&registry, class), "_so_Program");
        assert_eq!(method_symbol(&registry, main), "_so_Program_main");
        assert_eq!(invoker_symbol(&registry, main), "_soXinv_so_Program_main");
        assert_eq!(vtable_symbol(&registry, class), "_soX_vtbl_Program");
    }
}
