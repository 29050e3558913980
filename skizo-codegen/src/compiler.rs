// The in-process C compiler contract. The actual compiler (a TCC-like
// embeddable backend with executable memory allocation) is an external
// collaborator; the core only composes translation units and resolves
// symbols through this trait.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("C compilation failed: {0}")]
    Backend(String),
    #[error("missing symbol `{0}` in compiled unit")]
    MissingSymbol(String),
}

pub type CompileResult<T> = Result<T, CompileError>;

/// A compiled translation unit. Function pointers stay valid until the unit
/// is dropped, which the owning domain does only at teardown.
pub trait CompiledUnit: Send {
    /// Raw code pointer for an external symbol, or `None` when absent.
    fn symbol(&self, name: &str) -> Option<usize>;
}

/// An embeddable C compiler producing in-memory executable code.
pub trait NativeCompiler: Send {
    fn compile(&mut self, unit_text: &str) -> CompileResult<Box<dyn CompiledUnit>>;
}

/// A compiler backed by a pre-registered symbol table. Embedders use it to
/// wire natively implemented method bodies (and tests use it to stand in
/// for the real backend); the unit text is retained for inspection.
#[derive(Default)]
pub struct TableCompiler {
    symbols: HashMap<String, usize>,
    units: Vec<String>,
}

impl TableCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_symbol(&mut self, name: impl Into<String>, addr: usize) {
        self.symbols.insert(name.into(), addr);
    }

    /// Every unit text handed to `compile`, oldest first.
    pub fn units(&self) -> &[String] {
        &self.units
    }
}

struct TableUnit {
    symbols: HashMap<String, usize>,
}

impl CompiledUnit for TableUnit {
    fn symbol(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }
}

impl NativeCompiler for TableCompiler {
    fn compile(&mut self, unit_text: &str) -> CompileResult<Box<dyn CompiledUnit>> {
        self.units.push(unit_text.to_string());
        Ok(Box::new(TableUnit {
            symbols: self.symbols.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_compiler_serves_symbols() {
        let mut compiler = TableCompiler::new();
        compiler.define_symbol("_so_Program_main", 0x1234);
        let unit = compiler.compile("int main;").unwrap();
        assert_eq!(unit.symbol("_so_Program_main"), Some(0x1234));
        assert_eq!(unit.symbol("_so_Missing_fn"), None);
        assert_eq!(compiler.units().len(), 1);
    }
}
