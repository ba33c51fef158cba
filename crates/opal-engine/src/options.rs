//! Compiler options shared across the pipeline

use crate::parser::TypeTag;

/// Default heap size: 16 MiB.
pub const DEFAULT_HEAP_SIZE: usize = 0x100_0000;

/// Options consulted by type analysis, the baseline compiler, and the
/// runtime image builder.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Skip array bounds-checking code
    pub no_bounds_checks: bool,
    /// Print informative messages and machine code during runtime compilation
    pub debug_dynamic_compilation: bool,
    /// Storage type of array elements
    pub array_storage_type: TypeTag,
    /// Canonical parameter type for method calls
    pub method_call_param_type: TypeTag,
    /// Canonical return type for method calls
    pub method_call_return_type: TypeTag,
    /// Total heap size in bytes (split into two semispaces)
    pub heap_size: usize,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            no_bounds_checks: false,
            debug_dynamic_compilation: false,
            array_storage_type: TypeTag::Obj,
            method_call_param_type: TypeTag::Obj,
            method_call_return_type: TypeTag::Obj,
            heap_size: DEFAULT_HEAP_SIZE,
        }
    }
}

impl CompilerOptions {
    /// Options with `int`-typed array elements (the `--int-arrays` CLI flag).
    pub fn with_int_arrays(mut self) -> Self {
        self.array_storage_type = TypeTag::Int;
        self
    }
}
