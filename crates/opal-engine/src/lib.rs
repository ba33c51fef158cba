//! Opal Language Engine
//!
//! This crate provides the complete Opal language implementation:
//! - **Parser**: Lexer, parser, and AST (`parser` module)
//! - **Sema**: Symbol table, name analysis, and type analysis (`sema` module)
//! - **Analysis**: Control-flow graph and data-flow framework (`analysis` module)
//! - **JIT**: Code pool, instruction emitter, baseline compiler, and
//!   deferred-compilation trampolines (`jit` module)
//! - **Runtime**: Heap, object model, class descriptors, and the runtime
//!   image (`runtime` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use opal_engine::{CompilerOptions, RuntimeImage};
//!
//! let source = "print(3 + 4);";
//! let mut image = RuntimeImage::prepare(source, CompilerOptions::default())?;
//! image.execute();
//! ```
//!
//! The pipeline is whole-program but lazy: semantic analysis covers the
//! entire AST up front, while machine code for each function, method, and
//! constructor is produced on its first call through a trampoline.

#![warn(rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::needless_range_loop)]

// ============================================================================
// Core Modules
// ============================================================================

/// Parser module: lexer, interner, AST, and parser
pub mod parser;

/// Semantic analysis: symbol table, diagnostics, name and type analysis
pub mod sema;

/// Control-flow graph and data-flow framework
pub mod analysis;

/// JIT: code pool, registers, emitter, baseline compiler, trampolines
pub mod jit;

/// Runtime: heap, object model, classes, builtins, runtime image
pub mod runtime;

/// Compiler options shared across the pipeline
pub mod options;

mod error;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::EngineError;
pub use options::CompilerOptions;
pub use parser::{Ast, AstNode, Interner, Lexer, NodeId, NodeKind, Parser, Token, TypeTag};
pub use runtime::{RuntimeAction, RuntimeImage};
pub use sema::{Diagnostic, Diagnostics, SymId, Symbol, SymbolTable};

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for tests that install and execute a runtime image.
    //!
    //! Execution uses process-wide state (the current image, the print
    //! sink), so such tests serialise on one lock.

    use crate::options::CompilerOptions;
    use crate::runtime::object;
    use crate::runtime::RuntimeImage;
    use parking_lot::Mutex;

    pub static RUN_LOCK: Mutex<()> = Mutex::new(());

    /// Compile and run a program, returning everything it printed.
    pub fn run_program(source: &str) -> String {
        run_program_with(source, CompilerOptions::default())
    }

    pub fn run_program_with(source: &str, options: CompilerOptions) -> String {
        let _guard = RUN_LOCK.lock();
        let mut image = RuntimeImage::prepare(source, options).expect("pipeline failure");
        object::capture_print();
        image.execute();
        object::take_captured_print()
    }
}
