//! Semantic analysis: symbol table, diagnostics, name and type analysis
//!
//! Both analysis passes follow the accumulate-and-report discipline: they
//! walk the whole program, collect every error they can find into a
//! [`Diagnostics`] list, and only afterwards does the pipeline decide
//! whether to continue.

pub mod diag;
pub mod names;
pub mod symtab;
pub mod types;

pub use diag::{Diagnostic, Diagnostics};
pub use names::name_analysis;
pub use symtab::{builtin_ids, StorageRecord, SymFlags, SymId, SymKind, Symbol, SymbolTable};
pub use types::type_analysis;
