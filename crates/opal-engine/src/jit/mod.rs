//! JIT: code pool, registers, emitter, baseline compiler, trampolines
//!
//! The code generator targets a small MIPS-like pseudo-ISA whose
//! operations are encoded directly as x86-64 machine code into buffers
//! from a process-wide executable pool. Compilation is deferred: every
//! callable starts life as a trampoline that invokes the compiler on
//! first call and is then patched to jump straight to the compiled body.

pub mod addr_store;
pub mod baseline;
pub mod dyncomp;
pub mod emitter;
pub mod pool;
pub mod regs;
pub mod stack_map;

pub use baseline::{compile_entrypoint, compile_callable};
pub use emitter::Label;
pub use pool::CodeBuffer;
