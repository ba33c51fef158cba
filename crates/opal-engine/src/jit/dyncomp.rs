//! Trampolines and the dynamic compiler entry
//!
//! Each callable is bound to a short trampoline: load the callable's
//! symbol id into `v0`, call the generic compiler entry. The generic
//! entry saves all argument registers, calls the compile helper with the
//! symbol id and a pointer to its own return-address slot, restores the
//! registers, and returns — into the freshly compiled body, because the
//! helper overwrote that slot with the body's entry point.
//!
//! After the first call the trampoline itself is patched into an
//! unconditional jump to the body, so later calls bypass the compiler.
//! This keeps dead functions uncompiled and lets the compiler see the
//! complete symbol table before any body is translated.

use crate::jit::addr_store::{self, AddrKind};
use crate::jit::baseline;
use crate::jit::emitter as asm;
use crate::jit::pool::CodeBuffer;
use crate::jit::regs::{A0, A1, ARGUMENT_REGS, SP, V0};
use crate::runtime::class::ClassDesc;
use crate::runtime::image;
use crate::sema::symtab::{SymFlags, SymId, SymKind, SymbolTable};

const WORD: i32 = std::mem::size_of::<usize>() as i32;
const ARG_SAVE_AREA: i32 = WORD * ARGUMENT_REGS.len() as i32;

/// Build the generic compiler entry stub.
///
/// The stub expects the symbol id of the callable to compile in `v0`.
/// It saves the argument registers, calls
/// `dyncomp_compile_function(v0, &return-address-slot)`, restores the
/// registers, and returns into the compiled body.
pub fn build_generic_entry() -> CodeBuffer {
    // pre-sized: this buffer must not move (its address is burned into
    // every trampoline)
    let mut buf = CodeBuffer::new(256);

    asm::subi(&mut buf, SP, ARG_SAVE_AREA);
    for (i, &reg) in ARGUMENT_REGS.iter().enumerate() {
        asm::sd(&mut buf, reg, i as i32 * WORD, SP);
    }
    // the compile helper lives in the host runtime
    asm::move_(&mut buf, A0, V0);
    asm::move_(&mut buf, A1, SP);
    asm::addi(&mut buf, A1, ARG_SAVE_AREA);
    asm::la(&mut buf, V0, dyncomp_compile_function as usize);
    asm::jalr(&mut buf, V0);
    for (i, &reg) in ARGUMENT_REGS.iter().enumerate() {
        asm::ld(&mut buf, reg, i as i32 * WORD, SP);
    }
    asm::addi(&mut buf, SP, ARG_SAVE_AREA);
    asm::jreturn(&mut buf);

    buf.terminate();
    addr_store::put(buf.entrypoint(), AddrKind::Special, "dyncomp-entry");
    buf
}

/// Bind each symbol to a fresh trampoline targeting `dyncomp_entry`.
///
/// Returns `None` for an empty symbol list. The buffer is pre-sized so
/// the recorded per-symbol entry addresses stay valid.
pub fn build_trampolines(
    table: &mut SymbolTable,
    dyncomp_entry: *const u8,
    syms: &[SymId],
    debug: bool,
) -> Option<CodeBuffer> {
    if syms.is_empty() {
        return None;
    }
    let mut buf = CodeBuffer::new(asm::TRAMPOLINE_ENTRY_SIZE * syms.len());

    for &sym_id in syms {
        let entry = unsafe { buf.entrypoint().add(buf.len()) };
        asm::li(&mut buf, V0, sym_id.raw() as i64);
        let label = asm::jal(&mut buf);
        asm::set_label_abs(&mut buf, &label, dyncomp_entry);

        let sym = table.lookup_mut(sym_id).expect("callable symbol");
        sym.trampoline = entry;
        sym.code = entry;
        if debug {
            let mut name = String::new();
            table.dump_name(sym_id, &mut name);
            addr_store::put(entry, AddrKind::Trampoline, &name);
            eprintln!("Trampoline for `{}` at {:p}", name, entry);
        }
    }

    buf.terminate();
    Some(buf)
}

/// The compile helper invoked from the generic entry stub (and usable
/// directly by the host).
///
/// Compiles the callable identified by `symbol_id`, records its entry
/// point, writes it into `update_return_address` (so the stub's `ret`
/// enters the body), patches the trampoline into a direct jump, and for
/// methods updates the class's vtable slot.
pub extern "C" fn dyncomp_compile_function(
    symbol_id: i64,
    update_return_address: *mut *const u8,
) {
    let image = image::current();
    let sym_id = SymId::from_raw(symbol_id as i32);
    let (kind, flags, parent) = match image.symtab.lookup(sym_id) {
        Some(sym) => (sym.kind, sym.flags, sym.parent),
        None => {
            eprintln!("Fatal: dynamic compilation of unknown symbol {}", symbol_id);
            std::process::exit(1);
        }
    };
    if kind != SymKind::Function {
        eprintln!("Fatal: dynamic compilation of a non-function symbol {}", symbol_id);
        std::process::exit(1);
    }

    // constructors carry their class into existence
    if flags.contains(SymFlags::CONSTRUCTOR) {
        let class_sym = parent.expect("constructor without class");
        image.ensure_class_descriptor(class_sym);
    }

    if image.options.debug_dynamic_compilation {
        let mut name = String::new();
        image.symtab.dump_name(sym_id, &mut name);
        eprintln!("dyn-compiling `{}`", name);
    }

    let body = baseline::compile_callable(image, sym_id);
    let entry = body.entrypoint() as *const u8;

    {
        let sym = image.symtab.lookup_mut(sym_id).unwrap();
        sym.code = entry as *mut u8;
        sym.flags.insert(SymFlags::COMPILED);
    }
    addr_store::put(entry, AddrKind::Function, "compiled-body");

    if !update_return_address.is_null() {
        unsafe { *update_return_address = entry };
    }

    // later calls skip the compiler entirely
    let trampoline = image.symtab.lookup(sym_id).unwrap().trampoline;
    unsafe { asm::patch_jump(trampoline, entry) };

    // methods also go live in their class's vtable
    if let Some(class_sym) = parent {
        if !flags.contains(SymFlags::CONSTRUCTOR) && flags.contains(SymFlags::MEMBER) {
            let offset = image.symtab.lookup(sym_id).unwrap().offset as usize;
            let desc = image.symtab.lookup(class_sym).unwrap().code as *mut ClassDesc;
            if !desc.is_null() {
                unsafe { (&mut (*desc).vtable)[offset] = entry };
            }
        }
    }

    image.body_buffers.push(body);
}
