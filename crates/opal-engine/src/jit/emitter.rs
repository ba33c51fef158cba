//! Instruction emitter
//!
//! Encodes the pseudo-ISA (load immediate, arithmetic, compare-to-flag,
//! conditional branch, jump, call, return, push/pop, memory ops) as
//! x86-64 machine code into a [`CodeBuffer`]. Every operation computes
//! its exact encoding up front and appends it in one step.
//!
//! Relative branches return a [`Label`] recording the 4-byte
//! displacement slot and the position of the following instruction;
//! a label must be resolved exactly once before the code runs. Labels
//! are buffer-relative, so they stay valid when a growing buffer moves;
//! [`set_label_abs`] (for targets outside the buffer) additionally
//! requires that the buffer does not move afterwards, which holds for
//! the pre-sized trampoline and compiler-entry buffers that use it.
//!
//! Memory operands always use 32-bit displacements and immediates use
//! 32 or 64 bits; uniform widths keep the encodings simple and the
//! worst-case lengths obvious.

use crate::jit::pool::CodeBuffer;
use crate::jit::regs::Reg;

/// An unresolved branch displacement.
#[derive(Debug, Clone, Copy)]
pub struct Label {
    /// Buffer offset of the 4-byte displacement slot
    disp_offset: usize,
    /// Buffer offset the displacement is relative to (the next instruction)
    base_offset: usize,
}

fn put(buf: &mut CodeBuffer, bytes: &[u8]) {
    let at = buf.alloc(bytes.len());
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), at, bytes.len());
    }
}

/// REX prefix; `reg` and `rm` contribute their high bits.
fn rex(w: bool, reg: Reg, rm: Reg) -> u8 {
    0x40 | (w as u8) << 3 | ((reg >> 3) & 1) << 2 | ((rm >> 3) & 1)
}

fn modrm(md: u8, reg: Reg, rm: Reg) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Register-indirect operand with a 32-bit displacement; rsp/r12 bases
/// need a SIB byte.
fn mem(out: &mut Vec<u8>, reg: Reg, base: Reg, disp: i32) {
    out.push(modrm(2, reg, base));
    if base & 7 == 4 {
        out.push(0x24); // SIB: no index, base in rm
    }
    out.extend_from_slice(&disp.to_le_bytes());
}

// ----------------------------------------------------------------------
// Loads and moves
// ----------------------------------------------------------------------

/// `rd := imm` (sign-extended 32-bit form when it fits).
pub fn li(buf: &mut CodeBuffer, rd: Reg, imm: i64) {
    if i32::try_from(imm).is_ok() {
        let mut out = vec![rex(true, 0, rd), 0xc7, modrm(3, 0, rd)];
        out.extend_from_slice(&(imm as i32).to_le_bytes());
        put(buf, &out);
    } else {
        let mut out = vec![rex(true, 0, rd), 0xb8 + (rd & 7)];
        out.extend_from_slice(&imm.to_le_bytes());
        put(buf, &out);
    }
}

/// `rd := address` (always the full 64-bit form).
pub fn la(buf: &mut CodeBuffer, rd: Reg, address: usize) {
    let mut out = vec![rex(true, 0, rd), 0xb8 + (rd & 7)];
    out.extend_from_slice(&(address as u64).to_le_bytes());
    put(buf, &out);
}

/// `rd := rs`
pub fn move_(buf: &mut CodeBuffer, rd: Reg, rs: Reg) {
    put(buf, &[rex(true, rs, rd), 0x89, modrm(3, rs, rd)]);
}

/// `rd := rs` unless they already coincide.
pub fn optmove(buf: &mut CodeBuffer, rd: Reg, rs: Reg) {
    if rd != rs {
        move_(buf, rd, rs);
    }
}

/// `rd := [rb + offset]`
pub fn ld(buf: &mut CodeBuffer, rd: Reg, offset: i32, rb: Reg) {
    let mut out = vec![rex(true, rd, rb), 0x8b];
    mem(&mut out, rd, rb, offset);
    put(buf, &out);
}

/// `[rb + offset] := rs`
pub fn sd(buf: &mut CodeBuffer, rs: Reg, offset: i32, rb: Reg) {
    let mut out = vec![rex(true, rs, rb), 0x89];
    mem(&mut out, rs, rb, offset);
    put(buf, &out);
}

pub fn push(buf: &mut CodeBuffer, r: Reg) {
    if r < 8 {
        put(buf, &[0x50 + r]);
    } else {
        put(buf, &[0x41, 0x50 + (r & 7)]);
    }
}

pub fn pop(buf: &mut CodeBuffer, r: Reg) {
    if r < 8 {
        put(buf, &[0x58 + r]);
    } else {
        put(buf, &[0x41, 0x58 + (r & 7)]);
    }
}

// ----------------------------------------------------------------------
// Arithmetic
// ----------------------------------------------------------------------

/// `rd += rs`
pub fn add(buf: &mut CodeBuffer, rd: Reg, rs: Reg) {
    put(buf, &[rex(true, rs, rd), 0x01, modrm(3, rs, rd)]);
}

/// `rd -= rs`
pub fn sub(buf: &mut CodeBuffer, rd: Reg, rs: Reg) {
    put(buf, &[rex(true, rs, rd), 0x29, modrm(3, rs, rd)]);
}

/// `rd *= rs`
pub fn mul(buf: &mut CodeBuffer, rd: Reg, rs: Reg) {
    put(buf, &[rex(true, rd, rs), 0x0f, 0xaf, modrm(3, rd, rs)]);
}

/// `rd += imm`
pub fn addi(buf: &mut CodeBuffer, rd: Reg, imm: i32) {
    let mut out = vec![rex(true, 0, rd), 0x81, modrm(3, 0, rd)];
    out.extend_from_slice(&imm.to_le_bytes());
    put(buf, &out);
}

/// `rd -= imm`
pub fn subi(buf: &mut CodeBuffer, rd: Reg, imm: i32) {
    let mut out = vec![rex(true, 0, rd), 0x81, modrm(3, 5, rd)];
    out.extend_from_slice(&imm.to_le_bytes());
    put(buf, &out);
}

/// `rd := rs << amount`
pub fn slli(buf: &mut CodeBuffer, rd: Reg, rs: Reg, amount: u8) {
    optmove(buf, rd, rs);
    put(buf, &[rex(true, 0, rd), 0xc1, modrm(3, 4, rd), amount]);
}

/// Signed division of `v0` by `rs`: quotient lands in `v0`
/// (cqo + idiv; rdx/`a2` is clobbered by the sign extension).
pub fn div_v0(buf: &mut CodeBuffer, rs: Reg) {
    put(buf, &[0x48, 0x99]); // cqo
    put(buf, &[rex(true, 0, rs), 0xf7, modrm(3, 7, rs)]);
}

// ----------------------------------------------------------------------
// Comparisons producing 0/1
// ----------------------------------------------------------------------

fn cmp(buf: &mut CodeBuffer, rs: Reg, rt: Reg) {
    put(buf, &[rex(true, rt, rs), 0x39, modrm(3, rt, rs)]);
}

fn test(buf: &mut CodeBuffer, r: Reg) {
    put(buf, &[rex(true, r, r), 0x85, modrm(3, r, r)]);
}

fn setcc(buf: &mut CodeBuffer, cc: u8, rd: Reg) {
    // REX is always present so byte access reaches all registers
    put(buf, &[rex(false, 0, rd), 0x0f, 0x90 + cc, modrm(3, 0, rd)]);
    // zero-extend the flag byte
    put(buf, &[rex(true, rd, rd), 0x0f, 0xb6, modrm(3, rd, rd)]);
}

/// `rd := (rs == rt)`
pub fn seq(buf: &mut CodeBuffer, rd: Reg, rs: Reg, rt: Reg) {
    cmp(buf, rs, rt);
    setcc(buf, 0x04, rd);
}

/// `rd := (rs <= rt)` (signed)
pub fn sle(buf: &mut CodeBuffer, rd: Reg, rs: Reg, rt: Reg) {
    cmp(buf, rs, rt);
    setcc(buf, 0x0e, rd);
}

/// `rd := (rs < rt)` (signed)
pub fn slt(buf: &mut CodeBuffer, rd: Reg, rs: Reg, rt: Reg) {
    cmp(buf, rs, rt);
    setcc(buf, 0x0c, rd);
}

/// `rd := (rs == 0)`
pub fn not(buf: &mut CodeBuffer, rd: Reg, rs: Reg) {
    test(buf, rs);
    setcc(buf, 0x04, rd);
}

// ----------------------------------------------------------------------
// Branches, jumps, calls
// ----------------------------------------------------------------------

fn jcc(buf: &mut CodeBuffer, cc: u8) -> Label {
    put(buf, &[0x0f, 0x80 + cc]);
    disp_slot(buf)
}

fn disp_slot(buf: &mut CodeBuffer) -> Label {
    let disp_offset = buf.len();
    put(buf, &[0, 0, 0, 0]);
    Label {
        disp_offset,
        base_offset: disp_offset + 4,
    }
}

/// Branch if `rs == rt`.
pub fn beq(buf: &mut CodeBuffer, rs: Reg, rt: Reg) -> Label {
    cmp(buf, rs, rt);
    jcc(buf, 0x04)
}

/// Branch if `rs != rt`.
pub fn bne(buf: &mut CodeBuffer, rs: Reg, rt: Reg) -> Label {
    cmp(buf, rs, rt);
    jcc(buf, 0x05)
}

/// Branch if `rs == 0`.
pub fn beqz(buf: &mut CodeBuffer, rs: Reg) -> Label {
    test(buf, rs);
    jcc(buf, 0x04)
}

/// Branch if `rs != 0`.
pub fn bnez(buf: &mut CodeBuffer, rs: Reg) -> Label {
    test(buf, rs);
    jcc(buf, 0x05)
}

/// Branch if `rs >= 0` (signed).
pub fn bgez(buf: &mut CodeBuffer, rs: Reg) -> Label {
    test(buf, rs);
    jcc(buf, 0x09)
}

/// Branch if `rs < rt` (signed).
pub fn blt(buf: &mut CodeBuffer, rs: Reg, rt: Reg) -> Label {
    cmp(buf, rs, rt);
    jcc(buf, 0x0c)
}

/// Branch if `rs <= rt` (signed).
pub fn ble(buf: &mut CodeBuffer, rs: Reg, rt: Reg) -> Label {
    cmp(buf, rs, rt);
    jcc(buf, 0x0e)
}

/// Unconditional jump.
pub fn j(buf: &mut CodeBuffer) -> Label {
    put(buf, &[0xe9]);
    disp_slot(buf)
}

/// Call with a relative displacement (jump-and-link).
pub fn jal(buf: &mut CodeBuffer) -> Label {
    put(buf, &[0xe8]);
    disp_slot(buf)
}

/// Call through a register.
pub fn jalr(buf: &mut CodeBuffer, r: Reg) {
    if r < 8 {
        put(buf, &[0xff, modrm(3, 2, r)]);
    } else {
        put(buf, &[0x41, 0xff, modrm(3, 2, r)]);
    }
}

/// Return.
pub fn jreturn(buf: &mut CodeBuffer) {
    put(buf, &[0xc3]);
}

// ----------------------------------------------------------------------
// Label resolution
// ----------------------------------------------------------------------

/// Resolve `label` to the current end of the buffer.
pub fn set_label_here(buf: &mut CodeBuffer, label: &Label) {
    let target = buf.len();
    set_label_to(buf, label, target);
}

/// Resolve `label` to `target_offset` within the same buffer.
pub fn set_label_to(buf: &mut CodeBuffer, label: &Label, target_offset: usize) {
    let delta = target_offset as i64 - label.base_offset as i64;
    write_disp(buf, label, delta);
}

/// Resolve `label` to an absolute address outside the buffer. The buffer
/// must not move afterwards (pre-size it).
pub fn set_label_abs(buf: &mut CodeBuffer, label: &Label, target: *const u8) {
    let base = buf.entrypoint() as i64 + label.base_offset as i64;
    write_disp(buf, label, target as i64 - base);
}

fn write_disp(buf: &mut CodeBuffer, label: &Label, delta: i64) {
    let disp = i32::try_from(delta).expect("branch displacement out of range");
    unsafe {
        let slot = buf.entrypoint().add(label.disp_offset);
        std::ptr::copy_nonoverlapping(disp.to_le_bytes().as_ptr(), slot, 4);
    }
}

/// Overwrite existing code at `at` with an unconditional jump to
/// `target` (used to patch trampolines once their callable is compiled).
///
/// # Safety
///
/// `at` must point to at least 5 writable bytes of code whose original
/// instructions are no longer needed.
pub unsafe fn patch_jump(at: *mut u8, target: *const u8) {
    let rel = target as i64 - (at as i64 + 5);
    let rel = i32::try_from(rel).expect("patch displacement out of range");
    *at = 0xe9;
    std::ptr::copy_nonoverlapping(rel.to_le_bytes().as_ptr(), at.add(1), 4);
}

/// Worst-case encoding size of one trampoline entry (`li` + `jal`).
pub const TRAMPOLINE_ENTRY_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::regs::*;

    fn emit(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
        let mut buf = CodeBuffer::new(64);
        f(&mut buf);
        let bytes = buf.bytes().to_vec();
        buf.free();
        bytes
    }

    #[test]
    fn test_li_small() {
        assert_eq!(
            emit(|b| li(b, V0, 7)),
            vec![0x48, 0xc7, 0xc0, 7, 0, 0, 0]
        );
        assert_eq!(
            emit(|b| li(b, T0, -1)),
            vec![0x49, 0xc7, 0xc2, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_li_large_uses_movabs() {
        let bytes = emit(|b| li(b, V0, 0x1_0000_0000));
        assert_eq!(&bytes[..2], &[0x48, 0xb8]);
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[2..], &0x1_0000_0000u64.to_le_bytes());
    }

    #[test]
    fn test_move_fp_sp() {
        // mov %rbp, %rsp
        assert_eq!(emit(|b| move_(b, FP, SP)), vec![0x48, 0x89, 0xe5]);
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(emit(|b| push(b, FP)), vec![0x55]);
        assert_eq!(emit(|b| push(b, A4)), vec![0x41, 0x50]);
        assert_eq!(emit(|b| pop(b, FP)), vec![0x5d]);
        assert_eq!(emit(|b| pop(b, GP)), vec![0x41, 0x5f]);
    }

    #[test]
    fn test_load_store() {
        // mov %rax, 16(%rbp): rbp base forces disp32 with mod=2
        assert_eq!(
            emit(|b| ld(b, V0, 16, FP)),
            vec![0x48, 0x8b, 0x85, 16, 0, 0, 0]
        );
        // mov 0(%rsp), %rax: rsp base needs a SIB byte
        assert_eq!(
            emit(|b| sd(b, V0, 0, SP)),
            vec![0x48, 0x89, 0x84, 0x24, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_arith() {
        assert_eq!(emit(|b| add(b, A0, A1)), vec![0x48, 0x01, 0xf7]);
        assert_eq!(emit(|b| sub(b, A0, A1)), vec![0x48, 0x29, 0xf7]);
        assert_eq!(emit(|b| mul(b, V0, T0)), vec![0x49, 0x0f, 0xaf, 0xc2]);
        assert_eq!(
            emit(|b| addi(b, SP, 16)),
            vec![0x48, 0x81, 0xc4, 16, 0, 0, 0]
        );
        assert_eq!(
            emit(|b| subi(b, SP, 16)),
            vec![0x48, 0x81, 0xec, 16, 0, 0, 0]
        );
    }

    #[test]
    fn test_div() {
        // cqo; idiv %r10
        assert_eq!(emit(|b| div_v0(b, T0)), vec![0x48, 0x99, 0x49, 0xf7, 0xfa]);
    }

    #[test]
    fn test_seq() {
        // cmp %rdi, %rsi; sete %al; movzx %rax, %al
        assert_eq!(
            emit(|b| seq(b, V0, A0, A1)),
            vec![0x48, 0x39, 0xf7, 0x40, 0x0f, 0x94, 0xc0, 0x48, 0x0f, 0xb6, 0xc0]
        );
    }

    #[test]
    fn test_shift() {
        let bytes = emit(|b| slli(b, T0, T0, 3));
        assert_eq!(bytes, vec![0x49, 0xc1, 0xe2, 3]);
    }

    #[test]
    fn test_calls_and_return() {
        assert_eq!(emit(|b| jalr(b, V0)), vec![0xff, 0xd0]);
        assert_eq!(emit(|b| jalr(b, T0)), vec![0x41, 0xff, 0xd2]);
        assert_eq!(emit(jreturn), vec![0xc3]);
    }

    #[test]
    fn test_forward_jump_resolution() {
        let bytes = emit(|b| {
            let label = j(b);
            li(b, V0, 1); // 7 bytes to skip
            set_label_here(b, &label);
        });
        assert_eq!(bytes[0], 0xe9);
        assert_eq!(&bytes[1..5], &7i32.to_le_bytes());
    }

    #[test]
    fn test_backward_branch_resolution() {
        let bytes = emit(|b| {
            let top = b.len();
            li(b, V0, 1);
            let label = beqz(b, V0);
            set_label_to(b, &label, top);
        });
        // li(7) + test(3) + jcc(2), then the 4-byte slot at offset 12;
        // the branch is relative to offset 16 and targets offset 0
        assert_eq!(bytes.len(), 16);
        let disp = i32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(disp, -16);
    }

    #[test]
    fn test_conditional_branches_encode_condition() {
        let bytes = emit(|b| {
            let l = blt(b, A0, A1);
            set_label_here(b, &l);
        });
        // cmp then jl
        assert_eq!(&bytes[3..5], &[0x0f, 0x8c]);

        let bytes = emit(|b| {
            let l = bgez(b, V0);
            set_label_here(b, &l);
        });
        // test then jns
        assert_eq!(&bytes[3..5], &[0x0f, 0x89]);
    }

    #[test]
    fn test_patch_jump() {
        let mut code = [0u8; 16];
        let target = code.as_ptr() as usize + 16;
        unsafe { patch_jump(code.as_mut_ptr(), target as *const u8) };
        assert_eq!(code[0], 0xe9);
        assert_eq!(&code[1..5], &11i32.to_le_bytes());
    }

    #[test]
    fn test_executes_emitted_code() {
        // the emitted bytes really are the machine code they claim to be:
        // build `f(a, b) = a + b` and call it
        let mut buf = CodeBuffer::new(64);
        move_(&mut buf, V0, A0);
        add(&mut buf, V0, A1);
        jreturn(&mut buf);
        buf.terminate();
        let f: extern "C" fn(i64, i64) -> i64 =
            unsafe { std::mem::transmute(buf.entrypoint()) };
        assert_eq!(f(2, 40), 42);
        assert_eq!(f(-1, 1), 0);
        buf.free();
    }

    #[test]
    fn test_executes_branch_loop() {
        // f(n) = sum of 1..=n, via a real backward branch
        let mut buf = CodeBuffer::new(128);
        li(&mut buf, V0, 0);
        let top = buf.len();
        add(&mut buf, V0, A0);
        subi(&mut buf, A0, 1);
        let exit = beqz(&mut buf, A0);
        let back = j(&mut buf);
        set_label_to(&mut buf, &back, top);
        set_label_here(&mut buf, &exit);
        jreturn(&mut buf);
        buf.terminate();
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(buf.entrypoint()) };
        assert_eq!(f(5), 15);
        assert_eq!(f(1), 1);
        buf.free();
    }
}
