//! Register file
//!
//! Sixteen general-purpose registers in their hardware encoding, with
//! both the Intel names and the pseudo-MIPS role names used throughout
//! the code generator. Roles follow the System V AMD64 convention:
//! arguments in `a0`..`a5` (rdi rsi rdx rcx r8 r9), return value in
//! `v0` (rax), caller-save scratch in `t0`/`t1`, callee-save in
//! `s0`..`s3`, and `gp` (r15) reserved for the static-memory base.

/// Hardware register number (0..=15).
pub type Reg = u8;

pub const V0: Reg = 0; // rax: return value
pub const A3: Reg = 1; // rcx
pub const A2: Reg = 2; // rdx
pub const S0: Reg = 3; // rbx
pub const SP: Reg = 4; // rsp: stack pointer
pub const FP: Reg = 5; // rbp: frame pointer
pub const A1: Reg = 6; // rsi
pub const A0: Reg = 7; // rdi
pub const A4: Reg = 8; // r8
pub const A5: Reg = 9; // r9
pub const T0: Reg = 10; // r10: caller-save temporary
pub const T1: Reg = 11; // r11: caller-save temporary
pub const S1: Reg = 12; // r12
pub const S2: Reg = 13; // r13
pub const S3: Reg = 14; // r14
pub const GP: Reg = 15; // r15: global pointer (static memory)

pub const REGISTERS_NR: usize = 16;
pub const ARGUMENT_REGS_NR: usize = 6;

/// Argument registers in parameter order.
pub const ARGUMENT_REGS: [Reg; ARGUMENT_REGS_NR] = [A0, A1, A2, A3, A4, A5];

/// Caller-save temporaries (excluding argument and special registers).
pub const TEMP_REGS: [Reg; 2] = [T0, T1];

/// Callee-save registers available to generated code (gp excluded).
pub const CALLEE_SAVED_REGS: [Reg; 4] = [S0, S1, S2, S3];

/// Intel and pseudo-MIPS names for one register.
pub struct RegName {
    pub intel: &'static str,
    pub mips: &'static str,
}

pub const REGISTER_NAMES: [RegName; REGISTERS_NR] = [
    RegName { intel: "%rax", mips: "$v0" },
    RegName { intel: "%rcx", mips: "$a3" },
    RegName { intel: "%rdx", mips: "$a2" },
    RegName { intel: "%rbx", mips: "$s0" },
    RegName { intel: "%rsp", mips: "$sp" },
    RegName { intel: "%rbp", mips: "$fp" },
    RegName { intel: "%rsi", mips: "$a1" },
    RegName { intel: "%rdi", mips: "$a0" },
    RegName { intel: "%r8", mips: "$a4" },
    RegName { intel: "%r9", mips: "$a5" },
    RegName { intel: "%r10", mips: "$t0" },
    RegName { intel: "%r11", mips: "$t1" },
    RegName { intel: "%r12", mips: "$s1" },
    RegName { intel: "%r13", mips: "$s2" },
    RegName { intel: "%r14", mips: "$s3" },
    RegName { intel: "%r15", mips: "$gp" },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_registers_follow_sysv_order() {
        assert_eq!(ARGUMENT_REGS, [7, 6, 2, 1, 8, 9]);
    }

    #[test]
    fn test_names_line_up() {
        assert_eq!(REGISTER_NAMES[V0 as usize].mips, "$v0");
        assert_eq!(REGISTER_NAMES[GP as usize].intel, "%r15");
        assert_eq!(REGISTER_NAMES[A0 as usize].intel, "%rdi");
    }
}
