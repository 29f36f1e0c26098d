//! DWARF opcode numbers and the register numbering of the target.

#[cfg(target_arch = "aarch64")]
use gimli::AArch64;
#[cfg(not(target_arch = "aarch64"))]
use gimli::X86_64;

// DWARF register numbers of the frame pointer, stack pointer and return
// address column for the architecture this crate parses its own process on.
#[cfg(not(target_arch = "aarch64"))]
pub const DW_REG_FP: u64 = X86_64::RBP.0 as u64;
#[cfg(not(target_arch = "aarch64"))]
pub const DW_REG_SP: u64 = X86_64::RSP.0 as u64;
#[cfg(not(target_arch = "aarch64"))]
pub const DW_REG_PC: u64 = X86_64::RA.0 as u64;

#[cfg(target_arch = "aarch64")]
pub const DW_REG_FP: u64 = AArch64::X29.0 as u64;
#[cfg(target_arch = "aarch64")]
pub const DW_REG_SP: u64 = AArch64::SP.0 as u64;
#[cfg(target_arch = "aarch64")]
pub const DW_REG_PC: u64 = AArch64::X30.0 as u64;

/// Width of one machine instruction; the default code alignment factor
/// when the CIE does not say otherwise.
#[cfg(target_arch = "aarch64")]
pub const INSTRUCTION_BYTES: u32 = 4;
#[cfg(not(target_arch = "aarch64"))]
pub const INSTRUCTION_BYTES: u32 = 1;

// Call frame instructions, DWARF 5 section 6.4.2. The three high-bit
// classes carry an operand in the low 6 bits.
pub const DW_CFA_NOP: u8 = 0x00;
pub const DW_CFA_SET_LOC: u8 = 0x01;
pub const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
pub const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
pub const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
pub const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
pub const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
pub const DW_CFA_UNDEFINED: u8 = 0x07;
pub const DW_CFA_SAME_VALUE: u8 = 0x08;
pub const DW_CFA_REGISTER: u8 = 0x09;
pub const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
pub const DW_CFA_RESTORE_STATE: u8 = 0x0b;
pub const DW_CFA_DEF_CFA: u8 = 0x0c;
pub const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
pub const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
pub const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0f;
pub const DW_CFA_EXPRESSION: u8 = 0x10;
pub const DW_CFA_OFFSET_EXTENDED_SF: u8 = 0x11;
pub const DW_CFA_DEF_CFA_SF: u8 = 0x12;
pub const DW_CFA_DEF_CFA_OFFSET_SF: u8 = 0x13;
pub const DW_CFA_VAL_OFFSET: u8 = 0x14;
pub const DW_CFA_VAL_OFFSET_SF: u8 = 0x15;
pub const DW_CFA_VAL_EXPRESSION: u8 = 0x16;
pub const DW_CFA_AARCH64_NEGATE_RA_STATE: u8 = 0x2d;
pub const DW_CFA_GNU_ARGS_SIZE: u8 = 0x2e;

// High-bit instruction classes (opcode >> 6).
pub const DW_CFA_ADVANCE_LOC: u8 = 0x1;
pub const DW_CFA_OFFSET: u8 = 0x2;
pub const DW_CFA_RESTORE: u8 = 0x3;

// The expression opcodes the evaluator understands.
pub const DW_OP_CONST1U: u8 = 0x08;
pub const DW_OP_CONST1S: u8 = 0x09;
pub const DW_OP_CONST2U: u8 = 0x0a;
pub const DW_OP_CONST2S: u8 = 0x0b;
pub const DW_OP_CONST4U: u8 = 0x0c;
pub const DW_OP_CONST4S: u8 = 0x0d;
pub const DW_OP_CONSTU: u8 = 0x10;
pub const DW_OP_CONSTS: u8 = 0x11;
pub const DW_OP_MINUS: u8 = 0x1c;
pub const DW_OP_PLUS: u8 = 0x22;
pub const DW_OP_BREG_PC: u8 = 0x70 + DW_REG_PC as u8;

// Pointer encodings used by .eh_frame_hdr.
pub const DW_EH_PE_UDATA4: u8 = 0x03;
pub const DW_EH_PE_DATAREL: u8 = 0x30;
