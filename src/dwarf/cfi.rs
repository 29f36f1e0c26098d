//! The call-frame-information state machine.
//!
//! An FDE is a program over a virtual register file; this interpreter runs
//! the restricted projection of it the profiler cares about -- the CFA
//! rule plus the saved-FP and return-address columns -- and emits one
//! [FrameDesc] per `advance_loc` boundary. A table entry is authoritative
//! for the PC range *before* the advance, which is why records are emitted
//! on the advance rather than on the opcode preceding it.

use crate::cursor::Cursor;
use crate::dwarf::consts::*;
use crate::dwarf::expression;
use crate::image::Section;
use crate::table::{CfaReg, FrameDesc, FrameTable, EMPTY_FRAME_SIZE, PC_OFFSET, SAME_FP, STACK_SLOT};
use crate::{Error, Result};
use smallvec::SmallVec;
use tracing::warn;

/// Nesting depth of `remember_state` seen in real CIEs; deeper nesting
/// spills to the heap with a warning.
const REMEMBER_STATE_DEPTH: usize = 4;

/// Byte length of the expression the linker emits for a PLT-relative CFA.
const PLT_CFA_EXPRESSION_LEN: usize = 11;

#[derive(Debug, Copy, Clone)]
struct CfiState {
    cfa_reg: CfaReg,
    cfa_off: i32,
    fp_off: i32,
    pc_off: i32,
}

impl CfiState {
    /// State at function entry: the call pushed (or reserved) only the
    /// return-address slot.
    fn function_entry() -> Self {
        Self {
            cfa_reg: CfaReg::Sp,
            cfa_off: EMPTY_FRAME_SIZE,
            fp_off: SAME_FP,
            pc_off: -EMPTY_FRAME_SIZE,
        }
    }

    fn desc(&self, loc: u32) -> FrameDesc {
        FrameDesc::new(loc, self.cfa_reg, self.cfa_off, self.fp_off, self.pc_off)
    }
}

/// Walks CIE/FDE pairs of one image's `.eh_frame` section and appends the
/// resulting records to a [FrameTable].
///
/// The parser keeps the alignment factors of the most recently seen CIE;
/// consecutive FDEs almost always share a CIE, so the backpointer is only
/// followed when it changes.
pub struct CfiParser<'a> {
    cursor: Cursor<'a>,
    section: Section<'a>,
    text_base: u64,
    image: &'a str,
    code_align: u32,
    data_align: i32,
    cie_offset: Option<usize>,
}

impl<'a> CfiParser<'a> {
    pub fn new(eh_frame: Section<'a>, text_base: u64, image: &'a str) -> Self {
        Self {
            cursor: Cursor::new(eh_frame.data),
            section: eh_frame,
            text_base,
            image,
            code_align: INSTRUCTION_BYTES,
            data_align: -STACK_SLOT,
            cie_offset: None,
        }
    }

    /// Mapped address of the `.eh_frame` section this parser reads.
    pub fn section_addr(&self) -> u64 {
        self.section.addr
    }

    pub fn image(&self) -> &'a str {
        self.image
    }

    /// Parse the FDE at the given byte offset of `.eh_frame`, emitting its
    /// records followed by the default linked-frame sentinel at the end of
    /// the covered range.
    pub fn parse_fde_at(&mut self, offset: usize, table: &mut FrameTable) -> Result<()> {
        self.cursor.seek(offset);
        let fde_len = self.cursor.u32()?;
        if fde_len == 0 || fde_len == 0xffff_ffff {
            return Ok(());
        }
        let fde_start = self.cursor.pos();
        let fde_end = fde_start.saturating_add(fde_len as usize);

        let cie_ptr = self.cursor.u32()?;
        if cie_ptr == 0 {
            // A CIE, not an FDE.
            return Ok(());
        }
        let cie_offset = fde_start
            .checked_sub(cie_ptr as usize)
            .ok_or(Error::Truncated(fde_start))?;
        if self.cie_offset != Some(cie_offset) {
            let saved = self.cursor.pos();
            self.parse_cie(cie_offset)?;
            self.cie_offset = Some(cie_offset);
            self.cursor.seek(saved);
        }

        let range_start = self.cursor.u64()?.wrapping_sub(self.text_base) as u32;
        let range_len = self.cursor.u32()?;
        let augmentation_len = self.cursor.uleb128()? as usize;
        self.cursor.skip(augmentation_len);

        self.parse_instructions(range_start, fde_end, table)?;
        table.push(FrameDesc::linked_frame(range_start.wrapping_add(range_len)));
        Ok(())
    }

    /// Pull the alignment factors out of the CIE at `offset`. The caller
    /// saves and restores the cursor around the backward seek.
    fn parse_cie(&mut self, offset: usize) -> Result<()> {
        self.cursor.seek(offset);
        let cie_len = self.cursor.u32()?;
        if cie_len == 0 || cie_len == 0xffff_ffff {
            return Ok(());
        }
        // CIE id and version, then the NUL-terminated augmentation string.
        self.cursor.skip(5);
        while self.cursor.u8()? != 0 {}
        self.code_align = self.cursor.uleb128()? as u32;
        self.data_align = self.cursor.sleb128()? as i32;
        Ok(())
    }

    fn parse_instructions(&mut self, range_start: u32, end: usize, table: &mut FrameTable) -> Result<()> {
        let code_align = self.code_align;
        let data_align = self.data_align;

        let mut loc = range_start;
        let mut state = CfiState::function_entry();
        let entry_state = state;
        let mut remembered: SmallVec<[CfiState; REMEMBER_STATE_DEPTH]> = SmallVec::new();

        while self.cursor.pos() < end {
            let op = self.cursor.u8()?;
            match op >> 6 {
                0 => match op {
                    DW_CFA_NOP => {}
                    DW_CFA_SET_LOC => {
                        // Never emitted for .eh_frame; treat as end of FDE.
                        self.cursor.seek(end);
                    }
                    DW_CFA_ADVANCE_LOC1 => {
                        table.push(state.desc(loc));
                        let delta = self.cursor.u8()? as u32;
                        loc = loc.wrapping_add(delta.wrapping_mul(code_align));
                    }
                    DW_CFA_ADVANCE_LOC2 => {
                        table.push(state.desc(loc));
                        let delta = self.cursor.u16()? as u32;
                        loc = loc.wrapping_add(delta.wrapping_mul(code_align));
                    }
                    DW_CFA_ADVANCE_LOC4 => {
                        table.push(state.desc(loc));
                        let delta = self.cursor.u32()?;
                        loc = loc.wrapping_add(delta.wrapping_mul(code_align));
                    }
                    DW_CFA_OFFSET_EXTENDED => {
                        let reg = self.cursor.uleb128()?;
                        let n = self.cursor.uleb128()?;
                        match reg {
                            DW_REG_FP => state.fp_off = factored(n as i64, data_align),
                            DW_REG_PC => state.pc_off = factored(n as i64, data_align),
                            _ => {}
                        }
                    }
                    DW_CFA_RESTORE_EXTENDED | DW_CFA_UNDEFINED | DW_CFA_SAME_VALUE => {
                        if self.cursor.uleb128()? == DW_REG_FP {
                            state.fp_off = SAME_FP;
                        }
                    }
                    DW_CFA_REGISTER => {
                        self.cursor.uleb128()?;
                        self.cursor.uleb128()?;
                    }
                    DW_CFA_REMEMBER_STATE => {
                        if remembered.len() == REMEMBER_STATE_DEPTH {
                            warn!("remember_state nested deeper than {} in {}", REMEMBER_STATE_DEPTH, self.image);
                        }
                        remembered.push(state);
                    }
                    DW_CFA_RESTORE_STATE => {
                        state = remembered.pop().unwrap_or(entry_state);
                    }
                    DW_CFA_DEF_CFA => {
                        state.cfa_reg = cfa_reg_from_dwarf(self.cursor.uleb128()?);
                        state.cfa_off = self.cursor.uleb128()? as i32;
                    }
                    DW_CFA_DEF_CFA_REGISTER => {
                        state.cfa_reg = cfa_reg_from_dwarf(self.cursor.uleb128()?);
                    }
                    DW_CFA_DEF_CFA_OFFSET => {
                        state.cfa_off = self.cursor.uleb128()? as i32;
                    }
                    DW_CFA_DEF_CFA_EXPRESSION => {
                        let len = self.cursor.uleb128()? as usize;
                        // The only expression-based CFA the profiler can
                        // follow is the linker's PLT shape; everything else
                        // marks the range as not unwindable.
                        state.cfa_reg = if len == PLT_CFA_EXPRESSION_LEN {
                            CfaReg::Plt
                        } else {
                            CfaReg::Invalid
                        };
                        state.cfa_off = STACK_SLOT;
                        self.cursor.skip(len);
                    }
                    DW_CFA_EXPRESSION => {
                        self.cursor.uleb128()?;
                        let len = self.cursor.uleb128()? as usize;
                        self.cursor.skip(len);
                    }
                    DW_CFA_OFFSET_EXTENDED_SF => {
                        let reg = self.cursor.uleb128()?;
                        let n = self.cursor.sleb128()?;
                        match reg {
                            DW_REG_FP => state.fp_off = factored(n, data_align),
                            DW_REG_PC => state.pc_off = factored(n, data_align),
                            _ => {}
                        }
                    }
                    DW_CFA_DEF_CFA_OFFSET_SF => {
                        state.cfa_off = factored(self.cursor.sleb128()?, data_align);
                    }
                    DW_CFA_VAL_OFFSET | DW_CFA_VAL_OFFSET_SF => {
                        self.cursor.uleb128()?;
                        self.cursor.uleb128()?;
                    }
                    DW_CFA_VAL_EXPRESSION => {
                        if self.cursor.uleb128()? == DW_REG_PC {
                            let pc_off = expression::evaluate_pc_offset(&mut self.cursor, self.image)?;
                            if pc_off != 0 {
                                state.fp_off = PC_OFFSET | pc_off << 1;
                            }
                        } else {
                            let len = self.cursor.uleb128()? as usize;
                            self.cursor.skip(len);
                        }
                    }
                    DW_CFA_AARCH64_NEGATE_RA_STATE => {
                        // Return-address signing does not change the frame layout.
                    }
                    DW_CFA_GNU_ARGS_SIZE => {
                        self.cursor.uleb128()?;
                    }
                    _ => {
                        warn!("unknown call frame instruction {:#x} in {}", op, self.image);
                        return Ok(());
                    }
                },
                DW_CFA_ADVANCE_LOC => {
                    table.push(state.desc(loc));
                    let delta = (op & 0x3f) as u32;
                    loc = loc.wrapping_add(delta.wrapping_mul(code_align));
                }
                DW_CFA_OFFSET => {
                    let n = self.cursor.uleb128()?;
                    match (op & 0x3f) as u64 {
                        DW_REG_FP => state.fp_off = factored(n as i64, data_align),
                        DW_REG_PC => state.pc_off = factored(n as i64, data_align),
                        _ => {}
                    }
                }
                DW_CFA_RESTORE => {
                    if (op & 0x3f) as u64 == DW_REG_FP {
                        state.fp_off = SAME_FP;
                    }
                }
                // op >> 6 has no other values.
                _ => {}
            }
        }

        table.push(state.desc(loc));
        Ok(())
    }
}

fn cfa_reg_from_dwarf(reg: u64) -> CfaReg {
    match reg {
        DW_REG_SP => CfaReg::Sp,
        DW_REG_FP => CfaReg::Fp,
        _ => CfaReg::Invalid,
    }
}

fn factored(value: i64, data_align: i32) -> i32 {
    value.wrapping_mul(data_align as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::LINKED_FRAME_SIZE;

    const TEXT_BASE: u64 = 0x1_0000_0000;

    fn build_cie() -> Vec<u8> {
        let mut cie = Vec::new();
        cie.extend_from_slice(&0u32.to_le_bytes()); // CIE id
        cie.push(1); // version
        cie.extend_from_slice(b"zR\0");
        cie.push(0x01); // code alignment factor 1
        cie.push(0x78); // data alignment factor -8
        cie.push(DW_REG_PC as u8); // return address register
        cie.push(0x01); // augmentation data length
        cie.push(0x1b); // FDE pointer encoding
        while cie.len() % 4 != 0 {
            cie.push(DW_CFA_NOP);
        }
        let mut out = (cie.len() as u32).to_le_bytes().to_vec();
        out.extend(cie);
        out
    }

    fn build_fde(eh_frame: &mut Vec<u8>, func: u32, range: u32, instructions: &[u8]) -> usize {
        let offset = eh_frame.len();
        let fde_start = offset + 4;
        let mut body = Vec::new();
        body.extend_from_slice(&(fde_start as u32).to_le_bytes()); // backpointer to the CIE at 0
        body.extend_from_slice(&(TEXT_BASE + func as u64).to_le_bytes());
        body.extend_from_slice(&range.to_le_bytes());
        body.push(0x00); // augmentation data length
        body.extend_from_slice(instructions);
        eh_frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        eh_frame.extend(body);
        offset
    }

    fn parse(instructions: &[u8], func: u32, range: u32) -> Vec<FrameDesc> {
        let mut eh_frame = build_cie();
        let fde = build_fde(&mut eh_frame, func, range, instructions);
        let section = Section { addr: 0x2000, data: &eh_frame };
        let mut parser = CfiParser::new(section, TEXT_BASE, "libtest.dylib");
        let mut table = FrameTable::new();
        parser.parse_fde_at(fde, &mut table).unwrap();
        table.into_records()
    }

    #[test]
    fn test_empty_fde() {
        let records = parse(&[], 0x100, 0x40);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], FrameDesc::empty_frame(0x100));
        assert_eq!(records[1], FrameDesc::linked_frame(0x140));
    }

    #[test]
    fn test_prologue_then_stack_growth() {
        let instructions = [
            DW_CFA_DEF_CFA,
            DW_REG_SP as u8,
            16,
            0x80 | DW_REG_FP as u8, // offset FP at -16
            2,
            0x80 | DW_REG_PC as u8, // offset PC at -8
            1,
            0x40 | 32, // advance_loc 32
            DW_CFA_DEF_CFA_OFFSET,
            24,
            0x40 | 16, // advance_loc 16
        ];
        let records = parse(&instructions, 0x100, 0x40);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], FrameDesc::new(0x100, CfaReg::Sp, 16, -16, -8));
        assert_eq!(records[1], FrameDesc::new(0x120, CfaReg::Sp, 24, -16, -8));
        // The final record at 0x130 repeats the rule at 0x120 and is
        // suppressed; the range-end sentinel remains.
        assert_eq!(records[2], FrameDesc::linked_frame(0x140));
    }

    #[test]
    fn test_remember_restore_state() {
        let instructions = [
            DW_CFA_DEF_CFA,
            DW_REG_SP as u8,
            8,
            0x40 | 4,
            DW_CFA_REMEMBER_STATE,
            DW_CFA_DEF_CFA,
            DW_REG_SP as u8,
            32,
            0x40 | 4,
            DW_CFA_RESTORE_STATE,
            0x40 | 4,
        ];
        let records = parse(&instructions, 0x100, 0x40);
        assert_eq!(records.len(), 4);
        let offsets: Vec<i32> = records[..3].iter().map(|f| f.cfa_off()).collect();
        assert_eq!(offsets, vec![8, 32, 8]);
        assert_eq!(records[3], FrameDesc::linked_frame(0x140));
    }

    #[test]
    fn test_restore_state_without_remember() {
        let instructions = [
            DW_CFA_DEF_CFA,
            DW_REG_SP as u8,
            32,
            0x40 | 4,
            DW_CFA_RESTORE_STATE,
            0x40 | 4,
        ];
        let records = parse(&instructions, 0x100, 0x40);
        // Falls back to the function-entry state.
        assert_eq!(records[1], FrameDesc::empty_frame(0x104));
    }

    #[test]
    fn test_val_expression_pc_offset() {
        let instructions = [
            DW_CFA_VAL_EXPRESSION,
            DW_REG_PC as u8,
            2, // expression length
            DW_OP_BREG_PC,
            0x7c, // sleb128 -4
        ];
        let records = parse(&instructions, 0x100, 0x40);
        assert_eq!(records[0].fp_off, PC_OFFSET | -4 << 1);
        assert_eq!(records[0].cfa_off(), EMPTY_FRAME_SIZE);
        assert_eq!(records[0].pc_off, -EMPTY_FRAME_SIZE);
    }

    #[test]
    fn test_unknown_instruction_abandons_fde() {
        let instructions = [
            DW_CFA_DEF_CFA,
            DW_REG_SP as u8,
            16,
            0x40 | 8, // advance_loc 8
            0x3f,     // not a call frame instruction
            DW_CFA_DEF_CFA_OFFSET,
            48,
        ];
        let records = parse(&instructions, 0x100, 0x40);
        // The prefix before the bad opcode survives, the rest of the FDE is
        // dropped, and the range-end sentinel is still pinned.
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], FrameDesc::new(0x100, CfaReg::Sp, 16, SAME_FP, -EMPTY_FRAME_SIZE));
        assert_eq!(records[1], FrameDesc::linked_frame(0x140));
    }

    #[test]
    fn test_set_loc_ends_fde() {
        let instructions = [
            DW_CFA_DEF_CFA,
            DW_REG_SP as u8,
            32,
            DW_CFA_SET_LOC,
            0xde,
            0xad,
            0xbe,
            0xef,
        ];
        let records = parse(&instructions, 0x100, 0x40);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].cfa_off(), 32);
        assert_eq!(records[1], FrameDesc::linked_frame(0x140));
    }

    #[test]
    fn test_def_cfa_expression_marks_invalid() {
        let instructions = [
            DW_CFA_DEF_CFA_EXPRESSION,
            3, // not the PLT shape
            0x77,
            0x08,
            0x22,
            0x40 | 4,
        ];
        let records = parse(&instructions, 0x100, 0x40);
        assert_eq!(records[0].cfa_reg(), CfaReg::Invalid);
        assert_eq!(records[0].cfa_off(), STACK_SLOT);
    }

    #[test]
    fn test_def_cfa_expression_plt_shape() {
        let mut instructions = vec![DW_CFA_DEF_CFA_EXPRESSION, PLT_CFA_EXPRESSION_LEN as u8];
        instructions.extend_from_slice(&[0u8; PLT_CFA_EXPRESSION_LEN]);
        instructions.push(0x40 | 4);
        let records = parse(&instructions, 0x100, 0x40);
        assert_eq!(records[0].cfa_reg(), CfaReg::Plt);
    }

    #[test]
    fn test_linked_frame_sentinel_values() {
        let records = parse(&[], 0x100, 0x40);
        let sentinel = records[1];
        assert_eq!(sentinel.cfa_reg(), CfaReg::Fp);
        assert_eq!(sentinel.cfa_off(), LINKED_FRAME_SIZE);
        assert_eq!(sentinel.fp_off, -LINKED_FRAME_SIZE);
        assert_eq!(sentinel.pc_off, -LINKED_FRAME_SIZE + STACK_SLOT);
    }
}
