//! A restricted DWARF expression evaluator.
//!
//! `DW_CFA_val_expression` on the return-address column is the only place
//! the profiler needs expressions: the linker emits a small
//! "previous PC = current PC plus/minus constant" program for leaf code
//! that keeps its return address in a register. Anything outside that
//! shape aborts the expression and falls back to the default rule.

use crate::cursor::Cursor;
use crate::dwarf::consts::*;
use crate::Result;
use tracing::warn;

/// Evaluate the expression blob at the cursor (ULEB length followed by the
/// program) and return the offset of the previous PC from the current PC,
/// or 0 if the program is not of the supported shape. The cursor always
/// ends up past the blob.
pub fn evaluate_pc_offset(cursor: &mut Cursor<'_>, image: &str) -> Result<i32> {
    let len = cursor.uleb128()? as usize;
    let end = cursor.pos().saturating_add(len);

    let mut pc_off: i32 = 0;
    let mut tos: i32 = 0;

    while cursor.pos() < end {
        let op = cursor.u8()?;
        match op {
            DW_OP_BREG_PC => pc_off = cursor.sleb128()? as i32,
            DW_OP_CONST1U => tos = cursor.u8()? as i32,
            DW_OP_CONST1S => tos = cursor.u8()? as i8 as i32,
            DW_OP_CONST2U => tos = cursor.u16()? as i32,
            DW_OP_CONST2S => tos = cursor.u16()? as i16 as i32,
            DW_OP_CONST4U | DW_OP_CONST4S => tos = cursor.u32()? as i32,
            DW_OP_CONSTU => tos = cursor.uleb128()? as i32,
            DW_OP_CONSTS => tos = cursor.sleb128()? as i32,
            DW_OP_MINUS => pc_off = pc_off.wrapping_sub(tos),
            DW_OP_PLUS => pc_off = pc_off.wrapping_add(tos),
            _ => {
                warn!("unknown DWARF expression opcode {:#x} in {}", op, image);
                cursor.seek(end);
                return Ok(0);
            }
        }
    }
    Ok(pc_off)
}
