//! Mach-O compact unwind decoder.
//!
//! The `__unwind_info` section is a two-level index designed for in-place
//! binary search:
//!
//! - a header (seven 32-bit words: version, global opcode array offset and
//!   length, personality array offset and length, page array offset and
//!   length);
//! - a top-level array of `(first_address, page_offset, lsda_index_offset)`
//!   triples, one per second-level page, terminated by a sentinel entry;
//! - second-level pages of kind 2 (regular: `(function_offset, opcode)`
//!   pairs) or kind 3 (compressed: one 32-bit word per function packing an
//!   opcode-array index in the high byte and a page-relative function
//!   offset in the low 24 bits).
//!
//! Each 32-bit opcode selects its meaning by the low nibble of the high
//! byte; the interpretation differs between x86 and ARM64, so the decoder
//! dispatches on the host architecture. DWARF-kind opcodes carry a byte
//! offset into `__eh_frame` and are handed to the CFI interpreter.

use crate::arch::HostArch;
use crate::cursor::Cursor;
use crate::dwarf::cfi::CfiParser;
use crate::image::Section;
use crate::table::{CfaReg, FrameDesc, FrameTable, SAME_FP, STACK_SLOT};
use crate::{Error, Result};
use tracing::warn;

const UNWIND_SECTION_VERSION: u32 = 1;

const PAGE_KIND_REGULAR: u32 = 2;
const PAGE_KIND_COMPRESSED: u32 = 3;

// x86_64 opcode kinds.
const X86_MODE_FRAMELESS: u32 = 2;
const X86_MODE_DWARF: u32 = 3;
const X86_MODE_FRAME: u32 = 4;

// ARM64 opcode kinds. Kind 3 is reserved; no unwind rule is known for it.
const ARM64_MODE_FRAME: u32 = 1;
const ARM64_MODE_FRAMELESS: u32 = 2;
const ARM64_MODE_DWARF: u32 = 4;

/// Decode an entire `__unwind_info` section into the table.
///
/// `cfi` must be the image's `.eh_frame` parser when the section contains
/// DWARF-kind opcodes; entries delegating to a missing section are skipped.
/// When `stubs_addr` names the image's `__stubs` section, an empty-frame
/// record is pinned there so walks landing in a PLT stub attribute the
/// return address to the top of the stack.
pub fn parse(
    unwind_info: Section<'_>,
    arch: HostArch,
    image_base: u64,
    image: &str,
    cfi: Option<&mut CfiParser<'_>>,
    stubs_addr: Option<u64>,
    table: &mut FrameTable,
) -> Result<()> {
    let mut cursor = Cursor::new(unwind_info.data);
    let version = cursor.u32()?;
    if version != UNWIND_SECTION_VERSION {
        return Err(Error::UnsupportedCompactVersion(version));
    }
    let global_opcodes_offset = cursor.u32()?;
    let global_opcodes_len = cursor.u32()?;
    cursor.u32()?; // personalities offset
    cursor.u32()?; // personalities count
    let pages_offset = cursor.u32()?;
    let pages_len = cursor.u32()?;

    let mut decoder = Decoder {
        data: unwind_info.data,
        arch,
        image_base,
        cfi,
        global_opcodes_offset,
        global_opcodes_len,
    };

    // A lying page count must not turn into a long loop of failed reads.
    let present = unwind_info.data.len().saturating_sub(pages_offset as usize) / 12;
    let pages_len = (pages_len as usize).min(present);

    for i in 0..pages_len {
        cursor.seek(pages_offset as usize + i * 12);
        let first_address = cursor.u32()?;
        let page_offset = cursor.u32()?;
        cursor.u32()?; // lsda index offset
        if let Err(err) = decoder.parse_page(page_offset, first_address, table) {
            warn!("abandoned unwind page at {:#x} in {}: {}", page_offset, image, err);
        }
    }

    if let Some(stubs) = stubs_addr {
        table.push(FrameDesc::empty_frame(stubs.wrapping_sub(image_base) as u32));
    }
    Ok(())
}

struct Decoder<'a, 'c, 'p> {
    data: &'a [u8],
    arch: HostArch,
    image_base: u64,
    cfi: Option<&'c mut CfiParser<'p>>,
    global_opcodes_offset: u32,
    global_opcodes_len: u32,
}

impl Decoder<'_, '_, '_> {
    fn parse_page(&mut self, page_offset: u32, first_address: u32, table: &mut FrameTable) -> Result<()> {
        let mut cursor = Cursor::new(self.data);
        cursor.seek(page_offset as usize);
        match cursor.u32()? {
            PAGE_KIND_REGULAR => {
                let entries_offset = cursor.u16()?;
                let entries_len = cursor.u16()?;
                for i in 0..entries_len {
                    cursor.seek(page_offset as usize + entries_offset as usize + i as usize * 8);
                    let function_offset = cursor.u32()?;
                    let opcode = cursor.u32()?;
                    self.parse_opcode(self.image_base + function_offset as u64, opcode, table)?;
                }
            }
            PAGE_KIND_COMPRESSED => {
                let entries_offset = cursor.u16()?;
                let entries_len = cursor.u16()?;
                let local_opcodes_offset = cursor.u16()?;
                cursor.u16()?; // local opcodes length
                for i in 0..entries_len {
                    cursor.seek(page_offset as usize + entries_offset as usize + i as usize * 4);
                    let entry = cursor.u32()?;
                    let opcode_index = entry >> 24;
                    let rel_offset = entry & 0x00ff_ffff;
                    let location = self.image_base + first_address as u64 + rel_offset as u64;
                    let opcode = if opcode_index < self.global_opcodes_len {
                        self.opcode_at(self.global_opcodes_offset as usize + opcode_index as usize * 4)?
                    } else {
                        let local_index = (opcode_index - self.global_opcodes_len) as usize;
                        self.opcode_at(
                            page_offset as usize + local_opcodes_offset as usize + local_index * 4,
                        )?
                    };
                    self.parse_opcode(location, opcode, table)?;
                }
            }
            // The trailing sentinel page, or something newer than we know.
            _ => {}
        }
        Ok(())
    }

    fn parse_opcode(&mut self, location: u64, opcode: u32, table: &mut FrameTable) -> Result<()> {
        let kind = opcode >> 24 & 0x0f;
        let data = opcode & 0x00ff_ffff;
        let loc = location.wrapping_sub(self.image_base) as u32;

        match self.arch {
            HostArch::X86 => match kind {
                X86_MODE_FRAMELESS => {
                    // Stack-immediate frameless: frame size in 16-byte units.
                    table.push(FrameDesc::new(loc, CfaReg::Sp, data as i32 * 16, SAME_FP, 0));
                }
                X86_MODE_DWARF => self.delegate_to_dwarf(data as usize, table)?,
                X86_MODE_FRAME => table.push(FrameDesc::linked_frame(loc)),
                _ => {}
            },
            HostArch::Arm64 => match kind {
                ARM64_MODE_FRAME => table.push(FrameDesc::linked_frame(loc)),
                ARM64_MODE_FRAMELESS => {
                    table.push(FrameDesc::new(
                        loc,
                        CfaReg::Sp,
                        data as i32 * STACK_SLOT,
                        SAME_FP,
                        -STACK_SLOT,
                    ));
                }
                ARM64_MODE_DWARF => self.delegate_to_dwarf(data as usize, table)?,
                _ => {}
            },
        }
        Ok(())
    }

    fn delegate_to_dwarf(&mut self, offset: usize, table: &mut FrameTable) -> Result<()> {
        match self.cfi.as_mut() {
            Some(cfi) => cfi.parse_fde_at(offset, table),
            // No .eh_frame to delegate into; the entry produces nothing.
            None => Ok(()),
        }
    }

    fn opcode_at(&self, offset: usize) -> Result<u32> {
        let mut cursor = Cursor::new(self.data);
        cursor.seek(offset);
        cursor.u32()
    }
}
