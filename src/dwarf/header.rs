//! `.eh_frame_hdr` traversal.
//!
//! The header carries a binary-search table of `(initial_location,
//! fde_pointer)` pairs covering every FDE of the image. At build time the
//! profiler does not search it -- it walks the whole table once and feeds
//! every FDE to the CFI interpreter.

use crate::cursor::Cursor;
use crate::dwarf::cfi::CfiParser;
use crate::dwarf::consts::{DW_EH_PE_DATAREL, DW_EH_PE_UDATA4};
use crate::image::Section;
use crate::table::FrameTable;
use crate::{Error, Result};
use tracing::warn;

/// The only table encoding the traversal understands: 4-byte values
/// relative to the header start. Bit 0x08 is the signedness of the entry
/// type and does not change the layout.
const SUPPORTED_TABLE_ENC: u8 = DW_EH_PE_DATAREL | DW_EH_PE_UDATA4;

/// Walk every FDE listed in `.eh_frame_hdr`, appending records through the
/// given CFI parser. An unsupported encoding combination produces no
/// entries and surfaces as an error for the driver to warn about.
pub fn parse(hdr: Section<'_>, cfi: &mut CfiParser<'_>, table: &mut FrameTable) -> Result<()> {
    let mut cursor = Cursor::new(hdr.data);
    let version = cursor.u8()?;
    let eh_frame_ptr_enc = cursor.u8()?;
    let fde_count_enc = cursor.u8()?;
    let table_enc = cursor.u8()?;
    if version != 1
        || eh_frame_ptr_enc & 0x07 != DW_EH_PE_UDATA4
        || fde_count_enc & 0x07 != DW_EH_PE_UDATA4
        || table_enc & 0xf7 != SUPPORTED_TABLE_ENC
    {
        return Err(Error::UnsupportedEhFrameHdr(
            version,
            eh_frame_ptr_enc,
            fde_count_enc,
            table_enc,
        ));
    }

    cursor.seek(8);
    let fde_count = cursor.u32()? as usize;
    // A lying count must not turn into a long loop of failed reads.
    let present = hdr.data.len().saturating_sub(16) / 8;
    let fde_count = fde_count.min(present);

    for i in 0..fde_count {
        // Pairs start at byte 16 minus the initial_location field, so the
        // fde_pointer of entry i sits at 16 + 8i.
        cursor.seek(16 + i * 8);
        let fde_ptr = cursor.u32()? as u64;
        match hdr.addr.wrapping_add(fde_ptr).checked_sub(cfi.section_addr()) {
            Some(offset) => {
                if let Err(err) = cfi.parse_fde_at(offset as usize, table) {
                    warn!("abandoned FDE at {:#x} in {}: {}", offset, cfi.image(), err);
                }
            }
            None => {
                warn!("FDE pointer {:#x} outside .eh_frame in {}", fde_ptr, cfi.image());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::consts::{DW_CFA_NOP, DW_REG_PC};
    use crate::table::FrameDesc;

    const TEXT_BASE: u64 = 0x7000_0000;
    const EH_FRAME_ADDR: u64 = 0x2000;
    const HDR_ADDR: u64 = 0x1800;

    /// A CIE (code align 1, data align -8) followed by one opcode-free FDE
    /// covering [func, func + range).
    fn build_eh_frame(func: u32, range: u32) -> (Vec<u8>, usize) {
        let mut cie = Vec::new();
        cie.extend_from_slice(&0u32.to_le_bytes());
        cie.push(1);
        cie.extend_from_slice(b"zR\0");
        cie.push(0x01);
        cie.push(0x78);
        cie.push(DW_REG_PC as u8);
        cie.push(0x01);
        cie.push(0x1b);
        while cie.len() % 4 != 0 {
            cie.push(DW_CFA_NOP);
        }
        let mut eh_frame = (cie.len() as u32).to_le_bytes().to_vec();
        eh_frame.extend(cie);

        let fde_offset = eh_frame.len();
        let mut body = Vec::new();
        body.extend_from_slice(&((fde_offset + 4) as u32).to_le_bytes());
        body.extend_from_slice(&(TEXT_BASE + func as u64).to_le_bytes());
        body.extend_from_slice(&range.to_le_bytes());
        body.push(0x00);
        eh_frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        eh_frame.extend(body);
        (eh_frame, fde_offset)
    }

    fn build_hdr(fde_count: u32, fde_offsets: &[usize]) -> Vec<u8> {
        let mut hdr = vec![0x01, 0x1b, 0x03, 0x3b];
        hdr.extend_from_slice(&0u32.to_le_bytes()); // eh_frame_ptr, unused
        hdr.extend_from_slice(&fde_count.to_le_bytes());
        for &offset in fde_offsets {
            let fde_ptr = (EH_FRAME_ADDR + offset as u64 - HDR_ADDR) as u32;
            hdr.extend_from_slice(&0u32.to_le_bytes()); // initial_location, unused
            hdr.extend_from_slice(&fde_ptr.to_le_bytes());
        }
        hdr
    }

    #[test]
    fn test_walks_all_fdes() {
        let (eh_frame, fde_offset) = build_eh_frame(0x500, 0x80);
        let hdr = build_hdr(1, &[fde_offset]);

        let mut cfi = CfiParser::new(
            Section { addr: EH_FRAME_ADDR, data: &eh_frame },
            TEXT_BASE,
            "libtest.so",
        );
        let mut table = FrameTable::new();
        parse(Section { addr: HDR_ADDR, data: &hdr }, &mut cfi, &mut table).unwrap();

        assert_eq!(table.records().len(), 2);
        assert_eq!(table.records()[0], FrameDesc::empty_frame(0x500));
        assert_eq!(table.records()[1], FrameDesc::linked_frame(0x580));
    }

    #[test]
    fn test_unsupported_header_rejected() {
        let hdr = [0x02, 0x03, 0x03, 0x33, 0, 0, 0, 0];
        let (eh_frame, _) = build_eh_frame(0, 0x10);
        let mut cfi = CfiParser::new(
            Section { addr: EH_FRAME_ADDR, data: &eh_frame },
            TEXT_BASE,
            "libtest.so",
        );
        let mut table = FrameTable::new();
        let err = parse(Section { addr: HDR_ADDR, data: &hdr }, &mut cfi, &mut table).unwrap_err();
        assert_eq!(err, Error::UnsupportedEhFrameHdr(0x02, 0x03, 0x03, 0x33));
        assert!(table.is_empty());
    }

    #[test]
    fn test_fde_count_clamped_to_table_size() {
        let (eh_frame, fde_offset) = build_eh_frame(0x500, 0x80);
        // Claims 1000 FDEs but carries one pair.
        let hdr = build_hdr(1000, &[fde_offset]);

        let mut cfi = CfiParser::new(
            Section { addr: EH_FRAME_ADDR, data: &eh_frame },
            TEXT_BASE,
            "libtest.so",
        );
        let mut table = FrameTable::new();
        parse(Section { addr: HDR_ADDR, data: &hdr }, &mut cfi, &mut table).unwrap();
        assert_eq!(table.records().len(), 2);
    }
}
