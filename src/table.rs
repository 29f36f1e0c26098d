//! The frame-descriptor table: the output of every metadata parser and the
//! only thing the sampler ever touches at signal time.

/// CFA offset of a function that has not yet executed its prologue: the
/// return-address slot pushed (or reserved) by the call itself.
pub const EMPTY_FRAME_SIZE: i32 = 8;

/// Size of a standard frame-pointer-chained activation record: one slot
/// each for the saved FP and the return address.
pub const LINKED_FRAME_SIZE: i32 = 16;

/// One stack slot on a 64-bit target.
pub const STACK_SLOT: i32 = 8;

/// `fp_off` sentinel: the caller's frame pointer equals the callee's.
pub const SAME_FP: i32 = i32::MIN;

/// `fp_off` tag bit: the frame saves no FP and the caller's return address
/// is at a PC-relative offset, stored as `PC_OFFSET | (offset << 1)`.
pub const PC_OFFSET: i32 = 1;

/// The register a CFA rule is based on.
///
/// The selector is a closed set; a `def_cfa` naming any other DWARF
/// register maps to [Invalid](CfaReg::Invalid), which tells the sampler
/// not to unwind past that PC.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CfaReg {
    Sp = 0,
    Fp = 1,
    /// PLT stub: the CFA depends on which slot of the stub the PC is in.
    Plt = 2,
    Invalid = 3,
}

impl CfaReg {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CfaReg::Sp,
            1 => CfaReg::Fp,
            2 => CfaReg::Plt,
            _ => CfaReg::Invalid,
        }
    }
}

/// Unwind rule for one code range.
///
/// The entry is authoritative for `[loc, next_entry.loc)`. `cfa` packs the
/// [CfaReg] selector in the low 8 bits and a signed offset in the upper 24;
/// `fp_off` and `pc_off` are CFA-relative byte offsets of the saved frame
/// pointer and return address, subject to the [SAME_FP] and [PC_OFFSET]
/// encodings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameDesc {
    pub loc: u32,
    pub cfa: i32,
    pub fp_off: i32,
    pub pc_off: i32,
}

impl FrameDesc {
    pub fn new(loc: u32, cfa_reg: CfaReg, cfa_off: i32, fp_off: i32, pc_off: i32) -> Self {
        Self {
            loc,
            cfa: cfa_reg as u8 as i32 | cfa_off << 8,
            fp_off,
            pc_off,
        }
    }

    /// Rule for code that has not established a frame: the return address
    /// sits at the top of the stack.
    pub fn empty_frame(loc: u32) -> Self {
        Self::new(loc, CfaReg::Sp, EMPTY_FRAME_SIZE, SAME_FP, -EMPTY_FRAME_SIZE)
    }

    /// Rule for a standard frame-pointer-chained frame; also the default
    /// assumed past the end of every FDE.
    pub fn linked_frame(loc: u32) -> Self {
        Self::new(
            loc,
            CfaReg::Fp,
            LINKED_FRAME_SIZE,
            -LINKED_FRAME_SIZE,
            -LINKED_FRAME_SIZE + STACK_SLOT,
        )
    }

    #[inline]
    pub fn cfa_reg(&self) -> CfaReg {
        CfaReg::from_u8((self.cfa & 0xff) as u8)
    }

    #[inline]
    pub fn cfa_off(&self) -> i32 {
        self.cfa >> 8
    }

    #[inline]
    fn same_rule(&self, other: &FrameDesc) -> bool {
        self.cfa == other.cfa && self.fp_off == other.fp_off && self.pc_off == other.pc_off
    }
}

/// Append-only store of [FrameDesc] records, sorted on
/// [finish](FrameTable::finish).
///
/// The table is built single-threaded during symbol parsing and immutable
/// afterwards. A builder that publishes the finished table to a concurrent
/// sampler must do so through a release-store of the table pointer (with a
/// matching acquire-load on the reader side); the table itself carries no
/// synchronization.
#[derive(Debug, Default)]
pub struct FrameTable {
    records: Vec<FrameDesc>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            records: Vec::with_capacity(128),
        }
    }

    /// Append a record, deduplicating against the previous one:
    /// a record at the same `loc` supersedes its predecessor, and a record
    /// repeating the predecessor's rule is dropped.
    pub fn push(&mut self, desc: FrameDesc) {
        if let Some(prev) = self.records.last_mut() {
            if prev.loc == desc.loc {
                *prev = desc;
                return;
            }
            if prev.same_rule(&desc) {
                return;
            }
        }
        self.records.push(desc);
    }

    /// Sort by `loc` and re-establish the dedup invariants across producer
    /// boundaries: equal locations collapse to the later-written record,
    /// adjacent identical rules collapse to the earlier one.
    pub fn finish(&mut self) {
        self.records.sort_by_key(|f| f.loc);
        let mut merged: Vec<FrameDesc> = Vec::with_capacity(self.records.len());
        for desc in self.records.iter().copied() {
            if let Some(last) = merged.last_mut() {
                if last.loc == desc.loc {
                    *last = desc;
                    continue;
                }
                if last.same_rule(&desc) {
                    continue;
                }
            }
            merged.push(desc);
        }
        self.records = merged;
    }

    #[inline]
    pub fn records(&self) -> &[FrameDesc] {
        &self.records
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The record authoritative for `pc`: greatest `loc <= pc`. Valid only
    /// after [finish](FrameTable::finish).
    pub fn find(&self, pc: u32) -> Option<&FrameDesc> {
        match self.records.binary_search_by_key(&pc, |f| f.loc) {
            Ok(i) => Some(&self.records[i]),
            Err(0) => None,
            Err(i) => Some(&self.records[i - 1]),
        }
    }

    /// Hand the backing storage off to the owner of the published table.
    pub fn into_records(self) -> Vec<FrameDesc> {
        self.records
    }
}
