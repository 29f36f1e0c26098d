//! Compiles the unwind metadata embedded in loaded native binaries into
//! compact, address-sorted frame-descriptor tables.
//!
//! A sampling profiler cannot call the libc unwinder from a signal
//! handler, so it prepares ahead of time: at symbol-parse time each
//! image's `.eh_frame`/`.eh_frame_hdr` (DWARF call frame information) or
//! `__unwind_info` (Apple compact unwind, with DWARF fallback) is distilled
//! into a sorted [FrameDesc] table. At sample time the signal handler only
//! binary-searches that table to recover the caller's stack pointer, frame
//! pointer and return address for any PC.
//!
//! Building a table for an image the enumerator has mapped:
//! ```
//! use unwind_table::{build_table, ImageInfo};
//!
//! let image = ImageInfo {
//!     name: "libdemo.dylib",
//!     text_base: 0x1_0000_0000,
//!     ..Default::default()
//! };
//! let table = build_table(&image);
//! assert!(table.records().is_empty());
//! ```
//!
//! A malformed image never takes the process down: the worst outcome of
//! bad metadata is an empty or truncated table, for which the sampler
//! falls back to not unwinding past the unresolvable PC.

pub mod arch;
pub mod compact;
mod cursor;
pub mod dwarf;
mod image;
mod table;

pub use arch::HostArch;
pub use cursor::Cursor;
pub use image::{build_table, build_table_with_arch, parse_image, ImageInfo, Section, UnloadGuard};
pub use table::{
    CfaReg, FrameDesc, FrameTable, EMPTY_FRAME_SIZE, LINKED_FRAME_SIZE, PC_OFFSET, SAME_FP,
    STACK_SLOT,
};

/// A result type that wraps [Error].
pub type Result<T> = std::result::Result<T, Error>;

/// Error definition.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("truncated data at offset {0:#x}")]
    Truncated(usize),

    #[error("malformed leb128 at offset {0:#x}")]
    MalformedLeb128(usize),

    #[error("unsupported .eh_frame_hdr encoding [{0:02x}{1:02x}{2:02x}{3:02x}]")]
    UnsupportedEhFrameHdr(u8, u8, u8, u8),

    #[error("unsupported __unwind_info version {0}")]
    UnsupportedCompactVersion(u32),
}
