//! The per-image parser driver.
//!
//! The image enumerator memory-maps the unwind metadata of every loaded
//! library and hands it over as borrowed byte ranges; this module picks the
//! metadata source, runs the decoders, and produces the finished table.

use crate::arch::HostArch;
use crate::compact;
use crate::dwarf::cfi::CfiParser;
use crate::dwarf::header;
use crate::table::FrameTable;
use lazy_static::lazy_static;
use std::collections::HashSet;
use std::ffi::CString;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// A mapped section: its address in the process plus the bytes behind it.
/// Carrying the address lets cross-section references (the datarel FDE
/// pointers of `.eh_frame_hdr`) resolve without touching raw memory.
#[derive(Debug, Default, Copy, Clone)]
pub struct Section<'a> {
    pub addr: u64,
    pub data: &'a [u8],
}

/// Everything the enumerator knows about one loaded image. Sections that
/// the binary does not carry stay `None`.
#[derive(Debug, Default, Copy, Clone)]
pub struct ImageInfo<'a> {
    pub name: &'a str,
    /// Address the image's text is based at; all `loc` values are relative
    /// to it.
    pub text_base: u64,
    pub eh_frame_hdr: Option<Section<'a>>,
    pub eh_frame: Option<Section<'a>>,
    pub unwind_info: Option<Section<'a>>,
    pub stubs_addr: Option<u64>,
}

/// Build the frame table for one image.
///
/// Compact unwind is the primary source when present (its DWARF-kind
/// opcodes delegate into `.eh_frame`); otherwise the `.eh_frame_hdr` FDE
/// list is walked. Construction performs no I/O and touches only the
/// borrowed ranges.
pub fn build_table(image: &ImageInfo<'_>) -> FrameTable {
    build_table_with_arch(image, HostArch::get())
}

/// [build_table] with the architecture pinned by the caller. Parsing the
/// same image twice under the same arch yields identical tables.
pub fn build_table_with_arch(image: &ImageInfo<'_>, arch: HostArch) -> FrameTable {
    let mut table = FrameTable::new();
    let mut cfi = image
        .eh_frame
        .map(|section| CfiParser::new(section, image.text_base, image.name));

    if let Some(unwind_info) = image.unwind_info {
        let result = compact::parse(
            unwind_info,
            arch,
            image.text_base,
            image.name,
            cfi.as_mut(),
            image.stubs_addr,
            &mut table,
        );
        if let Err(err) = result {
            warn!("{} in {}", err, image.name);
        }
    } else if let (Some(hdr), Some(cfi)) = (image.eh_frame_hdr, cfi.as_mut()) {
        if let Err(err) = header::parse(hdr, cfi, &mut table) {
            warn!("{} in {}", err, image.name);
        }
    }

    table.finish();
    table
}

lazy_static! {
    /// Text bases of images that already went through [parse_image]; also
    /// the lock serialising the symbol-parse entry point.
    static ref PARSED_IMAGES: Mutex<HashSet<u64>> = Mutex::new(HashSet::new());
}

/// The process-facing entry point: build the table for an image exactly
/// once, with the image pinned against unloading for the duration.
///
/// Returns `None` when the image was parsed before or is being unloaded.
/// The caller owns the returned table; publishing it to a concurrent
/// sampler requires a release-store of the pointer.
pub fn parse_image(image: &ImageInfo<'_>) -> Option<FrameTable> {
    let mut parsed = PARSED_IMAGES
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if !parsed.insert(image.text_base) {
        return None;
    }
    let _pin = UnloadGuard::acquire(image.name)?;
    Some(build_table(image))
}

/// Scoped pin on a loaded image.
///
/// `dlopen` with `RTLD_NOLOAD` bumps the loader's reference count only if
/// the library is still resident, so the borrowed metadata cannot be
/// unmapped while a guard is alive; the handle is released on every exit
/// path by `Drop`.
pub struct UnloadGuard {
    handle: *mut libc::c_void,
}

impl UnloadGuard {
    pub fn acquire(name: &str) -> Option<Self> {
        let name = CString::new(name).ok()?;
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
        if handle.is_null() {
            None
        } else {
            Some(UnloadGuard { handle })
        }
    }
}

impl Drop for UnloadGuard {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}
