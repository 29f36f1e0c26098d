//! Host architecture detection.
//!
//! Compact unwind opcodes mean different things on x86 and ARM64, and the
//! section itself does not say which it is. The decision is made once from
//! the machine name the kernel reports and cached for the process
//! lifetime; racing initializers compute the same value.

use lazy_static::lazy_static;
use std::ffi::CStr;
use std::mem;

/// Which compact-unwind dispatch table applies to this process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HostArch {
    X86,
    Arm64,
}

lazy_static! {
    static ref HOST_ARCH: HostArch = detect();
}

impl HostArch {
    /// The cached host architecture.
    pub fn get() -> HostArch {
        *HOST_ARCH
    }
}

fn detect() -> HostArch {
    let mut info = unsafe { mem::zeroed::<libc::utsname>() };
    if unsafe { libc::uname(&mut info) } == 0 {
        let machine = unsafe { CStr::from_ptr(info.machine.as_ptr()) };
        if let Ok(machine) = machine.to_str() {
            // "x86_64" and "i686" both contain "x86"; FreeBSD reports
            // "amd64" instead.
            if machine.contains("x86") || machine.contains("amd64") {
                return HostArch::X86;
            }
        }
    }
    HostArch::Arm64
}
