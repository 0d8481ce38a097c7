//! Operating-system services the patcher needs, behind one trait.
//!
//! The engine never touches page tables, thread lists or executable memory
//! directly. It asks a [`PlatformPatcher`], which lets tests substitute
//! [`fake::FakePatcher`] and lets the engine choose a strategy from
//! [`Capabilities`] at call time.

use std::time::Duration;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod darwin;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub mod unsupported;

#[cfg(target_os = "linux")]
pub type NativePatcher = linux::LinuxPatcher;

#[cfg(target_os = "macos")]
pub type NativePatcher = darwin::DarwinPatcher;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub type NativePatcher = unsupported::UnsupportedPatcher;

/// What a platform can do. Every field is probed once at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Code pages can be rewritten in place (Replace mode).
    pub inline_patch: bool,
    /// Attach wrappers can be generated for this architecture.
    pub attach: bool,
    /// Pages may never be writable and executable at once.
    pub wx_exclusive: bool,
    /// A write path exists that ignores page protection.
    pub forced_write: bool,
    /// Other threads can be stopped during a patch.
    pub thread_suspend: bool,
    /// Code can be allocated inside a requested address window.
    pub near_allocation: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    pub const NONE: Protection = Protection { read: false, write: false, execute: false };
    pub const READ: Protection = Protection { read: true, write: false, execute: false };
    pub const READ_WRITE: Protection = Protection { read: true, write: true, execute: false };
    pub const READ_EXECUTE: Protection = Protection { read: true, write: false, execute: true };
    pub const ALL: Protection = Protection { read: true, write: true, execute: true };
}

impl std::fmt::Display for Protection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flag = |on: bool, c: char| if on { c } else { '-' };
        write!(f, "{}{}{}", flag(self.read, 'r'), flag(self.write, 'w'), flag(self.execute, 'x'))
    }
}

/// One contiguous mapping with uniform protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub protection: Protection,
}

impl Region {
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Plain store; the caller has made the pages writable.
    Direct,
    /// Kernel-assisted write that works on read-only pages.
    Forced,
}

/// Failure reported by a platform primitive. Carries the OS error code so the
/// engine can log it once threads are running again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFault {
    ProtectDenied(i32),
    WriteRefused(i32),
    ShortWrite { written: usize },
    AllocFailed(i32),
    SuspendFailed(i32),
    Unsupported,
}

impl PlatformFault {
    pub fn code(&self) -> i32 {
        match *self {
            PlatformFault::ProtectDenied(code)
            | PlatformFault::WriteRefused(code)
            | PlatformFault::AllocFailed(code)
            | PlatformFault::SuspendFailed(code) => code,
            PlatformFault::ShortWrite { .. } | PlatformFault::Unsupported => 0,
        }
    }
}

/// A block of engine-owned code memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSlice {
    pub address: usize,
    pub size: usize,
}

impl CodeSlice {
    /// The block as a byte buffer for code emission.
    ///
    /// # Safety
    /// The block must be writable (not yet sealed) and not aliased.
    pub unsafe fn bytes_mut<'a>(&self) -> &'a mut [u8] {
        core::slice::from_raw_parts_mut(self.address as *mut u8, self.size)
    }
}

/// Result of stopping the other threads of the process.
#[derive(Debug)]
pub struct Quiesced<T> {
    pub parked: usize,
    pub expected: usize,
    pub token: T,
}

impl<T> Quiesced<T> {
    pub fn complete(&self) -> bool {
        self.parked >= self.expected
    }
}

pub trait PlatformPatcher: Send + Sync {
    /// Whatever the platform needs to resume the threads it stopped.
    type ThreadToken;

    fn capabilities(&self) -> Capabilities;

    fn page_size(&self) -> usize;

    /// Mapping containing `address`, or `None` when unmapped.
    fn query_region(&self, address: usize) -> Option<Region>;

    fn protect(&self, page_start: usize, len: usize, protection: Protection) -> Result<(), PlatformFault>;

    /// Copies `out.len()` bytes starting at `address`.
    ///
    /// # Safety
    /// The range must be mapped readable.
    unsafe fn read_code(&self, address: usize, out: &mut [u8]) {
        core::ptr::copy_nonoverlapping(address as *const u8, out.as_mut_ptr(), out.len());
    }

    /// Writes `bytes` at `address`.
    ///
    /// # Safety
    /// With [`WriteMode::Direct`] the range must be writable. In both modes
    /// the caller is responsible for what the new bytes mean to code that
    /// executes them.
    unsafe fn write_code(&self, address: usize, bytes: &[u8], mode: WriteMode) -> Result<(), PlatformFault>;

    /// Allocates `size` bytes of writable memory for code. With `near`, the
    /// block must lie within `max_distance` of it.
    fn alloc_code(&self, near: Option<usize>, max_distance: u64, size: usize) -> Result<CodeSlice, PlatformFault>;

    /// Makes a filled block executable and flushes the instruction cache.
    fn seal_code(&self, slice: &CodeSlice) -> Result<(), PlatformFault>;

    /// # Safety
    /// No thread may be executing, or about to execute, code in the block.
    unsafe fn free_code(&self, slice: CodeSlice);

    fn flush_icache(&self, address: usize, len: usize);

    /// Stops every thread except the caller, waiting at most `timeout` for
    /// them to acknowledge. Must not allocate or log once the first thread
    /// has been stopped.
    fn suspend_other_threads(&self, timeout: Duration) -> Result<Quiesced<Self::ThreadToken>, PlatformFault>;

    fn resume_threads(&self, quiesced: Quiesced<Self::ThreadToken>);
}

/// Start of the page containing `address`.
#[inline]
pub fn page_floor(address: usize, page_size: usize) -> usize {
    address & !(page_size - 1)
}

/// Pages covering `[address, address + len)`, as `(first_page, byte_len)`.
#[inline]
pub fn page_span(address: usize, len: usize, page_size: usize) -> (usize, usize) {
    let start = page_floor(address, page_size);
    let end = page_floor(address + len.max(1) - 1, page_size) + page_size;
    (start, end - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_span_covers_straddling_ranges() {
        assert_eq!(page_span(0x1000, 16, 0x1000), (0x1000, 0x1000));
        assert_eq!(page_span(0x1FF8, 16, 0x1000), (0x1000, 0x2000));
        assert_eq!(page_span(0x1FFF, 1, 0x1000), (0x1000, 0x1000));
    }

    #[test]
    fn protection_display() {
        assert_eq!(Protection::READ_EXECUTE.to_string(), "r-x");
        assert_eq!(Protection::ALL.to_string(), "rwx");
    }
}
