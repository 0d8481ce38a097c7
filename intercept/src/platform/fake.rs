//! In-memory platform for tests.
//!
//! "Code" lives in a page-aligned heap arena that is never executed. Page
//! protection is simulated, failures can be scripted, and every call is
//! recorded so tests can assert on the exact sequence of platform work.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{page_floor, Capabilities, CodeSlice, PlatformFault, PlatformPatcher, Protection, Quiesced, Region, WriteMode};

const PAGE: usize = 4096;
const ARENA_PAGES: usize = 64;

/// A frame-pointer function returning 42, long enough for either redirect
/// size, in the host's instruction set.
#[cfg(not(target_arch = "aarch64"))]
pub const SAMPLE_RETURNS_42: &[u8] = &[
    0x55, // push rbp
    0x48, 0x89, 0xE5, // mov rbp, rsp
    0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
    0x48, 0x83, 0xC4, 0x00, // add rsp, 0
    0x48, 0x31, 0xC9, // xor rcx, rcx
    0x90, 0x90, // nop; nop
    0x5D, // pop rbp
    0xC3, // ret
];

#[cfg(target_arch = "aarch64")]
pub const SAMPLE_RETURNS_42: &[u8] = &[
    0xFD, 0x7B, 0xBF, 0xA9, // stp x29, x30, [sp, #-16]!
    0xFD, 0x03, 0x00, 0x91, // mov x29, sp
    0x40, 0x05, 0x80, 0x52, // mov w0, #42
    0x1F, 0x20, 0x03, 0xD5, // nop
    0x1F, 0x20, 0x03, 0xD5, // nop
    0xFD, 0x7B, 0xC1, 0xA8, // ldp x29, x30, [sp], #16
    0xC0, 0x03, 0x5F, 0xD6, // ret
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    Protect { page: usize, len: usize, protection: Protection },
    Write { address: usize, len: usize, mode: WriteMode },
    Alloc { address: usize, size: usize, near: bool },
    Seal { address: usize },
    Free { address: usize },
    Flush { address: usize, len: usize },
    Suspend,
    Resume,
}

#[derive(Debug, Default)]
struct State {
    /// Page start → simulated protection. Only arena pages appear here.
    pages: BTreeMap<usize, Protection>,
    /// Next free page index in the arena.
    next_page: usize,
    freed: Vec<CodeSlice>,
    events: Vec<FakeEvent>,
    fail_protect: bool,
    /// Writes that still succeed before every later one is refused.
    writes_left: Option<usize>,
    /// The next write stops after this many bytes.
    partial_write: Option<usize>,
    far_only: bool,
    fail_alloc: bool,
    quiesce: Option<(usize, usize)>,
}

/// Simulated platform backed by a private arena.
#[derive(Debug)]
pub struct FakePatcher {
    arena: usize,
    capabilities: Capabilities,
    state: Mutex<State>,
}

// The arena is only ever touched through `state`'s bookkeeping and the
// byte-level trait methods, whose callers uphold the usual code-memory rules.
unsafe impl Send for FakePatcher {}
unsafe impl Sync for FakePatcher {}

fn arena_layout() -> Layout {
    // Both values are non-zero powers of two / multiples of one.
    match Layout::from_size_align(ARENA_PAGES * PAGE, PAGE) {
        Ok(layout) => layout,
        Err(_) => unreachable!("arena layout is constant"),
    }
}

impl Default for FakePatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePatcher {
    pub fn new() -> Self {
        let layout = arena_layout();
        let arena = unsafe { alloc_zeroed(layout) } as usize;
        if arena == 0 {
            std::alloc::handle_alloc_error(layout);
        }
        Self {
            arena,
            capabilities: Capabilities {
                inline_patch: true,
                attach: cfg!(target_arch = "x86_64"),
                wx_exclusive: false,
                forced_write: true,
                thread_suspend: true,
                near_allocation: true,
            },
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_pages(&self, state: &mut State, size: usize, protection: Protection) -> Option<CodeSlice> {
        let pages = size.max(1).div_ceil(PAGE);
        if state.next_page + pages > ARENA_PAGES {
            return None;
        }
        let address = self.arena + state.next_page * PAGE;
        state.next_page += pages;
        for i in 0..pages {
            state.pages.insert(address + i * PAGE, protection);
        }
        Some(CodeSlice { address, size: pages * PAGE })
    }

    /// Places `code` on fresh read-execute pages and returns its address.
    pub fn map_code(&self, code: &[u8]) -> usize {
        let mut state = self.state();
        let slice = match self.take_pages(&mut state, code.len(), Protection::READ_EXECUTE) {
            Some(slice) => slice,
            None => panic!("fake arena exhausted"),
        };
        unsafe { slice.bytes_mut()[..code.len()].copy_from_slice(code) };
        slice.address
    }

    /// Copy of `len` bytes at `address`, bypassing the simulated protection.
    pub fn peek(&self, address: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        unsafe { core::ptr::copy_nonoverlapping(address as *const u8, out.as_mut_ptr(), len) };
        out
    }

    pub fn set_protection(&self, address: usize, protection: Protection) {
        self.state().pages.insert(page_floor(address, PAGE), protection);
    }

    pub fn protection(&self, address: usize) -> Option<Protection> {
        self.state().pages.get(&page_floor(address, PAGE)).copied()
    }

    /// Makes the page at `address` unreadable.
    pub fn unreadable(&self, address: usize) {
        self.set_protection(address, Protection::NONE);
    }

    /// Removes the page at `address` from the simulated address space.
    pub fn unmap(&self, address: usize) {
        self.state().pages.remove(&page_floor(address, PAGE));
    }

    pub fn fail_protect(&self, fail: bool) {
        self.state().fail_protect = fail;
    }

    /// Lets `count` more writes succeed, then refuses every write after.
    pub fn fail_write_after(&self, count: usize) {
        self.state().writes_left = Some(count);
    }

    /// The next write stores only its first `bytes` bytes.
    pub fn partial_write(&self, bytes: usize) {
        self.state().partial_write = Some(bytes);
    }

    pub fn allow_writes(&self) {
        let mut state = self.state();
        state.writes_left = None;
        state.partial_write = None;
    }

    /// Every code allocation fails.
    pub fn fail_alloc(&self, fail: bool) {
        self.state().fail_alloc = fail;
    }

    /// Near allocations fail, as if the address space around targets were full.
    pub fn far_only(&self, far: bool) {
        self.state().far_only = far;
    }

    /// Only `parked` of `expected` threads will acknowledge the next quiesce.
    pub fn partial_quiesce(&self, parked: usize, expected: usize) {
        self.state().quiesce = Some((parked, expected));
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    pub fn freed(&self) -> Vec<CodeSlice> {
        self.state().freed.clone()
    }

    /// Code blocks currently allocated and not yet freed.
    pub fn live_blocks(&self) -> usize {
        let state = self.state();
        let allocated = state.events.iter().filter(|e| matches!(e, FakeEvent::Alloc { .. })).count();
        allocated.saturating_sub(state.freed.len())
    }
}

impl Drop for FakePatcher {
    fn drop(&mut self) {
        unsafe { dealloc(self.arena as *mut u8, arena_layout()) };
    }
}

impl PlatformPatcher for FakePatcher {
    type ThreadToken = ();

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn page_size(&self) -> usize {
        PAGE
    }

    fn query_region(&self, address: usize) -> Option<Region> {
        let page = page_floor(address, PAGE);
        let protection = *self.state().pages.get(&page)?;
        Some(Region { start: page, end: page + PAGE, protection })
    }

    fn protect(&self, page_start: usize, len: usize, protection: Protection) -> Result<(), PlatformFault> {
        let mut state = self.state();
        state.events.push(FakeEvent::Protect { page: page_start, len, protection });
        if state.fail_protect {
            return Err(PlatformFault::ProtectDenied(libc::EACCES));
        }
        let mut page = page_start;
        while page < page_start + len {
            match state.pages.get_mut(&page) {
                Some(p) => *p = protection,
                None => return Err(PlatformFault::ProtectDenied(libc::ENOMEM)),
            }
            page += PAGE;
        }
        Ok(())
    }

    unsafe fn write_code(&self, address: usize, bytes: &[u8], mode: WriteMode) -> Result<(), PlatformFault> {
        let mut state = self.state();
        state.events.push(FakeEvent::Write { address, len: bytes.len(), mode });

        match state.writes_left {
            Some(0) => return Err(PlatformFault::WriteRefused(libc::EPERM)),
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        let last_page = page_floor(address + bytes.len().max(1) - 1, PAGE);
        let mut page = page_floor(address, PAGE);
        while page <= last_page {
            match (state.pages.get(&page), mode) {
                (None, _) => return Err(PlatformFault::WriteRefused(libc::EFAULT)),
                (Some(p), WriteMode::Direct) if !p.write => return Err(PlatformFault::WriteRefused(libc::EFAULT)),
                (Some(_), WriteMode::Forced) if !self.capabilities.forced_write => return Err(PlatformFault::Unsupported),
                _ => {}
            }
            page += PAGE;
        }

        let len = match state.partial_write.take() {
            Some(limit) if limit < bytes.len() => limit,
            _ => bytes.len(),
        };
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, len);
        if len < bytes.len() {
            return Err(PlatformFault::ShortWrite { written: len });
        }
        Ok(())
    }

    fn alloc_code(&self, near: Option<usize>, max_distance: u64, size: usize) -> Result<CodeSlice, PlatformFault> {
        let mut state = self.state();
        if state.fail_alloc || (near.is_some() && state.far_only) {
            return Err(PlatformFault::AllocFailed(libc::ENOMEM));
        }
        let slice = self
            .take_pages(&mut state, size, Protection::READ_WRITE)
            .ok_or(PlatformFault::AllocFailed(libc::ENOMEM))?;
        if let Some(near) = near {
            if !crate::arch::within(near as u64, slice.address as u64, max_distance) {
                return Err(PlatformFault::AllocFailed(libc::ENOMEM));
            }
        }
        state.events.push(FakeEvent::Alloc { address: slice.address, size: slice.size, near: near.is_some() });
        Ok(slice)
    }

    fn seal_code(&self, slice: &CodeSlice) -> Result<(), PlatformFault> {
        let mut state = self.state();
        state.events.push(FakeEvent::Seal { address: slice.address });
        let mut page = slice.address;
        while page < slice.address + slice.size {
            state.pages.insert(page, Protection::READ_EXECUTE);
            page += PAGE;
        }
        Ok(())
    }

    unsafe fn free_code(&self, slice: CodeSlice) {
        let mut state = self.state();
        state.events.push(FakeEvent::Free { address: slice.address });
        // Pages stay reserved so a stale pointer never aliases a new block.
        let mut page = slice.address;
        while page < slice.address + slice.size {
            state.pages.insert(page, Protection::NONE);
            page += PAGE;
        }
        state.freed.push(slice);
    }

    fn flush_icache(&self, address: usize, len: usize) {
        self.state().events.push(FakeEvent::Flush { address, len });
    }

    fn suspend_other_threads(&self, _timeout: Duration) -> Result<Quiesced<()>, PlatformFault> {
        let mut state = self.state();
        state.events.push(FakeEvent::Suspend);
        let (parked, expected) = state.quiesce.take().unwrap_or((0, 0));
        Ok(Quiesced { parked, expected, token: () })
    }

    fn resume_threads(&self, _quiesced: Quiesced<()>) {
        self.state().events.push(FakeEvent::Resume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_writes_honor_simulated_protection() {
        let p = FakePatcher::new();
        let at = p.map_code(SAMPLE_RETURNS_42);
        unsafe {
            assert_eq!(p.write_code(at, &[0x90], WriteMode::Direct), Err(PlatformFault::WriteRefused(libc::EFAULT)));
            p.write_code(at, &[0x90], WriteMode::Forced).unwrap();
        }
        assert_eq!(p.peek(at, 1), vec![0x90]);

        p.protect(at, PAGE, Protection::ALL).unwrap();
        unsafe { p.write_code(at + 1, &[0xCC], WriteMode::Direct).unwrap() };
        assert_eq!(p.peek(at, 2), vec![0x90, 0xCC]);
    }

    #[test]
    fn scripted_write_failures() {
        let p = FakePatcher::new();
        let at = p.map_code(SAMPLE_RETURNS_42);
        p.fail_write_after(1);
        unsafe {
            p.write_code(at, &[1], WriteMode::Forced).unwrap();
            assert!(p.write_code(at, &[2], WriteMode::Forced).is_err());
        }
        p.allow_writes();
        p.partial_write(2);
        unsafe {
            assert_eq!(p.write_code(at, &[7, 8, 9], WriteMode::Forced), Err(PlatformFault::ShortWrite { written: 2 }));
        }
        assert_eq!(p.peek(at, 3), vec![7, 8, SAMPLE_RETURNS_42[2]]);
    }

    #[test]
    fn allocations_are_near_and_tracked() {
        let p = FakePatcher::new();
        let target = p.map_code(SAMPLE_RETURNS_42);
        let slice = p.alloc_code(Some(target), 0x7FFF_FFFF, 64).unwrap();
        assert_eq!(p.protection(slice.address), Some(Protection::READ_WRITE));
        p.seal_code(&slice).unwrap();
        assert_eq!(p.protection(slice.address), Some(Protection::READ_EXECUTE));
        assert_eq!(p.live_blocks(), 1);
        unsafe { p.free_code(slice) };
        assert_eq!(p.live_blocks(), 0);

        p.far_only(true);
        assert!(p.alloc_code(Some(target), 0x7FFF_FFFF, 64).is_err());
        assert!(p.alloc_code(None, 0, 64).is_ok());
    }

    #[test]
    fn unmapped_and_unreadable_pages() {
        let p = FakePatcher::new();
        let at = p.map_code(SAMPLE_RETURNS_42);
        p.unreadable(at);
        assert_eq!(p.query_region(at).unwrap().protection, Protection::NONE);
        p.unmap(at);
        assert!(p.query_region(at).is_none());
    }
}
