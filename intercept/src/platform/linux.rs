//! Linux: `/proc/self/maps`, `mprotect`, `/proc/self/mem`, `mmap`, and
//! signal-based thread parking.

use std::fs::File;
use std::ops::ControlFlow;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use super::{Capabilities, CodeSlice, PlatformFault, PlatformPatcher, Protection, Quiesced, Region, WriteMode};

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn to_prot(protection: Protection) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if protection.read {
        prot |= libc::PROT_READ;
    }
    if protection.write {
        prot |= libc::PROT_WRITE;
    }
    if protection.execute {
        prot |= libc::PROT_EXEC;
    }
    prot
}

// ── /proc/self/maps ──────────────────────────────────────────────────

/// Parses the leading `start-end perms` of a maps line.
fn parse_maps_line(line: &[u8]) -> Option<Region> {
    fn hex(digits: &[u8]) -> Option<usize> {
        if digits.is_empty() || digits.len() > 16 {
            return None;
        }
        digits.iter().try_fold(0usize, |acc, &d| {
            let v = (d as char).to_digit(16)? as usize;
            Some(acc << 4 | v)
        })
    }

    let dash = line.iter().position(|&b| b == b'-')?;
    let space = dash + 1 + line[dash + 1..].iter().position(|&b| b == b' ')?;
    let perms = line.get(space + 1..space + 4)?;
    Some(Region {
        start: hex(&line[..dash])?,
        end: hex(&line[dash + 1..space])?,
        protection: Protection {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            execute: perms[2] == b'x',
        },
    })
}

/// Streams every mapping of the process, in address order, to `visit`.
///
/// Reads through a stack buffer with raw `open`/`read` so it can run while
/// other threads are parked, possibly inside the allocator.
fn for_each_region(mut visit: impl FnMut(Region) -> ControlFlow<()>) -> bool {
    let fd = unsafe { libc::open(c"/proc/self/maps".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return false;
    }

    let mut chunk = [0u8; 4096];
    // Only the address range and permissions are needed, never the path.
    let mut line = [0u8; 64];
    let mut line_len = 0;

    'read: loop {
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr().cast(), chunk.len()) };
        if n < 0 && errno() == libc::EINTR {
            continue;
        }
        if n <= 0 {
            break;
        }
        for &b in &chunk[..n as usize] {
            if b == b'\n' {
                if let Some(region) = parse_maps_line(&line[..line_len]) {
                    if visit(region).is_break() {
                        break 'read;
                    }
                }
                line_len = 0;
            } else if line_len < line.len() {
                line[line_len] = b;
                line_len += 1;
            }
        }
    }

    unsafe { libc::close(fd) };
    true
}

// ── Thread parking ───────────────────────────────────────────────────
//
// Each quiesce round bumps PARK_GENERATION and signals every other thread.
// The handler counts itself in PARKED and spins until RELEASE_GENERATION
// catches up, so a thread can never run patched code mid-write.

static PARK_GENERATION: AtomicU64 = AtomicU64::new(0);
static RELEASE_GENERATION: AtomicU64 = AtomicU64::new(0);
static PARKED: AtomicUsize = AtomicUsize::new(0);
static HANDLER: OnceLock<Result<libc::c_int, i32>> = OnceLock::new();
static ROUND: Mutex<()> = Mutex::new(());

extern "C" fn park_handler(_signal: libc::c_int) {
    unsafe {
        let errno_slot = libc::__errno_location();
        let saved = *errno_slot;

        let generation = PARK_GENERATION.load(Ordering::Acquire);
        PARKED.fetch_add(1, Ordering::AcqRel);
        while RELEASE_GENERATION.load(Ordering::Acquire) < generation {
            libc::sched_yield();
        }
        PARKED.fetch_sub(1, Ordering::AcqRel);

        *errno_slot = saved;
    }
}

/// Installs the park handler once. Returns the signal number used.
pub(crate) fn install_park_handler() -> Result<libc::c_int, i32> {
    *HANDLER.get_or_init(|| unsafe {
        let signal = libc::SIGRTMIN() + 7;
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = park_handler as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, core::ptr::null_mut()) != 0 {
            return Err(errno());
        }
        Ok(signal)
    })
}

fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn other_thread_ids() -> Result<Vec<libc::pid_t>, PlatformFault> {
    let own = current_tid();
    let entries = std::fs::read_dir("/proc/self/task")
        .map_err(|e| PlatformFault::SuspendFailed(e.raw_os_error().unwrap_or(0)))?;
    Ok(entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<libc::pid_t>().ok())
        .filter(|&tid| tid != own)
        .collect())
}

/// Proof of a quiesce round; resuming consumes it.
pub struct ParkedThreads {
    generation: u64,
    // Thread ids are listed before the round starts and freed after it ends.
    _tids: Vec<libc::pid_t>,
    _round: MutexGuard<'static, ()>,
}

impl std::fmt::Debug for ParkedThreads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkedThreads").field("generation", &self.generation).finish()
    }
}

// ── Patcher ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LinuxPatcher {
    page_size: usize,
    /// Writes through this file ignore page protection.
    mem: Option<File>,
}

impl Default for LinuxPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxPatcher {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let mem = std::fs::OpenOptions::new().read(true).write(true).open("/proc/self/mem").ok();
        Self { page_size: if page_size > 0 { page_size as usize } else { 4096 }, mem }
    }

    /// Tries an exact fixed mapping at `at`. Older kernels treat
    /// `MAP_FIXED_NOREPLACE` as a hint, so the result is checked.
    fn map_at(&self, at: usize, size: usize) -> Option<CodeSlice> {
        let ptr = unsafe {
            libc::mmap(
                at as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        if ptr as usize != at {
            unsafe { libc::munmap(ptr, size) };
            return None;
        }
        Some(CodeSlice { address: at, size })
    }

    /// Looks for a free gap within `max_distance` of `near`, trying the
    /// address closest to `near` in each gap.
    fn alloc_near(&self, near: usize, max_distance: u64, size: usize) -> Option<CodeSlice> {
        let page = self.page_size;
        let distance = usize::try_from(max_distance).unwrap_or(usize::MAX);
        let window_start = (near.saturating_sub(distance) + page - 1) & !(page - 1);
        let window_end = near.saturating_add(distance).saturating_sub(size) & !(page - 1);
        // The lowest pages are never mappable.
        let window_start = window_start.max(0x10000);
        if window_end <= window_start {
            return None;
        }

        let try_gap = |gap_start: usize, gap_end: usize| -> Option<CodeSlice> {
            let lo = gap_start.max(window_start);
            let hi = gap_end.min(window_end.saturating_add(size));
            if hi <= lo || hi - lo < size {
                return None;
            }
            let candidate = near.clamp(lo, hi - size) & !(page - 1);
            if candidate < lo {
                return None;
            }
            self.map_at(candidate, size)
        };

        let mut found = None;
        let mut prev_end = 0usize;
        for_each_region(|region| {
            if region.start > prev_end {
                found = try_gap(prev_end, region.start);
                if found.is_some() {
                    return ControlFlow::Break(());
                }
            }
            prev_end = prev_end.max(region.end);
            if prev_end >= window_end.saturating_add(size) {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        found.or_else(|| try_gap(prev_end, usize::MAX))
    }
}

impl PlatformPatcher for LinuxPatcher {
    type ThreadToken = ParkedThreads;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            inline_patch: cfg!(any(target_arch = "x86_64", target_arch = "aarch64")),
            attach: cfg!(target_arch = "x86_64"),
            wx_exclusive: false,
            forced_write: self.mem.is_some(),
            thread_suspend: true,
            near_allocation: true,
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn query_region(&self, address: usize) -> Option<Region> {
        let mut found = None;
        for_each_region(|region| {
            if region.contains(address) {
                found = Some(region);
                ControlFlow::Break(())
            } else if region.start > address {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        found
    }

    fn protect(&self, page_start: usize, len: usize, protection: Protection) -> Result<(), PlatformFault> {
        let rc = unsafe { libc::mprotect(page_start as *mut libc::c_void, len, to_prot(protection)) };
        if rc != 0 {
            return Err(PlatformFault::ProtectDenied(errno()));
        }
        Ok(())
    }

    unsafe fn write_code(&self, address: usize, bytes: &[u8], mode: WriteMode) -> Result<(), PlatformFault> {
        match mode {
            WriteMode::Direct => {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
                Ok(())
            }
            WriteMode::Forced => {
                let mem = self.mem.as_ref().ok_or(PlatformFault::Unsupported)?;
                let mut written = 0;
                while written < bytes.len() {
                    match mem.write_at(&bytes[written..], (address + written) as u64) {
                        Ok(0) => return Err(PlatformFault::ShortWrite { written }),
                        Ok(n) => written += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(_) if written > 0 => return Err(PlatformFault::ShortWrite { written }),
                        Err(e) => return Err(PlatformFault::WriteRefused(e.raw_os_error().unwrap_or(0))),
                    }
                }
                Ok(())
            }
        }
    }

    fn alloc_code(&self, near: Option<usize>, max_distance: u64, size: usize) -> Result<CodeSlice, PlatformFault> {
        let size = (size.max(1) + self.page_size - 1) & !(self.page_size - 1);
        if let Some(near) = near {
            return self.alloc_near(near, max_distance, size).ok_or(PlatformFault::AllocFailed(libc::ENOMEM));
        }
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PlatformFault::AllocFailed(errno()));
        }
        Ok(CodeSlice { address: ptr as usize, size })
    }

    fn seal_code(&self, slice: &CodeSlice) -> Result<(), PlatformFault> {
        self.protect(slice.address, slice.size, Protection::READ_EXECUTE)?;
        self.flush_icache(slice.address, slice.size);
        Ok(())
    }

    unsafe fn free_code(&self, slice: CodeSlice) {
        libc::munmap(slice.address as *mut libc::c_void, slice.size);
    }

    fn flush_icache(&self, address: usize, len: usize) {
        unsafe { crate::code::cache::flush_icache(address, len) }
    }

    fn suspend_other_threads(&self, timeout: Duration) -> Result<Quiesced<ParkedThreads>, PlatformFault> {
        let signal = install_park_handler().map_err(PlatformFault::SuspendFailed)?;
        let round = ROUND.lock().unwrap_or_else(|e| e.into_inner());
        let tids = other_thread_ids()?;

        // Nothing below allocates: other threads may be parked inside malloc.
        let generation = PARK_GENERATION.fetch_add(1, Ordering::AcqRel) + 1;
        let pid = unsafe { libc::getpid() };
        let mut expected = 0;
        for &tid in &tids {
            let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signal) };
            if rc == 0 {
                expected += 1;
            }
        }

        let deadline = Instant::now() + timeout;
        let mut parked = PARKED.load(Ordering::Acquire);
        while parked < expected && Instant::now() < deadline {
            unsafe { libc::sched_yield() };
            parked = PARKED.load(Ordering::Acquire);
        }

        Ok(Quiesced {
            parked: parked.min(expected),
            expected,
            token: ParkedThreads { generation, _tids: tids, _round: round },
        })
    }

    fn resume_threads(&self, quiesced: Quiesced<ParkedThreads>) {
        let token = quiesced.token;
        RELEASE_GENERATION.fetch_max(token.generation, Ordering::AcqRel);
        // Threads that never parked before the deadline will leave the
        // handler on their own once they see the release.
        let deadline = Instant::now() + Duration::from_millis(50);
        while PARKED.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            unsafe { libc::sched_yield() };
        }
        drop(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn parses_maps_lines() {
        let line = b"7f1c2a400000-7f1c2a428000 r-xp 00000000 08:01 1234 /usr/lib/libc.so.6";
        let region = parse_maps_line(line).unwrap();
        assert_eq!(region.start, 0x7f1c_2a40_0000);
        assert_eq!(region.end, 0x7f1c_2a42_8000);
        assert_eq!(region.protection, Protection::READ_EXECUTE);

        // Truncated to the line buffer width still parses.
        let region = parse_maps_line(b"00400000-00452000 rw-p 00000000 ").unwrap();
        assert_eq!(region.protection, Protection::READ_WRITE);

        assert!(parse_maps_line(b"").is_none());
        assert!(parse_maps_line(b"zz-10 r-xp").is_none());
    }

    #[test]
    fn query_region_finds_own_code_and_stack() {
        let p = LinuxPatcher::new();
        let code = query_region_finds_own_code_and_stack as usize;
        let region = p.query_region(code).unwrap();
        assert!(region.contains(code));
        assert!(region.protection.execute);

        let local = 0u64;
        let region = p.query_region(&local as *const u64 as usize).unwrap();
        assert!(region.protection.write);

        assert!(p.query_region(8).is_none());
    }

    #[test]
    fn near_allocation_lands_in_window() {
        let p = LinuxPatcher::new();
        let near = near_allocation_lands_in_window as usize;
        let range = crate::arch::x86_64::NEAR_RANGE;
        let slice = p.alloc_code(Some(near), range, 1).unwrap();
        assert!((slice.address as i64 - near as i64).unsigned_abs() <= range);
        assert_eq!(slice.size, p.page_size());
        unsafe {
            slice.bytes_mut()[0] = 0xC3;
        }
        p.seal_code(&slice).unwrap();
        assert_eq!(p.query_region(slice.address).unwrap().protection, Protection::READ_EXECUTE);
        unsafe { p.free_code(slice) };
    }

    #[test]
    fn forced_write_reaches_read_only_page() {
        let p = LinuxPatcher::new();
        let slice = p.alloc_code(None, 0, 1).unwrap();
        p.protect(slice.address, slice.size, Protection::READ).unwrap();
        unsafe {
            p.write_code(slice.address, &[1, 2, 3], WriteMode::Forced).unwrap();
            let mut back = [0u8; 3];
            p.read_code(slice.address, &mut back);
            assert_eq!(back, [1, 2, 3]);
            p.free_code(slice);
        }
    }

    #[test]
    fn quiesce_parks_and_releases_workers() {
        let stop = Arc::new(AtomicBool::new(false));
        let spins = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let stop = stop.clone();
                let spins = spins.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        spins.fetch_add(1, Ordering::Relaxed);
                        std::hint::spin_loop();
                    }
                })
            })
            .collect();

        let p = LinuxPatcher::new();
        let q = p.suspend_other_threads(Duration::from_secs(2)).unwrap();
        assert!(q.expected >= 3);
        assert!(q.complete(), "{} of {} parked", q.parked, q.expected);
        let before = spins.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(spins.load(Ordering::Relaxed), before);
        p.resume_threads(q);

        stop.store(true, Ordering::Relaxed);
        for w in workers {
            w.join().unwrap();
        }
    }
}
