#[cfg(target_os = "macos")]
extern "C" {
    fn sys_icache_invalidate(start: *mut core::ffi::c_void, len: usize);
    fn sys_dcache_flush(start: *mut core::ffi::c_void, len: usize);
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

/// Makes freshly written instructions visible to instruction fetch.
///
/// AArch64 keeps separate, non-coherent data and instruction caches, so new
/// code must be cleaned from the D-cache and invalidated in the I-cache.
/// x86_64 snoops stores into the I-cache and needs nothing.
///
/// # Safety
/// `[address, address + len)` must be mapped.
pub unsafe fn flush_icache(address: usize, len: usize) {
    if len == 0 {
        return;
    }

    #[cfg(target_os = "macos")]
    {
        sys_dcache_flush(address as *mut _, len);
        sys_icache_invalidate(address as *mut _, len);
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        __clear_cache(address as *mut _, (address + len) as *mut _);
    }

    #[cfg(not(any(target_os = "macos", all(target_os = "linux", target_arch = "aarch64"))))]
    {
        let _ = address;
    }
}
