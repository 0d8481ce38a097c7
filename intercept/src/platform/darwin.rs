//! macOS: Mach VM calls for regions, protection, forced writes and code
//! memory; `task_threads` + `thread_suspend` for quiescing.

use std::time::Duration;

use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
use mach2::mach_types::thread_act_t;
use mach2::message::mach_msg_type_number_t;
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_protect, mach_vm_region, mach_vm_write};
use mach2::vm_prot::{vm_prot_t, VM_PROT_COPY, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_region::{vm_region_basic_info_64, vm_region_info_t, VM_REGION_BASIC_INFO_64};
use mach2::vm_statistics::{VM_FLAGS_ANYWHERE, VM_FLAGS_FIXED};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, vm_offset_t};

use super::{Capabilities, CodeSlice, PlatformFault, PlatformPatcher, Protection, Quiesced, Region, WriteMode};

fn to_vm_prot(protection: Protection) -> vm_prot_t {
    let mut prot = 0;
    if protection.read {
        prot |= VM_PROT_READ;
    }
    if protection.write {
        prot |= VM_PROT_WRITE;
    }
    if protection.execute {
        prot |= VM_PROT_EXECUTE;
    }
    prot
}

fn from_vm_prot(prot: vm_prot_t) -> Protection {
    Protection {
        read: prot & VM_PROT_READ != 0,
        write: prot & VM_PROT_WRITE != 0,
        execute: prot & VM_PROT_EXECUTE != 0,
    }
}

/// Region at or above `address`, as reported by the kernel.
fn next_region(address: u64) -> Option<(u64, u64, vm_prot_t)> {
    let mut region_addr: mach_vm_address_t = address;
    let mut region_size: mach_vm_size_t = 0;
    let mut info: vm_region_basic_info_64 = unsafe { core::mem::zeroed() };
    let mut info_count = vm_region_basic_info_64::count();
    let mut object_name: u32 = 0;
    let kr = unsafe {
        mach_vm_region(
            mach_task_self(),
            &mut region_addr,
            &mut region_size,
            VM_REGION_BASIC_INFO_64,
            (&mut info as *mut vm_region_basic_info_64) as vm_region_info_t,
            &mut info_count,
            &mut object_name,
        )
    };
    if kr != KERN_SUCCESS {
        return None;
    }
    Some((region_addr, region_addr.saturating_add(region_size), info.protection))
}

/// Threads stopped by one quiesce round.
#[derive(Debug)]
pub struct SuspendedThreads {
    list: *mut thread_act_t,
    count: mach_msg_type_number_t,
    /// Per entry: whether `thread_suspend` succeeded.
    suspended: Vec<bool>,
}

#[derive(Debug)]
pub struct DarwinPatcher {
    page_size: usize,
}

impl Default for DarwinPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DarwinPatcher {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self { page_size: if page_size > 0 { page_size as usize } else { 16384 } }
    }

    fn alloc_fixed(&self, at: u64, size: u64) -> Option<CodeSlice> {
        let mut out: mach_vm_address_t = at;
        let kr = unsafe { mach_vm_allocate(mach_task_self(), &mut out, size, VM_FLAGS_FIXED) };
        (kr == KERN_SUCCESS).then_some(CodeSlice { address: out as usize, size: size as usize })
    }

    fn alloc_near(&self, near: u64, max_distance: u64, size: u64) -> Option<CodeSlice> {
        let page = self.page_size as u64;
        let window_start = (near.saturating_sub(max_distance) + page - 1) & !(page - 1);
        let window_end = near.saturating_add(max_distance) & !(page - 1);

        let mut addr = window_start;
        let mut prev_end = window_start;
        while addr < window_end {
            let (start, end) = match next_region(addr) {
                Some((start, end, _)) => (start, end),
                None => (window_end, window_end),
            };
            if start > prev_end {
                let gap_end = start.min(window_end);
                if gap_end > prev_end && gap_end - prev_end >= size {
                    let candidate = near.clamp(prev_end, gap_end - size) & !(page - 1);
                    if candidate >= prev_end {
                        if let Some(slice) = self.alloc_fixed(candidate, size) {
                            return Some(slice);
                        }
                    }
                }
            }
            if end <= addr {
                break;
            }
            prev_end = prev_end.max(end);
            addr = end;
        }
        None
    }
}

impl PlatformPatcher for DarwinPatcher {
    type ThreadToken = SuspendedThreads;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            inline_patch: cfg!(any(target_arch = "x86_64", target_arch = "aarch64")),
            attach: cfg!(target_arch = "x86_64"),
            wx_exclusive: cfg!(target_arch = "aarch64"),
            forced_write: true,
            thread_suspend: true,
            near_allocation: true,
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn query_region(&self, address: usize) -> Option<Region> {
        let (start, end, prot) = next_region(address as u64)?;
        let region = Region { start: start as usize, end: end as usize, protection: from_vm_prot(prot) };
        region.contains(address).then_some(region)
    }

    fn protect(&self, page_start: usize, len: usize, protection: Protection) -> Result<(), PlatformFault> {
        let task = unsafe { mach_task_self() };
        let prot = to_vm_prot(protection);
        let mut kr = unsafe { mach_vm_protect(task, page_start as u64, len as u64, 0, prot) };
        if kr != KERN_SUCCESS && protection.write {
            // Shared text pages need a private copy before they accept writes.
            kr = unsafe { mach_vm_protect(task, page_start as u64, len as u64, 0, prot | VM_PROT_COPY) };
        }
        if kr != KERN_SUCCESS {
            return Err(PlatformFault::ProtectDenied(kr));
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
                let kr: kern_return_t = mach_vm_write(
                    mach_task_self(),
                    address as mach_vm_address_t,
                    bytes.as_ptr() as vm_offset_t,
                    bytes.len() as mach_msg_type_number_t,
                );
                if kr != KERN_SUCCESS {
                    return Err(PlatformFault::WriteRefused(kr));
                }
                Ok(())
            }
        }
    }

    fn alloc_code(&self, near: Option<usize>, max_distance: u64, size: usize) -> Result<CodeSlice, PlatformFault> {
        let size = ((size.max(1) + self.page_size - 1) & !(self.page_size - 1)) as u64;
        if let Some(near) = near {
            return self.alloc_near(near as u64, max_distance, size).ok_or(PlatformFault::AllocFailed(libc::ENOMEM));
        }
        let mut out: mach_vm_address_t = 0;
        let kr = unsafe { mach_vm_allocate(mach_task_self(), &mut out, size, VM_FLAGS_ANYWHERE) };
        if kr != KERN_SUCCESS {
            return Err(PlatformFault::AllocFailed(kr));
        }
        Ok(CodeSlice { address: out as usize, size: size as usize })
    }

    fn seal_code(&self, slice: &CodeSlice) -> Result<(), PlatformFault> {
        self.protect(slice.address, slice.size, Protection::READ_EXECUTE)?;
        self.flush_icache(slice.address, slice.size);
        Ok(())
    }

    unsafe fn free_code(&self, slice: CodeSlice) {
        let _ = mach_vm_deallocate(mach_task_self(), slice.address as u64, slice.size as u64);
    }

    fn flush_icache(&self, address: usize, len: usize) {
        unsafe { crate::code::cache::flush_icache(address, len) }
    }

    fn suspend_other_threads(&self, _timeout: Duration) -> Result<Quiesced<SuspendedThreads>, PlatformFault> {
        use mach2::mach_init::mach_thread_self;
        use mach2::task::task_threads;
        use mach2::thread_act::thread_suspend;

        let mut list: *mut thread_act_t = core::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        let kr = unsafe { task_threads(mach_task_self(), &mut list, &mut count) };
        if kr != KERN_SUCCESS {
            return Err(PlatformFault::SuspendFailed(kr));
        }

        let own = unsafe { mach_thread_self() };
        let mut suspended = vec![false; count as usize];
        let mut parked = 0;
        for (i, slot) in suspended.iter_mut().enumerate() {
            let thread = unsafe { *list.add(i) };
            if thread == own {
                continue;
            }
            // thread_suspend returns once the thread is stopped.
            if unsafe { thread_suspend(thread) } == KERN_SUCCESS {
                *slot = true;
                parked += 1;
            }
        }
        unsafe { mach2::mach_port::mach_port_deallocate(mach_task_self(), own) };

        Ok(Quiesced {
            parked,
            expected: (count as usize).saturating_sub(1),
            token: SuspendedThreads { list, count, suspended },
        })
    }

    fn resume_threads(&self, quiesced: Quiesced<SuspendedThreads>) {
        use mach2::mach_port::mach_port_deallocate;
        use mach2::thread_act::thread_resume;

        let token = quiesced.token;
        let task = unsafe { mach_task_self() };
        for i in 0..token.count as usize {
            let thread = unsafe { *token.list.add(i) };
            if token.suspended[i] {
                unsafe { thread_resume(thread) };
            }
            unsafe { mach_port_deallocate(task, thread) };
        }
        let bytes = token.count as u64 * core::mem::size_of::<thread_act_t>() as u64;
        unsafe { mach_vm_deallocate(task, token.list as u64, bytes) };
    }
}
