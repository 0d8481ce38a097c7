//! Page-protection handling around a patch.

use crate::error::{HookError, PatchWarning};
use crate::platform::{page_span, PlatformPatcher, Protection, Region, WriteMode};
use crate::types::CodeAddress;

/// Protection changes made for one patch, and how the bytes must be written.
///
/// A patch never spans more than two pages, so the previous protections fit
/// inline and granting or restoring never allocates.
#[derive(Debug, Clone, Copy)]
pub struct ProtectionGrant {
    previous: [Option<Region>; 2],
    elevated: bool,
    pub write_mode: WriteMode,
    pub warning: Option<PatchWarning>,
}

#[derive(Debug)]
pub struct MemoryAccessController<'p, P: PlatformPatcher> {
    platform: &'p P,
}

impl<'p, P: PlatformPatcher> MemoryAccessController<'p, P> {
    pub fn new(platform: &'p P) -> Self {
        Self { platform }
    }

    /// Checks that every byte of `[address, address + len)` is mapped readable.
    pub fn ensure_readable(&self, address: usize, len: usize) -> Result<(), HookError> {
        self.covering(address, len)
            .filter(|regions| regions.iter().flatten().all(|r| r.protection.read))
            .map(|_| ())
            .ok_or(HookError::NotReadable { address: CodeAddress::new(address) })
    }

    /// Regions covering the range, clipped to whole pages. `None` if any byte
    /// is unmapped or the range crosses more than two mappings.
    fn covering(&self, address: usize, len: usize) -> Option<[Option<Region>; 2]> {
        let page = self.platform.page_size();
        let (start, span) = page_span(address, len, page);
        let end = start + span;

        let first = self.platform.query_region(address)?;
        let first = Region { start, end: first.end.min(end), protection: first.protection };
        if first.end >= end {
            return Some([Some(first), None]);
        }
        let second = self.platform.query_region(first.end)?;
        if second.start > first.end || second.end < end {
            return None;
        }
        let second = Region { start: first.end, end, protection: second.protection };
        Some([Some(first), Some(second)])
    }

    /// Makes the range writable for the duration of a patch.
    ///
    /// Requests RWX, or RW where W^X is enforced. When elevation is refused
    /// the grant falls back to a forced write and carries a warning. Performs
    /// no allocation and no logging, so it may run with threads parked.
    pub fn ensure_patchable(&self, address: usize, len: usize) -> Result<ProtectionGrant, HookError> {
        let previous = self.covering(address, len).ok_or(HookError::NotReadable { address: CodeAddress::new(address) })?;
        if !previous.iter().flatten().all(|r| r.protection.read) {
            return Err(HookError::NotReadable { address: CodeAddress::new(address) });
        }

        let wanted = if self.platform.capabilities().wx_exclusive { Protection::READ_WRITE } else { Protection::ALL };
        let mut changed = [false; 2];
        for (i, region) in previous.iter().enumerate() {
            let Some(region) = region else { continue };
            if region.protection.write && (region.protection.execute || wanted == Protection::READ_WRITE) {
                continue;
            }
            if let Err(fault) = self.platform.protect(region.start, region.end - region.start, wanted) {
                // Put back whatever the first iteration already changed.
                for (j, done) in changed.iter().enumerate().take(i) {
                    if let (true, Some(r)) = (*done, previous[j]) {
                        let _ = self.platform.protect(r.start, r.end - r.start, r.protection);
                    }
                }
                return Ok(ProtectionGrant {
                    previous,
                    elevated: false,
                    write_mode: WriteMode::Forced,
                    warning: Some(PatchWarning::ProtectionChangeFailed { page: region.start, code: fault.code() }),
                });
            }
            changed[i] = true;
        }

        Ok(ProtectionGrant {
            previous,
            elevated: changed.iter().any(|&c| c),
            write_mode: WriteMode::Direct,
            warning: None,
        })
    }

    /// Puts back the protection recorded in `grant`. Best effort: a failure is
    /// returned as a warning.
    pub fn restore_protection(&self, grant: &ProtectionGrant) -> Option<PatchWarning> {
        if !grant.elevated {
            return None;
        }
        let mut warning = None;
        for region in grant.previous.iter().flatten() {
            if let Err(fault) = self.platform.protect(region.start, region.end - region.start, region.protection) {
                warning.get_or_insert(PatchWarning::ProtectionRestoreFailed { page: region.start, code: fault.code() });
            }
        }
        warning
    }
}
