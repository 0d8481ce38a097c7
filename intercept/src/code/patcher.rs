//! Byte-level patching inside a quiesce transaction.
//!
//! Everything between [`Transaction::begin`] and [`Transaction::end`] runs
//! while other threads may be parked at arbitrary points, including inside
//! the allocator or the logger. Code in this module therefore works on stack
//! buffers and `Copy` results only; callers log after the transaction ends.

use std::time::Duration;

use crate::code::access::MemoryAccessController;
use crate::error::{PatchFault, PatchWarning};
use crate::platform::{PlatformFault, PlatformPatcher, Quiesced, WriteMode};

/// Longest byte sequence ever written at a target.
pub const MAX_PATCH: usize = 32;

/// Warnings gathered during a transaction, stored inline.
#[derive(Debug, Clone, Copy, Default)]
pub struct Warnings {
    slots: [Option<PatchWarning>; 6],
}

impl Warnings {
    pub fn push(&mut self, warning: PatchWarning) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(warning);
        }
    }

    pub fn extend(&mut self, warning: Option<PatchWarning>) {
        if let Some(w) = warning {
            self.push(w);
        }
    }

    pub fn to_vec(&self) -> Vec<PatchWarning> {
        self.slots.iter().flatten().copied().collect()
    }
}

/// Exclusive window for mutating target code.
///
/// Dropping an unfinished transaction resumes the parked threads.
pub struct Transaction<'p, P: PlatformPatcher> {
    platform: &'p P,
    quiesced: Option<Quiesced<P::ThreadToken>>,
}

impl<'p, P: PlatformPatcher> Transaction<'p, P> {
    /// Starts a transaction, parking other threads when `quiesce` is set.
    pub fn begin(platform: &'p P, quiesce: Option<Duration>, warnings: &mut Warnings) -> Self {
        let quiesced = match quiesce {
            Some(timeout) if platform.capabilities().thread_suspend => {
                match platform.suspend_other_threads(timeout) {
                    Ok(q) => {
                        if !q.complete() {
                            warnings.push(PatchWarning::QuiesceDegraded { parked: q.parked, expected: q.expected });
                        }
                        Some(q)
                    }
                    Err(fault) => {
                        warnings.push(PatchWarning::QuiesceUnavailable { code: fault.code() });
                        None
                    }
                }
            }
            Some(_) => {
                warnings.push(PatchWarning::QuiesceUnavailable { code: 0 });
                None
            }
            None => None,
        };
        Self { platform, quiesced }
    }

    pub fn end(mut self) {
        self.resume();
    }

    fn resume(&mut self) {
        if let Some(q) = self.quiesced.take() {
            self.platform.resume_threads(q);
        }
    }
}

impl<P: PlatformPatcher> Drop for Transaction<'_, P> {
    fn drop(&mut self) {
        self.resume();
    }
}

fn fault_of(fault: PlatformFault) -> PatchFault {
    match fault {
        PlatformFault::ShortWrite { written } => PatchFault::Partial { written },
        PlatformFault::Unsupported => PatchFault::NotWritable,
        other => PatchFault::Refused(other.code()),
    }
}

/// Replaces `expected` with `new` at `address`, verifying both sides.
///
/// The current bytes must equal `expected`, otherwise nothing is written.
/// After the write the bytes are read back; on any failure the original
/// bytes are put back before returning, so memory ends up either fully
/// patched or unchanged. When that rollback fails as well the result is
/// [`PatchFault::Torn`].
pub fn replace_bytes<P: PlatformPatcher>(
    platform: &P,
    access: &MemoryAccessController<'_, P>,
    address: usize,
    expected: &[u8],
    new: &[u8],
    warnings: &mut Warnings,
) -> Result<(), PatchFault> {
    let len = new.len();
    if len != expected.len() || len > MAX_PATCH {
        return Err(PatchFault::Partial { written: 0 });
    }

    let mut current = [0u8; MAX_PATCH];
    access.ensure_readable(address, len).map_err(|_| PatchFault::Unmapped)?;
    unsafe { platform.read_code(address, &mut current[..len]) };
    if current[..len] != *expected {
        return Err(PatchFault::Modified);
    }

    let grant = access.ensure_patchable(address, len).map_err(|_| PatchFault::Unmapped)?;
    warnings.extend(grant.warning);
    if grant.write_mode == WriteMode::Forced {
        warnings.push(PatchWarning::ForcedWrite { page: address & !(platform.page_size() - 1) });
    }

    let written = unsafe { platform.write_code(address, new, grant.write_mode) };
    let result = match written {
        Ok(()) => {
            platform.flush_icache(address, len);
            let mut back = [0u8; MAX_PATCH];
            unsafe { platform.read_code(address, &mut back[..len]) };
            if back[..len] == *new {
                Ok(())
            } else {
                Err(PatchFault::Mismatch)
            }
        }
        Err(fault) => Err(fault_of(fault)),
    };

    let result = match result {
        Err(_) if !roll_back(platform, address, expected, grant.write_mode) => Err(PatchFault::Torn),
        other => other,
    };

    warnings.extend(access.restore_protection(&grant));
    result
}

/// Puts `expected` back after a failed write. A refused write may still have
/// stored a prefix. Returns whether memory holds `expected` afterwards.
fn roll_back<P: PlatformPatcher>(platform: &P, address: usize, expected: &[u8], mode: WriteMode) -> bool {
    let len = expected.len();
    let mut now = [0u8; MAX_PATCH];
    unsafe { platform.read_code(address, &mut now[..len]) };
    if now[..len] == *expected {
        return true;
    }
    if unsafe { platform.write_code(address, expected, mode) }.is_err() {
        return false;
    }
    platform.flush_icache(address, len);
    unsafe { platform.read_code(address, &mut now[..len]) };
    now[..len] == *expected
}
