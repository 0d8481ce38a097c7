use thiserror::Error;

use crate::types::CodeAddress;

/// Stage of the patch state machine at which an operation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Pending,
    Captured,
    TrampolineReady,
    Quiesced,
    Patched,
    Installed,
    Failed,
    Reverted,
}

/// Why a byte-level write did not take effect.
///
/// Kept `Copy` and allocation-free: it is produced while other threads may be
/// parked and converted into a [`HookError`] only after they resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFault {
    /// The page could not be made writable and no forced-write path exists.
    NotWritable,
    /// The platform refused the write (errno / kern_return).
    Refused(i32),
    /// Only part of the bytes reached memory before the write stopped.
    Partial { written: usize },
    /// The bytes read back after the write differ from what was written.
    Mismatch,
    /// The bytes at the target changed between capture and patch.
    Modified,
    /// The region stopped being mapped.
    Unmapped,
    /// The prologue cannot be moved into a trampoline, or is too short for
    /// the redirect.
    Relocation,
    /// No executable memory could be allocated or sealed (errno / kern_return).
    Allocation(i32),
    /// A write failed and putting the previous bytes back failed too: the
    /// target holds a mix of old and new bytes.
    Torn,
}

impl std::fmt::Display for PatchFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchFault::NotWritable => write!(f, "page is not writable"),
            PatchFault::Refused(code) => write!(f, "write refused (code {code})"),
            PatchFault::Partial { written } => write!(f, "partial write ({written} bytes)"),
            PatchFault::Mismatch => write!(f, "bytes did not read back as written"),
            PatchFault::Modified => write!(f, "target bytes changed since capture"),
            PatchFault::Unmapped => write!(f, "region is not mapped"),
            PatchFault::Relocation => write!(f, "prologue cannot be relocated"),
            PatchFault::Allocation(code) => write!(f, "could not allocate executable memory (code {code})"),
            PatchFault::Torn => write!(f, "rollback failed, target bytes are inconsistent"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("module not found: {module}")]
    ModuleNotFound { module: String },

    #[error("export '{symbol}' not found in module {module}")]
    ExportNotFound { module: String, symbol: String },

    #[error("{module} base {base:#x} + offset {offset:#x} overflows the address space")]
    AddressOverflow { module: String, base: usize, offset: u64 },

    #[error("memory at {address} is not readable")]
    NotReadable { address: CodeAddress },

    #[error("{address} is already hooked")]
    AlreadyHooked { address: CodeAddress },

    #[error("install at {address} failed while {stage:?}: {reason}")]
    InstallFailed {
        address: CodeAddress,
        stage: PatchState,
        reason: PatchFault,
    },

    #[error("revert at {address} failed: {reason}")]
    RevertFailed { address: CodeAddress, reason: PatchFault },

    #[error("no hook installed at {address}")]
    UnknownTarget { address: CodeAddress },

    #[error("{operation} called with a null address")]
    NullAddress { operation: &'static str },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, HookError>;

/// Degraded-but-functional outcome of a patch or revert.
///
/// Warnings never abort an operation; they are collected in the operation's
/// report and logged once threads have resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchWarning {
    /// Elevating page protection failed.
    ProtectionChangeFailed { page: usize, code: i32 },
    /// The bytes were written through the kernel-assisted path.
    ForcedWrite { page: usize },
    /// The previous page protection could not be put back.
    ProtectionRestoreFailed { page: usize, code: i32 },
    /// Not every other thread was parked before the write.
    QuiesceDegraded { parked: usize, expected: usize },
    /// Thread suspension is unavailable or failed outright.
    QuiesceUnavailable { code: i32 },
}

impl std::fmt::Display for PatchWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchWarning::ProtectionChangeFailed { page, code } => {
                write!(f, "could not make page {page:#x} writable (code {code})")
            }
            PatchWarning::ForcedWrite { page } => write!(f, "page {page:#x} patched through forced write"),
            PatchWarning::ProtectionRestoreFailed { page, code } => {
                write!(f, "could not restore protection of page {page:#x} (code {code})")
            }
            PatchWarning::QuiesceDegraded { parked, expected } => {
                write!(f, "only {parked} of {expected} threads parked during patch")
            }
            PatchWarning::QuiesceUnavailable { code } => {
                write!(f, "threads were not suspended (code {code})")
            }
        }
    }
}
