//! The patch state machine shared by every hook mode.
//!
//! `Pending → Captured → TrampolineReady → Quiesced → Patched → Installed`,
//! ending in `Failed` when a step gives up. The architecture-specific
//! planners only produce bytes; capture, the transaction, verification and
//! rollback all live here.

use crate::arch::CodegenError;
use crate::code::access::MemoryAccessController;
use crate::code::allocator::{CodeAllocator, CodeBlock};
use crate::code::patcher::{replace_bytes, Transaction, Warnings, MAX_PATCH};
use crate::config::EngineConfig;
use crate::error::{HookError, PatchFault, PatchState, PatchWarning, Result};
use crate::platform::{CodeSlice, PlatformPatcher};
use crate::types::CodeAddress;

#[cfg(target_arch = "x86_64")]
use super::attach_x86_64::AttachContext;
use super::listener::CallListener;

/// Prologue bytes read from a target before anything is changed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Captured {
    pub target: usize,
    /// Where the redirect goes: the target, or just past its landing pad.
    pub patch_address: usize,
    bytes: [u8; MAX_PATCH],
    available: usize,
}

impl Captured {
    /// Readable bytes starting at `patch_address`.
    pub fn code(&self) -> &[u8] {
        &self.bytes[..self.available]
    }

    #[cfg(test)]
    pub fn from_bytes(target: usize, code: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_PATCH];
        let available = code.len().min(MAX_PATCH);
        bytes[..available].copy_from_slice(&code[..available]);
        Self { target, patch_address: target, bytes, available }
    }
}

/// Bytes to write at the target plus the code they jump to.
pub(crate) struct Plan<'p, P: PlatformPatcher> {
    /// Whole instructions displaced by the redirect.
    pub len: usize,
    pub redirect: [u8; MAX_PATCH],
    pub block: Option<CodeBlock<'p, P>>,
    pub trampoline: Option<usize>,
    #[cfg(target_arch = "x86_64")]
    pub attach: Option<Box<AttachContext>>,
}

impl<P: PlatformPatcher> std::fmt::Debug for Plan<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("len", &self.len)
            .field("redirect", &&self.redirect[..self.len])
            .field("trampoline", &self.trampoline)
            .finish()
    }
}

pub(crate) enum PatchKind {
    Replace { replacement: usize, keep_original: bool },
    Attach(CallListener),
}

/// Everything needed to undo an installed patch.
#[derive(Debug)]
pub(crate) struct AppliedPatch {
    patch_address: usize,
    len: usize,
    original: [u8; MAX_PATCH],
    redirect: [u8; MAX_PATCH],
    code: Option<CodeSlice>,
    #[cfg(target_arch = "x86_64")]
    attach: Option<Box<AttachContext>>,
}

impl AppliedPatch {
    /// Abandons the patch without freeing anything it references: code that
    /// may still be running keeps its trampoline and listener context.
    pub fn leak(self) {
        #[cfg(target_arch = "x86_64")]
        if let Some(context) = self.attach {
            Box::leak(context);
        }
    }
}

#[derive(Debug)]
pub(crate) struct Installed {
    pub patch: AppliedPatch,
    pub trampoline: Option<CodeAddress>,
    pub warnings: Vec<PatchWarning>,
}

/// Runs installs and reverts against one platform.
pub(crate) struct PatchInstaller<'p, P: PlatformPatcher> {
    platform: &'p P,
    config: &'p EngineConfig,
}

#[cfg(target_arch = "x86_64")]
fn landing_pad_len(code: &[u8]) -> usize {
    if crate::arch::x86_64::is_endbr64(code) {
        crate::arch::x86_64::ENDBR64.len()
    } else {
        0
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn landing_pad_len(_code: &[u8]) -> usize {
    0
}

#[cfg(target_arch = "x86_64")]
use super::replace_x86_64::plan as plan_replace;

#[cfg(target_arch = "aarch64")]
use super::replace_arm64::plan as plan_replace;

// No redirect encoder on this architecture; `install` rejects it up front.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn plan_replace<'p, P: PlatformPatcher>(
    _alloc: &CodeAllocator<'p, P>,
    _captured: &Captured,
    _replacement: usize,
    _keep_original: bool,
) -> std::result::Result<Plan<'p, P>, PatchFault> {
    Err(PatchFault::Relocation)
}

impl<'p, P: PlatformPatcher> PatchInstaller<'p, P> {
    pub fn new(platform: &'p P, config: &'p EngineConfig) -> Self {
        Self { platform, config }
    }

    /// Reads the prologue at `target`, skipping a CET landing pad.
    pub fn capture(&self, target: usize) -> Result<Captured> {
        let access = MemoryAccessController::new(self.platform);
        access.ensure_readable(target, 1)?;
        let available = if access.ensure_readable(target, MAX_PATCH).is_ok() {
            MAX_PATCH
        } else {
            self.platform.query_region(target).map_or(1, |r| (r.end - target).min(MAX_PATCH))
        };

        let mut raw = [0u8; MAX_PATCH];
        unsafe { self.platform.read_code(target, &mut raw[..available]) };

        let skip = landing_pad_len(&raw[..available]);
        let mut bytes = [0u8; MAX_PATCH];
        bytes[..available - skip].copy_from_slice(&raw[skip..available]);
        Ok(Captured { target, patch_address: target + skip, bytes, available: available - skip })
    }

    pub fn install(&self, target: CodeAddress, kind: PatchKind) -> Result<Installed> {
        let caps = self.platform.capabilities();
        if !caps.inline_patch || !cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            return Err(HookError::Unsupported("inline patching"));
        }

        let mut state = PatchState::Pending;
        let captured = self.capture(target.as_usize())?;
        state = advance(target, state, PatchState::Captured);

        let alloc = CodeAllocator::new(self.platform, self.config.prefer_near_allocation);
        let plan = match kind {
            PatchKind::Replace { replacement, keep_original } => {
                plan_replace(&alloc, &captured, replacement, keep_original)
            }
            #[cfg(target_arch = "x86_64")]
            PatchKind::Attach(listener) if caps.attach => super::attach_x86_64::plan(&alloc, &captured, listener),
            PatchKind::Attach(_) => return Err(HookError::Unsupported("attach")),
        };
        // Nothing has been written yet: a planning failure leaves the target
        // as captured.
        let plan = plan.map_err(|reason| install_failed(target, state, reason))?;
        state = advance(target, state, PatchState::TrampolineReady);

        let mut original = [0u8; MAX_PATCH];
        original[..plan.len].copy_from_slice(&captured.code()[..plan.len]);

        let mut warnings = Warnings::default();
        let access = MemoryAccessController::new(self.platform);
        let tx = Transaction::begin(self.platform, self.config.quiesce(), &mut warnings);
        let written = replace_bytes(
            self.platform,
            &access,
            captured.patch_address,
            &original[..plan.len],
            &plan.redirect[..plan.len],
            &mut warnings,
        );
        tx.end();

        let warnings = warnings.to_vec();
        for warning in &warnings {
            log::warn!("install at {target}: {warning}");
        }
        if let Err(reason) = written {
            if reason == PatchFault::Torn {
                log::error!("install at {target}: {reason}");
            }
            // Dropping the plan frees its code block.
            drop(plan);
            return Err(install_failed(target, PatchState::Quiesced, reason));
        }
        state = advance(target, state, PatchState::Patched);
        advance(target, state, PatchState::Installed);

        let trampoline = plan.trampoline.map(CodeAddress::new);
        let patch = AppliedPatch {
            patch_address: captured.patch_address,
            len: plan.len,
            original,
            redirect: plan.redirect,
            code: plan.block.map(CodeBlock::keep),
            #[cfg(target_arch = "x86_64")]
            attach: plan.attach,
        };
        Ok(Installed { patch, trampoline, warnings })
    }

    /// Puts the original bytes back. On success the patch's code memory is
    /// freed; on failure the patch is left as it was.
    pub fn revert(&self, target: CodeAddress, patch: &mut AppliedPatch) -> Result<Vec<PatchWarning>> {
        let mut warnings = Warnings::default();
        let access = MemoryAccessController::new(self.platform);
        let tx = Transaction::begin(self.platform, self.config.quiesce(), &mut warnings);
        let written = replace_bytes(
            self.platform,
            &access,
            patch.patch_address,
            &patch.redirect[..patch.len],
            &patch.original[..patch.len],
            &mut warnings,
        );
        tx.end();

        let warnings = warnings.to_vec();
        for warning in &warnings {
            log::warn!("revert at {target}: {warning}");
        }
        if let Err(reason) = written {
            if reason == PatchFault::Torn {
                log::error!("revert at {target}: {reason}");
            }
            return Err(HookError::RevertFailed { address: target, reason });
        }

        if let Some(code) = patch.code.take() {
            // The redirect is gone, so only calls already inside the
            // trampoline could still reach it.
            unsafe { self.platform.free_code(code) };
        }
        #[cfg(target_arch = "x86_64")]
        {
            patch.attach = None;
        }
        log::debug!("revert at {target}: {:?}", PatchState::Reverted);
        Ok(warnings)
    }
}

/// Records why code generation gave up; the detail only reaches the log.
pub(crate) fn relocation_fault(target: usize, error: CodegenError) -> PatchFault {
    log::debug!("relocating prologue at {target:#x}: {error}");
    PatchFault::Relocation
}

fn install_failed(target: CodeAddress, stage: PatchState, reason: PatchFault) -> HookError {
    log::debug!("install at {target} stopped after {stage:?}: {reason}");
    HookError::InstallFailed { address: target, stage, reason }
}

fn advance(target: CodeAddress, from: PatchState, to: PatchState) -> PatchState {
    log::trace!("{target}: {from:?} -> {to:?}");
    to
}
