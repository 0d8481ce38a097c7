//! The interception engine: one registry, one lock, one platform.

use std::sync::{Mutex, MutexGuard};

use crate::config::EngineConfig;
use crate::error::{HookError, PatchWarning, Result};
use crate::module::AddressResolver;
use crate::platform::{Capabilities, NativePatcher, PlatformPatcher};
use crate::types::{null_check, CodeAddress, HookMode, HookOrigin, HookRecord, Selector};

pub mod invocation;
pub mod listener;
pub mod registry;

mod installer;

#[cfg(target_arch = "x86_64")]
mod attach_x86_64;

#[cfg(target_arch = "x86_64")]
mod replace_x86_64;

#[cfg(target_arch = "aarch64")]
mod replace_arm64;

use installer::{AppliedPatch, PatchInstaller, PatchKind};
use listener::CallListener;
use registry::HookRegistry;

/// Replace-mode install options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRequest {
    pub replacement: CodeAddress,
    /// Build a trampoline so the replacement can call the original.
    pub keep_original: bool,
    pub origin: HookOrigin,
}

impl HookRequest {
    pub fn new(replacement: CodeAddress) -> Self {
        Self { replacement, keep_original: true, origin: HookOrigin::Raw }
    }

    pub fn without_original(mut self) -> Self {
        self.keep_original = false;
        self
    }

    pub fn with_origin(mut self, origin: HookOrigin) -> Self {
        self.origin = origin;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub record: HookRecord,
    pub warnings: Vec<PatchWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertReport {
    pub record: HookRecord,
    pub warnings: Vec<PatchWarning>,
}

/// Installs and removes hooks in the current process.
///
/// Every public operation takes the engine lock, so registry checks, the
/// patch transaction and the registry update happen as one step. Dropping
/// the engine reverts whatever is still installed.
pub struct InterceptionEngine<P: PlatformPatcher = NativePatcher> {
    platform: P,
    config: EngineConfig,
    resolver: AddressResolver,
    registry: Mutex<HookRegistry<AppliedPatch>>,
}

impl InterceptionEngine<NativePatcher> {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine configured from `REHOOK_*` environment variables.
    pub fn from_env() -> Self {
        Self::with_config(EngineConfig::from_env())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_platform(NativePatcher::new(), config)
    }
}

impl Default for InterceptionEngine<NativePatcher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PlatformPatcher> InterceptionEngine<P> {
    pub fn with_platform(platform: P, config: EngineConfig) -> Self {
        let resolver = AddressResolver::new(config.load_missing_modules);
        Self { platform, config, resolver, registry: Mutex::new(HookRegistry::default()) }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn capabilities(&self) -> Capabilities {
        self.platform.capabilities()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, HookRegistry<AppliedPatch>> {
        // A panic while holding the lock cannot leave a half-applied patch:
        // every patch step completes or rolls back before returning.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn installer(&self) -> PatchInstaller<'_, P> {
        PatchInstaller::new(&self.platform, &self.config)
    }

    pub fn module_base(&self, module: &str) -> Result<CodeAddress> {
        self.resolver.resolve_module_base(module)
    }

    pub fn resolve_by_offset(&self, module: &str, offset: u64) -> Result<CodeAddress> {
        self.resolver.resolve_by_offset(module, offset)
    }

    pub fn resolve_by_export(&self, module: &str, symbol: &str) -> Result<CodeAddress> {
        self.resolver.resolve_by_export(module, symbol)
    }

    pub fn resolve(&self, module: &str, selector: &Selector) -> Result<CodeAddress> {
        self.resolver.resolve(module, selector)
    }

    /// Redirects every call of `target` to `replacement` and returns a
    /// trampoline that still runs the original.
    pub fn install(&self, target: CodeAddress, replacement: CodeAddress) -> Result<CodeAddress> {
        let report = self.install_with(target, HookRequest::new(replacement))?;
        // Planning with `keep_original` always yields a trampoline.
        Ok(report.record.trampoline_address.unwrap_or(CodeAddress::NULL))
    }

    pub fn install_with(&self, target: CodeAddress, request: HookRequest) -> Result<InstallReport> {
        null_check(target, "install")?;
        null_check(request.replacement, "install")?;
        let kind = PatchKind::Replace {
            replacement: request.replacement.as_usize(),
            keep_original: request.keep_original,
        };
        self.apply(target, kind, HookMode::Replace, Some(request.replacement), request.origin)
    }

    /// Runs `listener` around every call of `target`. The original keeps
    /// running; no trampoline is published.
    pub fn attach(&self, target: CodeAddress, listener: CallListener) -> Result<InstallReport> {
        null_check(target, "attach")?;
        self.apply(target, PatchKind::Attach(listener), HookMode::Attach, None, HookOrigin::Raw)
    }

    fn apply(
        &self,
        target: CodeAddress,
        kind: PatchKind,
        mode: HookMode,
        replacement: Option<CodeAddress>,
        origin: HookOrigin,
    ) -> Result<InstallReport> {
        let mut registry = self.registry();
        if registry.contains(target) {
            return Err(HookError::AlreadyHooked { address: target });
        }

        let installed = self.installer().install(target, kind)?;
        let record = HookRecord {
            target_address: target,
            replacement_address: replacement,
            trampoline_address: installed.trampoline,
            mode,
            origin,
        };
        registry.try_insert(record.clone(), installed.patch)?;
        drop(registry);

        log::info!("hooked {target} ({}, {:?})", record.origin, record.mode);
        if let Some(trampoline) = record.trampoline_address {
            log::debug!("{target}: trampoline at {trampoline}");
        }
        Ok(InstallReport { record, warnings: installed.warnings })
    }

    /// Reverts the hook at `target`. When the revert fails the hook stays
    /// registered and can be retried.
    pub fn remove(&self, target: CodeAddress) -> Result<RevertReport> {
        null_check(target, "remove")?;
        let mut registry = self.registry();
        let patch = registry.payload_mut(target).ok_or(HookError::UnknownTarget { address: target })?;
        let warnings = self.installer().revert(target, patch)?;
        let (record, _) = registry.remove(target)?;
        drop(registry);

        log::info!("unhooked {target} ({})", record.origin);
        Ok(RevertReport { record, warnings })
    }

    pub fn lookup(&self, target: CodeAddress) -> Option<HookRecord> {
        self.registry().lookup(target).cloned()
    }

    /// Active hooks ordered by target address.
    pub fn hooks(&self) -> Vec<HookRecord> {
        self.registry().records()
    }

    /// Calls the zero-argument function at `address` and returns its result.
    ///
    /// # Safety
    /// `address` must be the entry of a function with the signature
    /// `extern "C" fn() -> i32`, callable from the current thread.
    pub unsafe fn invoke(&self, address: CodeAddress) -> Result<i32> {
        null_check(address, "invoke")?;
        match self.platform.query_region(address.as_usize()) {
            Some(region) if region.protection.execute => {}
            _ => return Err(HookError::NotReadable { address }),
        }
        let function: extern "C" fn() -> i32 = core::mem::transmute(address.as_usize());
        Ok(function())
    }
}

impl<P: PlatformPatcher> Drop for InterceptionEngine<P> {
    fn drop(&mut self) {
        let entries = self.registry().drain_all();
        for (record, mut patch) in entries {
            let target = record.target_address;
            match self.installer().revert(target, &mut patch) {
                Ok(_) => log::debug!("reverted {target} on teardown"),
                Err(e) => {
                    log::error!("leaving {target} hooked: {e}");
                    patch.leak();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PatchFault, PatchState};
    use crate::platform::fake::{FakeEvent, FakePatcher, SAMPLE_RETURNS_42};

    fn engine() -> (InterceptionEngine<FakePatcher>, usize) {
        let engine = InterceptionEngine::with_platform(FakePatcher::new(), EngineConfig::default());
        let target = engine.platform().map_code(SAMPLE_RETURNS_42);
        (engine, target)
    }

    #[test]
    fn install_records_and_remove_restores() {
        let (engine, target) = engine();
        let target_addr = CodeAddress::new(target);
        let replacement = target_addr.offset(0x300);

        let trampoline = engine.install(target_addr, replacement).unwrap();
        let record = engine.lookup(target_addr).unwrap();
        assert_eq!(record.trampoline_address, Some(trampoline));
        assert_eq!(record.replacement_address, Some(replacement));
        assert_eq!(record.mode, HookMode::Replace);

        let report = engine.remove(target_addr).unwrap();
        assert_eq!(report.record, record);
        assert!(engine.lookup(target_addr).is_none());
        assert_eq!(engine.platform().peek(target, SAMPLE_RETURNS_42.len()), SAMPLE_RETURNS_42);
    }

    #[test]
    fn second_install_is_rejected_without_touching_bytes() {
        let (engine, target) = engine();
        let target_addr = CodeAddress::new(target);
        engine.install(target_addr, target_addr.offset(0x300)).unwrap();
        let patched = engine.platform().peek(target, SAMPLE_RETURNS_42.len());
        engine.platform().clear_events();

        let err = engine.install(target_addr, target_addr.offset(0x400)).unwrap_err();
        assert!(matches!(err, HookError::AlreadyHooked { .. }));
        assert!(engine.platform().events().is_empty());
        assert_eq!(engine.platform().peek(target, SAMPLE_RETURNS_42.len()), patched);
        assert_eq!(engine.hooks().len(), 1);
    }

    #[test]
    fn failed_revert_keeps_the_entry() {
        let (engine, target) = engine();
        let target_addr = CodeAddress::new(target);
        engine.install(target_addr, target_addr.offset(0x300)).unwrap();

        engine.platform().fail_write_after(0);
        let err = engine.remove(target_addr).unwrap_err();
        assert!(matches!(err, HookError::RevertFailed { reason: PatchFault::Refused(_), .. }));
        assert!(engine.lookup(target_addr).is_some());

        engine.platform().allow_writes();
        engine.remove(target_addr).unwrap();
        assert!(engine.hooks().is_empty());
    }

    #[test]
    fn failed_install_leaves_engine_usable() {
        let (engine, target) = engine();
        let target_addr = CodeAddress::new(target);
        engine.platform().fail_write_after(0);
        let err = engine.install(target_addr, target_addr.offset(0x300)).unwrap_err();
        assert!(matches!(err, HookError::InstallFailed { stage: PatchState::Quiesced, .. }));
        assert!(engine.hooks().is_empty());

        engine.platform().allow_writes();
        engine.install(target_addr, target_addr.offset(0x300)).unwrap();
    }

    #[test]
    fn allocation_failure_is_an_install_failure() {
        let (engine, target) = engine();
        let target_addr = CodeAddress::new(target);
        engine.platform().fail_alloc(true);
        engine.platform().clear_events();

        let err = engine.install(target_addr, target_addr.offset(0x300)).unwrap_err();
        assert!(matches!(
            err,
            HookError::InstallFailed { stage: PatchState::Captured, reason: PatchFault::Allocation(libc::ENOMEM), .. }
        ));
        assert!(!engine.platform().events().iter().any(|e| matches!(e, FakeEvent::Write { .. })));
        assert_eq!(engine.platform().peek(target, SAMPLE_RETURNS_42.len()), SAMPLE_RETURNS_42);
        assert!(engine.hooks().is_empty());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn unrelocatable_prologue_is_an_install_failure() {
        let engine = InterceptionEngine::with_platform(FakePatcher::new(), EngineConfig::default());
        // xor eax, eax; ret
        let code = [0x31, 0xC0, 0xC3, 0xCC, 0xCC, 0xCC];
        let target = engine.platform().map_code(&code);
        let target_addr = CodeAddress::new(target);

        let err = engine.install(target_addr, target_addr.offset(0x300)).unwrap_err();
        assert!(matches!(err, HookError::InstallFailed { stage: PatchState::Captured, reason: PatchFault::Relocation, .. }));
        assert_eq!(engine.platform().peek(target, code.len()), code);
        assert_eq!(engine.platform().live_blocks(), 0);
    }

    #[test]
    fn torn_install_is_reported_and_not_registered() {
        let (engine, target) = engine();
        let target_addr = CodeAddress::new(target);
        engine.platform().partial_write(3);
        engine.platform().fail_write_after(1);

        let err = engine.install(target_addr, target_addr.offset(0x300)).unwrap_err();
        assert!(matches!(err, HookError::InstallFailed { reason: PatchFault::Torn, .. }));
        assert!(engine.lookup(target_addr).is_none());
    }

    #[test]
    fn unknown_and_null_targets() {
        let (engine, target) = engine();
        assert!(matches!(engine.remove(CodeAddress::new(target)), Err(HookError::UnknownTarget { .. })));
        assert!(matches!(
            engine.install(CodeAddress::NULL, CodeAddress::new(target)),
            Err(HookError::NullAddress { operation: "install" })
        ));
        assert!(matches!(unsafe { engine.invoke(CodeAddress::NULL) }, Err(HookError::NullAddress { .. })));
    }

    #[test]
    fn request_without_original_publishes_no_trampoline() {
        let (engine, target) = engine();
        let target_addr = CodeAddress::new(target);
        let origin = HookOrigin::Resolved { module: "fixture".into(), selector: Selector::Offset(0) };
        let request = HookRequest::new(target_addr.offset(0x300)).without_original().with_origin(origin.clone());

        let report = engine.install_with(target_addr, request).unwrap();
        assert_eq!(report.record.trampoline_address, None);
        assert_eq!(report.record.origin, origin);
        assert_eq!(engine.platform().live_blocks(), 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn attach_records_no_trampoline() {
        let (engine, target) = engine();
        let target_addr = CodeAddress::new(target);
        let report = engine.attach(target_addr, CallListener::new(None, None, core::ptr::null_mut())).unwrap();
        assert_eq!(report.record.mode, HookMode::Attach);
        assert_eq!(report.record.trampoline_address, None);
        engine.remove(target_addr).unwrap();
        assert_eq!(engine.platform().live_blocks(), 0);
    }
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod native_tests {
    use core::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::InvocationContext;

    #[inline(never)]
    extern "C" fn answer() -> i32 {
        42
    }

    #[inline(never)]
    extern "C" fn attached_answer() -> i32 {
        43
    }

    #[inline(never)]
    extern "C" fn substitute() -> i32 {
        99
    }

    fn address(f: extern "C" fn() -> i32) -> CodeAddress {
        CodeAddress::new(f as usize)
    }

    #[test]
    fn replace_round_trip_on_real_code() {
        let _guard = crate::lock_hook_tests();
        let engine = InterceptionEngine::new();
        let target = address(answer);

        let original = engine.install(target, address(substitute)).unwrap();
        unsafe {
            assert_eq!(engine.invoke(target).unwrap(), 99);
            assert_eq!(engine.invoke(original).unwrap(), 42);
        }
        engine.remove(target).unwrap();
        assert_eq!(unsafe { engine.invoke(target).unwrap() }, 42);
    }

    unsafe extern "C" fn count_enter(_ctx: *mut InvocationContext, data: *mut c_void) {
        (*(data as *const AtomicUsize)).fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn bump_result(ctx: *mut InvocationContext, data: *mut c_void) {
        (*(data as *const AtomicUsize)).fetch_add(10, Ordering::SeqCst);
        let ctx = &mut *ctx;
        ctx.set_return_value(ctx.return_value() + 1);
    }

    #[test]
    fn attach_observes_and_rewrites_result() {
        let _guard = crate::lock_hook_tests();
        let engine = InterceptionEngine::new();
        let target = address(attached_answer);
        let calls = AtomicUsize::new(0);
        let listener = CallListener::new(
            Some(count_enter),
            Some(bump_result),
            &calls as *const AtomicUsize as *mut c_void,
        );

        engine.attach(target, listener).unwrap();
        assert_eq!(unsafe { engine.invoke(target).unwrap() }, 44);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        engine.remove(target).unwrap();
        assert_eq!(unsafe { engine.invoke(target).unwrap() }, 43);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }
}
