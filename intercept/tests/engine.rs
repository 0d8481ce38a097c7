//! End-to-end tests against the native platform: real code is patched, called
//! and restored.

use std::sync::{Mutex, MutexGuard};

use rehook_intercept::{CodeAddress, EngineConfig, HookError, HookMode, InterceptionEngine, Selector};

static PATCHING: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    PATCHING.lock().unwrap_or_else(|e| e.into_inner())
}

// Distinct bodies so the linker cannot fold them together.
#[inline(never)]
extern "C" fn returns_42() -> i32 {
    42
}

#[inline(never)]
extern "C" fn returns_42_again() -> i32 {
    4242
}

#[inline(never)]
extern "C" fn returns_99() -> i32 {
    99
}

#[inline(never)]
extern "C" fn returns_7() -> i32 {
    7
}

fn address(f: extern "C" fn() -> i32) -> CodeAddress {
    CodeAddress::new(f as usize)
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn round_trip_42_99_42() {
    let _serial = serial();
    rehook_intercept::init();
    let engine = InterceptionEngine::new();
    let target = address(returns_42);

    assert_eq!(unsafe { engine.invoke(target) }.unwrap(), 42);
    let trampoline = engine.install(target, address(returns_99)).unwrap();
    assert_eq!(unsafe { engine.invoke(target) }.unwrap(), 99);
    assert_eq!(unsafe { engine.invoke(trampoline) }.unwrap(), 42);

    let report = engine.remove(target).unwrap();
    assert_eq!(report.record.mode, HookMode::Replace);
    assert_eq!(unsafe { engine.invoke(target) }.unwrap(), 42);
    assert!(engine.hooks().is_empty());
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn second_hook_on_same_target_is_rejected() {
    let _serial = serial();
    let engine = InterceptionEngine::new();
    let target = address(returns_42_again);

    engine.install(target, address(returns_99)).unwrap();
    let err = engine.install(target, address(returns_7)).unwrap_err();
    assert!(matches!(err, HookError::AlreadyHooked { address } if address == target));
    // The first hook is still the one in effect.
    assert_eq!(unsafe { engine.invoke(target) }.unwrap(), 99);
    engine.remove(target).unwrap();
    assert_eq!(unsafe { engine.invoke(target) }.unwrap(), 4242);
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn dropping_the_engine_reverts_its_hooks() {
    let _serial = serial();
    let target = address(returns_7);
    {
        let engine = InterceptionEngine::with_config(EngineConfig::default().with_quiesce_threads(true));
        let report = engine.install(target, address(returns_99));
        assert!(report.is_ok());
        assert_eq!(unsafe { engine.invoke(target) }.unwrap(), 99);
    }
    assert_eq!(returns_7_via_pointer(), 7);
}

fn returns_7_via_pointer() -> i32 {
    let f: extern "C" fn() -> i32 = std::hint::black_box(returns_7);
    f()
}

#[test]
fn removing_an_unknown_target_fails() {
    let engine = InterceptionEngine::new();
    let err = engine.remove(address(returns_99)).unwrap_err();
    assert!(matches!(err, HookError::UnknownTarget { .. }));
}

#[test]
fn invoke_rejects_null_and_data_addresses() {
    let engine = InterceptionEngine::new();
    assert!(matches!(unsafe { engine.invoke(CodeAddress::NULL) }, Err(HookError::NullAddress { .. })));

    static DATA: [u8; 16] = [0; 16];
    let data = CodeAddress::new(DATA.as_ptr() as usize);
    assert!(unsafe { engine.invoke(data) }.is_err());
}

#[cfg(target_os = "linux")]
mod resolution {
    use super::*;

    #[test]
    fn offset_zero_is_the_module_base() {
        let engine = InterceptionEngine::new();
        let base = engine.module_base("libc.so.6").unwrap();
        assert_eq!(engine.resolve_by_offset("libc.so.6", 0).unwrap(), base);
        assert_eq!(engine.resolve("libc.so.6", &Selector::Offset(0)).unwrap(), base);
    }

    #[test]
    fn export_matches_dlsym() {
        let engine = InterceptionEngine::new();
        let resolved = engine.resolve_by_export("libc.so.6", "getpid").unwrap();
        let expected = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"getpid".as_ptr()) };
        assert_eq!(resolved.as_usize(), expected as usize);
    }

    #[test]
    fn missing_module_and_export_are_named() {
        let engine = InterceptionEngine::with_config(EngineConfig::default().with_load_missing_modules(false));
        match engine.resolve_by_offset("librehook-does-not-exist.so", 0) {
            Err(HookError::ModuleNotFound { module }) => assert_eq!(module, "librehook-does-not-exist.so"),
            other => panic!("unexpected {other:?}"),
        }
        match engine.resolve_by_export("libc.so.6", "rehook_no_such_symbol") {
            Err(HookError::ExportNotFound { symbol, .. }) => assert_eq!(symbol, "rehook_no_such_symbol"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
