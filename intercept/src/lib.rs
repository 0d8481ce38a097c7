//! rehook-intercept: install, track and remove function hooks in the
//! running process.
//!
//! ```no_run
//! use rehook_intercept::{CodeAddress, InterceptionEngine};
//!
//! extern "C" fn replacement() -> i32 { 99 }
//!
//! rehook_intercept::init();
//! let engine = InterceptionEngine::from_env();
//! let target = engine.resolve_by_export("libexample.so", "answer")?;
//! let original = engine.install(target, CodeAddress::from_ptr(replacement as *const _))?;
//! assert_eq!(unsafe { engine.invoke(target)? }, 99);
//! assert_eq!(unsafe { engine.invoke(original)? }, 42);
//! engine.remove(target)?;
//! # Ok::<(), rehook_intercept::HookError>(())
//! ```

pub mod arch;
pub mod code;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod module;
pub mod platform;
pub mod types;

pub use config::EngineConfig;
pub use error::{HookError, PatchFault, PatchState, PatchWarning, Result};
pub use interceptor::listener::CallListener;
pub use interceptor::{HookRequest, InstallReport, InterceptionEngine, RevertReport};
pub use platform::{Capabilities, NativePatcher, PlatformPatcher};
pub use types::{CodeAddress, CpuContext, ExportInfo, HookMode, HookOrigin, HookRecord, InvocationContext, ModuleInfo, Selector};

/// One-time process setup. Safe to call any number of times.
///
/// On Linux this installs the signal handler used to park threads during a
/// patch; when that fails, quiescing degrades to a warning at patch time.
pub fn init() -> bool {
    #[cfg(target_os = "linux")]
    if let Err(code) = platform::linux::install_park_handler() {
        log::warn!("thread parking unavailable (code {code})");
    }
    true
}

/// Process-global lock for tests that patch real code.
///
/// Patching a function while another test calls it would crash, so every
/// such test holds this lock.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
