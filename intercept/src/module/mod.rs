//! Loaded-module lookup: module bases, exported symbols, and the
//! [`AddressResolver`] that turns module-relative references into addresses.

use crate::error::{HookError, Result};
use crate::types::{CodeAddress, Selector};

#[cfg(target_os = "macos")]
mod darwin;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
pub use darwin::{enumerate_exports, enumerate_modules, find_export, find_module, load_module};

#[cfg(target_os = "linux")]
pub use linux::{enumerate_exports, enumerate_modules, find_export, find_module, load_module};

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
mod other {
    use crate::types::{ExportInfo, ModuleInfo};

    pub fn enumerate_modules() -> Vec<ModuleInfo> {
        Vec::new()
    }

    pub fn find_module(_name: &str) -> Option<ModuleInfo> {
        None
    }

    pub fn load_module(_name: &str) -> bool {
        false
    }

    pub fn find_export(_module: &ModuleInfo, _symbol: &str) -> Option<usize> {
        None
    }

    pub fn enumerate_exports(_module: &ModuleInfo) -> Vec<ExportInfo> {
        Vec::new()
    }
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub use other::{enumerate_exports, enumerate_modules, find_export, find_module, load_module};

/// Resolves `(module, offset)` and `(module, export)` references.
#[derive(Debug, Clone, Copy)]
pub struct AddressResolver {
    load_missing: bool,
}

impl AddressResolver {
    pub fn new(load_missing: bool) -> Self {
        Self { load_missing }
    }

    fn module(&self, module: &str) -> Result<crate::types::ModuleInfo> {
        if let Some(found) = find_module(module) {
            return Ok(found);
        }
        if self.load_missing && load_module(module) {
            if let Some(found) = find_module(module) {
                log::info!("loaded module {} at {:#x}", found.path, found.base_address);
                return Ok(found);
            }
        }
        Err(HookError::ModuleNotFound { module: module.to_string() })
    }

    /// Base address of `module`, loading it first when allowed.
    pub fn resolve_module_base(&self, module: &str) -> Result<CodeAddress> {
        self.module(module).map(|m| CodeAddress::new(m.base_address))
    }

    /// `base + offset`. The offset is not checked against the module size.
    pub fn resolve_by_offset(&self, module: &str, offset: u64) -> Result<CodeAddress> {
        let base = self.module(module)?.base_address;
        usize::try_from(offset)
            .ok()
            .and_then(|offset| base.checked_add(offset))
            .map(CodeAddress::new)
            .ok_or_else(|| HookError::AddressOverflow { module: module.to_string(), base, offset })
    }

    pub fn resolve_by_export(&self, module: &str, symbol: &str) -> Result<CodeAddress> {
        let info = self.module(module)?;
        find_export(&info, symbol)
            .map(CodeAddress::new)
            .ok_or_else(|| HookError::ExportNotFound { module: module.to_string(), symbol: symbol.to_string() })
    }

    pub fn resolve(&self, module: &str, selector: &Selector) -> Result<CodeAddress> {
        match selector {
            Selector::Offset(offset) => self.resolve_by_offset(module, *offset),
            Selector::Export(symbol) => self.resolve_by_export(module, symbol),
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn offset_zero_is_the_module_base() {
        let resolver = AddressResolver::new(false);
        let base = resolver.resolve_module_base("libc.so.6").unwrap();
        assert_eq!(resolver.resolve_by_offset("libc.so.6", 0).unwrap(), base);
        assert_eq!(resolver.resolve_by_offset("libc.so.6", 0x10).unwrap(), base.offset(0x10));
    }

    #[test]
    fn offsets_past_the_address_space_overflow() {
        let resolver = AddressResolver::new(false);
        let err = resolver.resolve_by_offset("libc.so.6", u64::MAX).unwrap_err();
        assert!(matches!(err, HookError::AddressOverflow { .. }));
    }

    #[test]
    fn export_matches_dlsym() {
        let resolver = AddressResolver::new(false);
        let address = resolver.resolve("libc.so.6", &Selector::Export("getpid".into())).unwrap();
        let expected = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"getpid".as_ptr()) } as usize;
        assert_eq!(address.as_usize(), expected);
    }

    #[test]
    fn missing_module_and_symbol() {
        let resolver = AddressResolver::new(true);
        let err = resolver.resolve_module_base("librehook-missing.so").unwrap_err();
        assert!(matches!(err, HookError::ModuleNotFound { module } if module == "librehook-missing.so"));
        let err = resolver.resolve_by_export("libc.so.6", "rehook_no_such_symbol").unwrap_err();
        assert!(matches!(err, HookError::ExportNotFound { .. }));
    }

    #[test]
    fn loads_modules_on_demand() {
        // Either already mapped or loaded here by dlopen.
        let resolver = AddressResolver::new(true);
        let base = resolver.resolve_module_base("libm.so.6").unwrap();
        assert!(!base.is_null());
        let cos = resolver.resolve_by_export("libm.so.6", "cos").unwrap();
        assert!(find_module("libm.so.6").unwrap().contains(cos.as_usize()));
    }
}
