use core::ffi::c_void;
use std::fmt;
use std::str::FromStr;

use crate::error::HookError;

/// Absolute address of code in this process.
///
/// Addresses are plain integers everywhere in the engine. The only place one
/// is turned into something callable is `InterceptionEngine::invoke`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CodeAddress(usize);

impl CodeAddress {
    pub const NULL: CodeAddress = CodeAddress(0);

    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    /// Address of a function or code pointer, e.g. `CodeAddress::from_ptr(f as *const c_void)`.
    pub fn from_ptr(ptr: *const c_void) -> Self {
        Self(ptr as usize)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[cfg(test)]
    pub(crate) fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl From<usize> for CodeAddress {
    fn from(address: usize) -> Self {
        Self(address)
    }
}

impl From<CodeAddress> for u64 {
    fn from(address: CodeAddress) -> Self {
        address.as_u64()
    }
}

impl TryFrom<u64> for CodeAddress {
    type Error = std::num::TryFromIntError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        usize::try_from(value).map(Self)
    }
}

impl fmt::Debug for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeAddress({:#x})", self.0)
    }
}

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// How a symbolic reference inside a module is expressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// Offset from the module base (an RVA).
    Offset(u64),
    /// Name of an exported symbol.
    Export(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Offset(offset) => write!(f, "+{offset:#x}"),
            Selector::Export(name) => f.write_str(name),
        }
    }
}

impl FromStr for Selector {
    type Err = std::convert::Infallible;

    /// `0x`-prefixed hex or plain decimal parses as an offset, anything else
    /// is taken as an export name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let offset = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse::<u64>().ok(),
        };
        Ok(match offset {
            Some(offset) => Selector::Offset(offset),
            None => Selector::Export(s.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    /// Calls land in the replacement; the original is reachable only via the trampoline.
    Replace,
    /// Calls still run the original, bracketed by listener notifications.
    Attach,
}

/// Where a hooked address came from, kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HookOrigin {
    /// The caller handed the engine an address directly.
    #[default]
    Raw,
    Resolved { module: String, selector: Selector },
}

impl fmt::Display for HookOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookOrigin::Raw => f.write_str("<raw address>"),
            HookOrigin::Resolved { module, selector: Selector::Offset(offset) } => {
                write!(f, "{module}+{offset:#x}")
            }
            HookOrigin::Resolved { module, selector: Selector::Export(name) } => {
                write!(f, "{module}!{name}")
            }
        }
    }
}

/// One active hook, as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRecord {
    pub target_address: CodeAddress,
    pub replacement_address: Option<CodeAddress>,
    pub trampoline_address: Option<CodeAddress>,
    pub mode: HookMode,
    pub origin: HookOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
}

impl ModuleInfo {
    /// Matches either the file name or a trailing part of the path.
    pub fn matches(&self, name: &str) -> bool {
        !name.is_empty() && (self.name == name || self.path == name || self.path.ends_with(&format!("/{name}")))
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base_address && address - self.base_address < self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub address: usize,
}

// ── Attach-mode register snapshots ───────────────────────────────────

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct X86_64CpuContext {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[cfg(target_arch = "x86_64")]
pub type CpuContext = X86_64CpuContext;

#[cfg(not(target_arch = "x86_64"))]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Arm64CpuContext {
    pub pc: u64,
    pub sp: u64,
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
}

#[cfg(not(target_arch = "x86_64"))]
pub type CpuContext = Arm64CpuContext;

/// Handed to attach listeners on entry and exit of the hooked function.
///
/// Only the engine creates these; the register snapshot it points to lives
/// on the hooked call's stack for the duration of the callback.
#[repr(C)]
#[derive(Debug)]
pub struct InvocationContext {
    pub(crate) function: CodeAddress,
    pub(crate) cpu_context: *mut CpuContext,
}

pub(crate) fn null_check(address: CodeAddress, operation: &'static str) -> Result<(), HookError> {
    if address.is_null() {
        Err(HookError::NullAddress { operation })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parses_offsets_and_names() {
        assert_eq!("0x1000".parse::<Selector>().unwrap(), Selector::Offset(0x1000));
        assert_eq!("4096".parse::<Selector>().unwrap(), Selector::Offset(4096));
        assert_eq!("malloc".parse::<Selector>().unwrap(), Selector::Export("malloc".into()));
        // Hex digits without the prefix are a name, not an offset.
        assert_eq!("beef".parse::<Selector>().unwrap(), Selector::Export("beef".into()));
    }

    #[test]
    fn module_matching_uses_name_or_path_suffix() {
        let m = ModuleInfo {
            name: "libc.so.6".into(),
            path: "/usr/lib/x86_64-linux-gnu/libc.so.6".into(),
            base_address: 0x7f00_0000_0000,
            size: 0x1000,
        };
        assert!(m.matches("libc.so.6"));
        assert!(m.matches("x86_64-linux-gnu/libc.so.6"));
        assert!(!m.matches("bc.so.6"));
        assert!(!m.matches(""));
        assert!(m.contains(0x7f00_0000_0fff));
        assert!(!m.contains(0x7f00_0000_1000));
    }

    #[test]
    fn origin_display() {
        let origin = HookOrigin::Resolved { module: "libfoo.so".into(), selector: Selector::Offset(0x20) };
        assert_eq!(origin.to_string(), "libfoo.so+0x20");
        let origin = HookOrigin::Resolved { module: "libfoo.so".into(), selector: Selector::Export("bar".into()) };
        assert_eq!(origin.to_string(), "libfoo.so!bar");
    }

    #[test]
    fn code_address_conversions() {
        let a = CodeAddress::new(0x1234);
        assert_eq!(u64::from(a), 0x1234);
        assert_eq!(CodeAddress::try_from(0x1234u64).unwrap(), a);
        assert_eq!(a.to_string(), "0x1234");
        assert!(CodeAddress::NULL.is_null());
    }
}
