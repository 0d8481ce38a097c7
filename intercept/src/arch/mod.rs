//! Instruction encoders and prologue relocators, one submodule per architecture.
//!
//! Everything here works on byte slices and plain `u64` program counters. The
//! callers decide where the bytes end up.

#[cfg(any(target_arch = "x86_64", test))]
pub mod x86_64;

#[cfg(any(target_arch = "aarch64", test))]
pub mod arm64;

/// Why code generation or relocation could not produce usable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodegenError {
    /// The output buffer was too small for the emitted code.
    Overflow { needed: usize, capacity: usize },
    /// The captured input ended in the middle of an instruction.
    Truncated { offset: usize },
    /// A return or trap was found before enough bytes were covered.
    Terminator { offset: usize },
    /// A PC-relative operand cannot reach its target from the new location.
    OutOfRange { offset: usize },
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodegenError::Overflow { needed, capacity } => {
                write!(f, "code needs {needed} bytes, buffer holds {capacity}")
            }
            CodegenError::Truncated { offset } => write!(f, "instruction at +{offset} runs past captured bytes"),
            CodegenError::Terminator { offset } => write!(f, "function ends at +{offset}"),
            CodegenError::OutOfRange { offset } => write!(f, "operand at +{offset} out of range after relocation"),
        }
    }
}

/// Whether `to` is reachable from `from` with a signed displacement of at most `range` bytes.
#[inline]
pub(crate) fn within(from: u64, to: u64, range: u64) -> bool {
    (to as i64).wrapping_sub(from as i64).unsigned_abs() <= range
}
