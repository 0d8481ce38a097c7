pub mod relocator;
pub mod writer;

/// `jmp rel32`.
pub const NEAR_JMP_SIZE: usize = 5;

/// `jmp [rip+2]; ud2; .quad target`.
pub const FAR_JMP_SIZE: usize = 16;

/// Reach of a rel32 displacement.
pub const NEAR_RANGE: u64 = 0x7FFF_FFFF;

/// `endbr64`, the CET landing pad compilers put at indirect-call targets.
pub const ENDBR64: [u8; 4] = [0xF3, 0x0F, 0x1E, 0xFA];

pub fn is_endbr64(code: &[u8]) -> bool {
    code.starts_with(&ENDBR64)
}
