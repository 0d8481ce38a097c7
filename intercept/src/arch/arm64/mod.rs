pub mod relocator;
pub mod writer;

/// `b imm26`.
pub const NEAR_B_SIZE: usize = 4;

/// `ldr x16, #8; br x16; .quad target`.
pub const FAR_JMP_SIZE: usize = 16;

/// Reach of `b imm26` (±128 MiB).
pub const B_RANGE: u64 = 0x07FF_FFFC;
