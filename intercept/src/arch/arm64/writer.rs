use crate::arch::CodegenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X8 = 8,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16,
    X17 = 17,
    X18 = 18,
    X19 = 19,
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,
    X29 = 29,
    X30 = 30,
    SP = 31,
}

impl Reg {
    const ALL: [Reg; 32] = [
        Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7,
        Reg::X8, Reg::X9, Reg::X10, Reg::X11, Reg::X12, Reg::X13, Reg::X14, Reg::X15,
        Reg::X16, Reg::X17, Reg::X18, Reg::X19, Reg::X20, Reg::X21, Reg::X22, Reg::X23,
        Reg::X24, Reg::X25, Reg::X26, Reg::X27, Reg::X28, Reg::X29, Reg::X30, Reg::SP,
    ];

    /// Register named by a 5-bit instruction field.
    pub fn from_field(field: u32) -> Reg {
        Self::ALL[(field & 0x1F) as usize]
    }
}

/// Appends AArch64 instructions to a borrowed buffer.
///
/// Same contract as the x86_64 writer: out-of-room emission is counted but
/// not written, and `finish` reports it.
#[derive(Debug)]
pub struct Arm64Writer<'a> {
    buf: &'a mut [u8],
    len: usize,
    pc: u64,
}

impl<'a> Arm64Writer<'a> {
    pub fn new(buf: &'a mut [u8], pc: u64) -> Self {
        Self { buf, len: 0, pc }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        self.len
    }

    pub fn finish(self) -> Result<usize, CodegenError> {
        if self.len > self.buf.len() {
            Err(CodegenError::Overflow { needed: self.len, capacity: self.buf.len() })
        } else {
            Ok(self.len)
        }
    }

    fn emit(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        if end <= self.buf.len() {
            self.buf[self.len..end].copy_from_slice(bytes);
        }
        self.len = end;
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }

    pub fn put_u32(&mut self, insn: u32) {
        self.emit(&insn.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.emit(&value.to_le_bytes());
    }

    pub fn put_nop(&mut self) {
        self.put_u32(0xD503_201F);
    }

    pub fn put_ret(&mut self) {
        self.put_u32(0xD65F_03C0);
    }

    pub fn put_br_reg(&mut self, reg: Reg) {
        self.put_u32(0xD61F_0000 | ((reg as u32) << 5));
    }

    pub fn put_blr_reg(&mut self, reg: Reg) {
        self.put_u32(0xD63F_0000 | ((reg as u32) << 5));
    }

    /// `b target`. The caller checks the ±128 MiB range.
    pub fn put_b_imm(&mut self, target: u64) {
        let imm = (target as i64).wrapping_sub(self.pc as i64) >> 2;
        self.put_u32(0x1400_0000 | ((imm as u32) & 0x03FF_FFFF));
    }

    /// MOVZ/MOVK sequence loading a 64-bit constant (16 bytes).
    pub fn put_mov_reg_u64(&mut self, dst: Reg, value: u64) {
        let rd = dst as u32;
        for hw in 0..4u32 {
            let imm16 = ((value >> (hw * 16)) & 0xFFFF) as u32;
            let op = if hw == 0 { 0xD280_0000 } else { 0xF280_0000 };
            self.put_u32(op | (hw << 21) | (imm16 << 5) | rd);
        }
    }

    /// `ldr reg, #8; br reg; .quad target` (16 bytes, any distance).
    pub fn put_ldr_br_address(&mut self, reg: Reg, target: u64) {
        let br = 0xD61F_0000 | ((reg as u32) << 5);
        self.put_literal_sequence(reg, br, target);
    }

    /// `ldr reg, #8; b #12; .quad value`: loads an absolute constant and
    /// continues after the literal (16 bytes).
    pub fn put_ldr_reg_address(&mut self, reg: Reg, value: u64) {
        self.put_literal_sequence(reg, 0x1400_0003, value);
    }

    /// Literal load, one follow-up instruction and the 8-byte pool, written
    /// as a unit so a short buffer never holds a load without its literal.
    fn put_literal_sequence(&mut self, reg: Reg, follow: u32, literal: u64) {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&(0x5800_0000 | (2 << 5) | reg as u32).to_le_bytes());
        bytes[4..8].copy_from_slice(&follow.to_le_bytes());
        bytes[8..].copy_from_slice(&literal.to_le_bytes());
        self.emit(&bytes);
    }

    /// `ldr xt, [xn]`
    pub fn put_ldr_reg_base(&mut self, rt: Reg, rn: Reg) {
        self.put_u32(0xF940_0000 | ((rn as u32) << 5) | rt as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(f: impl FnOnce(&mut Arm64Writer)) -> Vec<u32> {
        let mut buf = [0u8; 64];
        let mut w = Arm64Writer::new(&mut buf, 0x1000);
        f(&mut w);
        let n = w.finish().unwrap();
        buf[..n].chunks(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn branch_forward_and_backward() {
        assert_eq!(words(|w| w.put_b_imm(0x1100)), [0x1400_0040]);
        assert_eq!(words(|w| w.put_b_imm(0x0FF0)), [0x17FF_FFFC]);
    }

    #[test]
    fn register_branches() {
        assert_eq!(words(|w| w.put_br_reg(Reg::X16)), [0xD61F_0200]);
        assert_eq!(words(|w| w.put_blr_reg(Reg::X16)), [0xD63F_0200]);
        assert_eq!(words(|w| w.put_ret()), [0xD65F_03C0]);
    }

    #[test]
    fn mov_u64_uses_movz_then_movk() {
        let w = words(|w| w.put_mov_reg_u64(Reg::X0, 42));
        assert_eq!(w, [0xD280_0540, 0xF2A0_0000, 0xF2C0_0000, 0xF2E0_0000]);
    }

    #[test]
    fn absolute_branch_layout() {
        let w = words(|w| w.put_ldr_br_address(Reg::X16, 0x1234_5678_9ABC_DEF0));
        assert_eq!(w[0], 0x5800_0050);
        assert_eq!(w[1], 0xD61F_0200);
        assert_eq!((w[3] as u64) << 32 | w[2] as u64, 0x1234_5678_9ABC_DEF0);
    }

    #[test]
    fn literal_load_skips_its_pool() {
        let w = words(|w| w.put_ldr_reg_address(Reg::X1, 7398));
        assert_eq!(w[0], 0x5800_0041);
        assert_eq!(w[1], 0x1400_0003);
        assert_eq!(w[2], 7398);
    }

    #[test]
    fn register_from_field() {
        assert_eq!(Reg::from_field(16), Reg::X16);
        assert_eq!(Reg::from_field(31), Reg::SP);
    }

    #[test]
    fn overflow_reported() {
        let mut buf = [0u8; 8];
        let mut w = Arm64Writer::new(&mut buf, 0);
        w.put_ldr_br_address(Reg::X16, 1);
        assert_eq!(w.finish(), Err(CodegenError::Overflow { needed: 16, capacity: 8 }));
        assert_eq!(buf, [0; 8]);
    }
}
