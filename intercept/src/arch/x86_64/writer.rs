use crate::arch::CodegenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    #[inline]
    fn lo3(self) -> u8 {
        (self as u8) & 7
    }

    #[inline]
    fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// Appends x86_64 machine code to a borrowed buffer.
///
/// `pc` is the address the first byte will execute at, which may differ from
/// where the buffer lives. Emitting past the end of the buffer does not write
/// anything; the writer keeps counting so `finish` can report how much room
/// the code needed.
#[derive(Debug)]
pub struct X86_64Writer<'a> {
    buf: &'a mut [u8],
    len: usize,
    pc: u64,
}

impl<'a> X86_64Writer<'a> {
    pub fn new(buf: &'a mut [u8], pc: u64) -> Self {
        Self { buf, len: 0, pc }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        self.len
    }

    /// Number of bytes emitted, or `Overflow` if they did not all fit.
    pub fn finish(self) -> Result<usize, CodegenError> {
        if self.len > self.buf.len() {
            Err(CodegenError::Overflow { needed: self.len, capacity: self.buf.len() })
        } else {
            Ok(self.len)
        }
    }

    /// Appends one whole instruction, or nothing if it does not fit.
    fn emit(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        if end <= self.buf.len() {
            self.buf[self.len..end].copy_from_slice(bytes);
        }
        self.len = end;
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }

    fn emit_insn(&mut self, insn: &Insn) {
        self.emit(insn.as_slice());
    }

    fn rel32_from(&self, insn_len: u64, target: u64) -> [u8; 4] {
        let rel = (target as i64).wrapping_sub(self.pc.wrapping_add(insn_len) as i64);
        (rel as i32).to_le_bytes()
    }

    pub fn put_push_reg(&mut self, reg: Reg) {
        self.emit_insn(Insn::new().rex_b(reg).push(&[0x50 + reg.lo3()]));
    }

    /// `push qword [base + disp]`
    pub fn put_push_mem(&mut self, base: Reg, disp: i32) {
        self.emit_insn(Insn::new().rex_b(base).push(&[0xFF]).base_disp32(6, base, disp));
    }

    /// `mov reg, imm64` (10 bytes)
    pub fn put_mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        self.emit_insn(
            Insn::new()
                .push(&[rex(true, false, reg.is_extended()), 0xB8 + reg.lo3()])
                .push(&imm.to_le_bytes()),
        );
    }

    pub fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(&[rex(true, src.is_extended(), dst.is_extended()), 0x89, modrm(0b11, src.lo3(), dst.lo3())]);
    }

    /// `mov dst, [base + disp]`
    pub fn put_mov_reg_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_insn(
            Insn::new()
                .push(&[rex(true, dst.is_extended(), base.is_extended()), 0x8B])
                .base_disp32(dst.lo3(), base, disp),
        );
    }

    /// `mov [base + disp], src`
    pub fn put_mov_mem_reg(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_insn(
            Insn::new()
                .push(&[rex(true, src.is_extended(), base.is_extended()), 0x89])
                .base_disp32(src.lo3(), base, disp),
        );
    }

    /// `lea dst, [base + disp]`. Leaves RFLAGS alone, unlike add/sub.
    pub fn put_lea_reg_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_insn(
            Insn::new()
                .push(&[rex(true, dst.is_extended(), base.is_extended()), 0x8D])
                .base_disp32(dst.lo3(), base, disp),
        );
    }

    /// `sub reg, imm32` (REX.W 81 /5)
    pub fn put_sub_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.put_alu_imm32(5, reg, imm);
    }

    /// `and reg, imm32` (REX.W 81 /4, sign-extended)
    pub fn put_and_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.put_alu_imm32(4, reg, imm);
    }

    fn put_alu_imm32(&mut self, op: u8, reg: Reg, imm: u32) {
        self.emit_insn(
            Insn::new()
                .push(&[rex(true, false, reg.is_extended()), 0x81, modrm(0b11, op, reg.lo3())])
                .push(&imm.to_le_bytes()),
        );
    }

    /// `jmp rel32` to an absolute target. The caller checks the range.
    pub fn put_jmp_near(&mut self, target: u64) {
        let rel = self.rel32_from(5, target);
        self.emit_insn(Insn::new().push(&[0xE9]).push(&rel));
    }

    /// `jmp [rip+2]; ud2; .quad target` (16 bytes, any distance).
    pub fn put_jmp_far(&mut self, target: u64) {
        self.emit_insn(
            Insn::new()
                .push(&[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0F, 0x0B])
                .push(&target.to_le_bytes()),
        );
    }

    /// Near jump when rel32 reaches, far jump otherwise.
    pub fn put_jmp_address(&mut self, target: u64) {
        if crate::arch::within(self.pc.wrapping_add(5), target, super::NEAR_RANGE) {
            self.put_jmp_near(target);
        } else {
            self.put_jmp_far(target);
        }
    }

    /// Short conditional jump with condition code `cc` over `skip` bytes.
    pub fn put_jcc_short(&mut self, cc: u8, skip: i8) {
        self.emit(&[0x70 | (cc & 0x0F), skip as u8]);
    }

    /// `call reg` ([REX.B] FF /2)
    pub fn put_call_reg(&mut self, reg: Reg) {
        self.emit_insn(Insn::new().rex_b(reg).push(&[0xFF, modrm(0b11, 2, reg.lo3())]));
    }

    pub fn put_ret(&mut self) {
        self.emit(&[0xC3]);
    }

    pub fn put_pushfq(&mut self) {
        self.emit(&[0x9C]);
    }

    pub fn put_popfq(&mut self) {
        self.emit(&[0x9D]);
    }

    pub fn put_cld(&mut self) {
        self.emit(&[0xFC]);
    }

    /// `fxsave [reg]`; the address must be 16-byte aligned at run time.
    pub fn put_fxsave_reg_indirect(&mut self, reg: Reg) {
        self.emit_insn(Insn::new().rex_b(reg).push(&[0x0F, 0xAE]).indirect(0, reg));
    }

    /// `fxrstor [reg]`
    pub fn put_fxrstor_reg_indirect(&mut self, reg: Reg) {
        self.emit_insn(Insn::new().rex_b(reg).push(&[0x0F, 0xAE]).indirect(1, reg));
    }

    /// `n` bytes of padding using the recommended multi-byte NOP forms.
    pub fn put_nop_n(&mut self, n: usize) {
        const NOPS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(NOPS.len());
            self.emit(NOPS[chunk - 1]);
            remaining -= chunk;
        }
    }

    /// Raw bytes, written as one unit.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.emit(bytes);
    }
}

/// REX prefix: 0100 W R X B
#[inline]
fn rex(w: bool, r: bool, b: bool) -> u8 {
    0x40 | ((w as u8) << 3) | ((r as u8) << 2) | (b as u8)
}

#[inline]
fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    ((mode & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Encoding of a single instruction, assembled before it reaches the buffer
/// so the writer's capacity check covers all of its bytes at once.
struct Insn {
    bytes: [u8; 16],
    len: usize,
}

impl Insn {
    fn new() -> Self {
        Self { bytes: [0; 16], len: 0 }
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn push(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self
    }

    fn rex_b(&mut self, reg: Reg) -> &mut Self {
        if reg.is_extended() {
            self.push(&[rex(false, false, true)]);
        }
        self
    }

    /// ModRM (+SIB) + disp32 for `[base + disp]`. Always mod=10 so that
    /// RBP/R13 never turn into RIP-relative forms.
    fn base_disp32(&mut self, reg_field: u8, base: Reg, disp: i32) -> &mut Self {
        if base.lo3() == 4 {
            self.push(&[modrm(0b10, reg_field, 0b100), 0x24]);
        } else {
            self.push(&[modrm(0b10, reg_field, base.lo3())]);
        }
        self.push(&disp.to_le_bytes())
    }

    /// Register-indirect `[reg]` with no displacement (used by fxsave/fxrstor).
    fn indirect(&mut self, reg_field: u8, base: Reg) -> &mut Self {
        match base.lo3() {
            4 => self.push(&[modrm(0b00, reg_field, 0b100), 0x24]),
            // mod=00 rm=101 would mean [rip+disp32]
            5 => self.push(&[modrm(0b01, reg_field, 0b101), 0x00]),
            lo => self.push(&[modrm(0b00, reg_field, lo)]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_at(pc: u64, f: impl FnOnce(&mut X86_64Writer)) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let mut w = X86_64Writer::new(&mut buf, pc);
        f(&mut w);
        let n = w.finish().unwrap();
        buf[..n].to_vec()
    }

    fn encode(f: impl FnOnce(&mut X86_64Writer)) -> Vec<u8> {
        encode_at(0x1000, f)
    }

    #[test]
    fn push_reg_uses_rex_for_extended() {
        assert_eq!(encode(|w| w.put_push_reg(Reg::RAX)), &[0x50]);
        assert_eq!(encode(|w| w.put_push_reg(Reg::R11)), &[0x41, 0x53]);
    }

    #[test]
    fn mov_r11_imm64() {
        let bytes = encode(|w| w.put_mov_reg_imm64(Reg::R11, 0xDEAD_BEEF_CAFE_BABE));
        assert_eq!(&bytes[..2], &[0x49, 0xBB]);
        assert_eq!(u64::from_le_bytes(bytes[2..10].try_into().unwrap()), 0xDEAD_BEEF_CAFE_BABE);
    }

    #[test]
    fn memory_operands_with_rsp_base_need_sib() {
        // mov [rsp+0x10], rax
        assert_eq!(
            encode(|w| w.put_mov_mem_reg(Reg::RSP, 0x10, Reg::RAX)),
            &[0x48, 0x89, 0x84, 0x24, 0x10, 0x00, 0x00, 0x00]
        );
        // mov r11, [r12+0x10]
        assert_eq!(
            encode(|w| w.put_mov_reg_mem(Reg::R11, Reg::R12, 0x10)),
            &[0x4D, 0x8B, 0x9C, 0x24, 0x10, 0x00, 0x00, 0x00]
        );
        // push qword [rsp+0x50]
        assert_eq!(
            encode(|w| w.put_push_mem(Reg::RSP, 0x50)),
            &[0xFF, 0xB4, 0x24, 0x50, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn lea_with_negative_displacement() {
        // lea rsp, [rsp-0x80]
        assert_eq!(
            encode(|w| w.put_lea_reg_mem(Reg::RSP, Reg::RSP, -0x80)),
            &[0x48, 0x8D, 0xA4, 0x24, 0x80, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn arithmetic_immediates() {
        assert_eq!(
            encode(|w| w.put_sub_reg_imm32(Reg::RSP, 0x100)),
            &[0x48, 0x81, 0xEC, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            encode(|w| w.put_and_reg_imm32(Reg::R11, 0xFFFF_FFF0)),
            &[0x49, 0x81, 0xE3, 0xF0, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn near_jump_is_relative_to_next_instruction() {
        let bytes = encode_at(0x1000, |w| w.put_jmp_near(0x1100));
        assert_eq!(bytes[0], 0xE9);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 0xFB);

        let bytes = encode_at(0x2000, |w| w.put_jmp_near(0x1000));
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), -0x1005);
    }

    #[test]
    fn far_jump_layout() {
        let bytes = encode(|w| w.put_jmp_far(0x7FFF_0000_1234));
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], &[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0F, 0x0B]);
        assert_eq!(u64::from_le_bytes(bytes[8..].try_into().unwrap()), 0x7FFF_0000_1234);
    }

    #[test]
    fn jmp_address_picks_encoding_by_distance() {
        assert_eq!(encode_at(0x1000, |w| w.put_jmp_address(0x2000)).len(), 5);
        assert_eq!(encode_at(0x1000, |w| w.put_jmp_address(0x1_0000_0000)).len(), 16);
    }

    #[test]
    fn call_r11() {
        assert_eq!(encode(|w| w.put_call_reg(Reg::R11)), &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn fxsave_and_fxrstor_addressing() {
        assert_eq!(encode(|w| w.put_fxsave_reg_indirect(Reg::R11)), &[0x41, 0x0F, 0xAE, 0x03]);
        assert_eq!(encode(|w| w.put_fxrstor_reg_indirect(Reg::R11)), &[0x41, 0x0F, 0xAE, 0x0B]);
        assert_eq!(encode(|w| w.put_fxsave_reg_indirect(Reg::RSP)), &[0x0F, 0xAE, 0x04, 0x24]);
        assert_eq!(encode(|w| w.put_fxsave_reg_indirect(Reg::RBP)), &[0x0F, 0xAE, 0x45, 0x00]);
    }

    #[test]
    fn nop_padding_lengths() {
        for n in 0..=20 {
            assert_eq!(encode(|w| w.put_nop_n(n)).len(), n);
        }
        assert_eq!(encode(|w| w.put_nop_n(11)), &[0x66, 0x0F, 0x1F, 0x84, 0, 0, 0, 0, 0, 0x66, 0x90]);
    }

    #[test]
    fn overflow_is_reported_not_written() {
        let mut buf = [0u8; 4];
        let mut w = X86_64Writer::new(&mut buf, 0x1000);
        w.put_jmp_near(0x2000);
        assert_eq!(w.pc(), 0x1005);
        assert_eq!(w.finish(), Err(CodegenError::Overflow { needed: 5, capacity: 4 }));
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn instructions_that_do_not_fit_leave_the_tail_untouched() {
        let mut buf = [0xCCu8; 12];
        let mut w = X86_64Writer::new(&mut buf, 0x1000);
        w.put_push_reg(Reg::R11);
        w.put_jmp_far(0xDEAD_0000);
        w.put_mov_mem_reg(Reg::RSP, 0x10, Reg::RAX);
        assert_eq!(w.finish(), Err(CodegenError::Overflow { needed: 2 + 16 + 8, capacity: 12 }));
        assert_eq!(&buf[..2], &[0x41, 0x53]);
        assert!(buf[2..].iter().all(|&b| b == 0xCC));
    }
}
