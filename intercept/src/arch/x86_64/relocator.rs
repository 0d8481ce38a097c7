//! Minimal x86_64 length decoder and prologue relocator.
//!
//! Covers what compilers emit at function entry: legacy prefixes, REX,
//! one- and two-byte opcodes, ModRM/SIB/displacement, immediates, and the
//! control-flow forms that need rewriting when moved.

use crate::arch::x86_64::writer::{Reg, X86_64Writer};
use crate::arch::x86_64::FAR_JMP_SIZE;
use crate::arch::CodegenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsnKind {
    Normal,
    /// ModRM with mod=00 rm=101.
    RipRelative { disp_at: usize },
    Jmp { rel: i64 },
    Jcc { cc: u8, rel: i64 },
    Call { rel: i64 },
    /// ret, int3, ud2, hlt
    Terminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Insn {
    len: usize,
    kind: InsnKind,
}

/// Bounds-checked reads over the captured bytes.
struct Cursor<'c> {
    code: &'c [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.code.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn peek(&self) -> Option<u8> {
        self.code.get(self.pos).copied()
    }

    fn i8(&mut self) -> Option<i64> {
        self.u8().map(|b| b as i8 as i64)
    }

    fn i32(&mut self) -> Option<i64> {
        let bytes = self.code.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.code.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    /// Consumes ModRM, SIB and displacement. Returns the ModRM byte and, for
    /// RIP-relative operands, the offset of the disp32.
    fn modrm(&mut self) -> Option<(u8, Option<usize>)> {
        let modrm = self.u8()?;
        let mode = modrm >> 6;
        let rm = modrm & 7;
        if mode == 3 {
            return Some((modrm, None));
        }
        if mode == 0 && rm == 5 {
            let at = self.pos;
            self.skip(4)?;
            return Some((modrm, Some(at)));
        }
        if rm == 4 {
            let sib = self.u8()?;
            if mode == 0 && sib & 7 == 5 {
                self.skip(4)?;
            }
        }
        match mode {
            1 => self.skip(1)?,
            2 => self.skip(4)?,
            _ => {}
        }
        Some((modrm, None))
    }
}

fn one_byte_has_modrm(opcode: u8) -> bool {
    matches!(
        opcode,
        0x00..=0x03
            | 0x08..=0x0B
            | 0x10..=0x13
            | 0x18..=0x1B
            | 0x20..=0x23
            | 0x28..=0x2B
            | 0x30..=0x33
            | 0x38..=0x3B
            | 0x62..=0x63
            | 0x69
            | 0x6B
            | 0x80..=0x8F
            | 0xC0..=0xC1
            | 0xC4..=0xC7
            | 0xD0..=0xD3
            | 0xD8..=0xDF
            | 0xF6..=0xF7
            | 0xFE..=0xFF
    )
}

fn one_byte_imm_size(opcode: u8, opsize16: bool, rex_w: bool) -> usize {
    let imm_z = if opsize16 { 2 } else { 4 };
    match opcode {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => imm_z,
        0x68 | 0x69 | 0x81 | 0xA9 | 0xC7 => imm_z,
        0x6A | 0x6B | 0x80 | 0x82 | 0x83 | 0xA8 | 0xC0 | 0xC1 | 0xC6 | 0xCD => 1,
        0xB0..=0xB7 | 0xE4..=0xE7 => 1,
        0xB8..=0xBF if rex_w => 8,
        0xB8..=0xBF => imm_z,
        0xA0..=0xA3 => 8,
        0xC8 => 3,
        _ => 0,
    }
}

fn two_byte_has_modrm(opcode: u8) -> bool {
    !matches!(
        opcode,
        0x05..=0x09 | 0x0B | 0x0E | 0x30..=0x37 | 0x77 | 0x80..=0x8F | 0xA0..=0xA1 | 0xA8..=0xA9 | 0xC8..=0xCF
    )
}

fn two_byte_imm_size(opcode: u8) -> usize {
    match opcode {
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => 1,
        _ => 0,
    }
}

fn decode(code: &[u8]) -> Option<Insn> {
    let mut c = Cursor { code, pos: 0 };

    let mut opsize16 = false;
    while let Some(b) = c.peek() {
        match b {
            0x66 => opsize16 = true,
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x67 | 0xF0 | 0xF2 | 0xF3 => {}
            _ => break,
        }
        c.pos += 1;
    }

    let mut rex_w = false;
    if c.peek()? & 0xF0 == 0x40 {
        rex_w = c.u8()? & 0x08 != 0;
    }

    let opcode = c.u8()?;
    let kind = match opcode {
        0xC3 => InsnKind::Terminator,
        0xC2 => {
            c.skip(2)?;
            InsnKind::Terminator
        }
        0xCC | 0xF4 => InsnKind::Terminator,
        0xEB => InsnKind::Jmp { rel: c.i8()? },
        0xE9 => InsnKind::Jmp { rel: c.i32()? },
        0xE8 => InsnKind::Call { rel: c.i32()? },
        0x70..=0x7F => InsnKind::Jcc { cc: opcode & 0x0F, rel: c.i8()? },
        0x0F => {
            let op2 = c.u8()?;
            match op2 {
                0x0B => InsnKind::Terminator,
                0x80..=0x8F => InsnKind::Jcc { cc: op2 & 0x0F, rel: c.i32()? },
                0x38 | 0x3A => {
                    c.u8()?;
                    let (_, rip) = c.modrm()?;
                    if op2 == 0x3A {
                        c.skip(1)?;
                    }
                    rip.map_or(InsnKind::Normal, |disp_at| InsnKind::RipRelative { disp_at })
                }
                _ => {
                    let mut rip = None;
                    if two_byte_has_modrm(op2) {
                        rip = c.modrm()?.1;
                    }
                    c.skip(two_byte_imm_size(op2))?;
                    rip.map_or(InsnKind::Normal, |disp_at| InsnKind::RipRelative { disp_at })
                }
            }
        }
        _ if one_byte_has_modrm(opcode) => {
            let (modrm, rip) = c.modrm()?;
            let imm = if matches!(opcode, 0xF6 | 0xF7) {
                // Only the TEST forms (/0, /1) carry an immediate.
                match ((modrm >> 3) & 7, opcode) {
                    (0 | 1, 0xF6) => 1,
                    (0 | 1, _) if opsize16 => 2,
                    (0 | 1, _) => 4,
                    _ => 0,
                }
            } else {
                one_byte_imm_size(opcode, opsize16, rex_w)
            };
            c.skip(imm)?;
            rip.map_or(InsnKind::Normal, |disp_at| InsnKind::RipRelative { disp_at })
        }
        _ => {
            c.skip(one_byte_imm_size(opcode, opsize16, rex_w))?;
            InsnKind::Normal
        }
    };

    // Architectural limit; longer means we misread a prefix run.
    if c.pos > 15 {
        return None;
    }
    Some(Insn { len: c.pos, kind })
}

/// Length of the whole instructions covering at least `min_bytes` of `code`.
pub fn measure(code: &[u8], min_bytes: usize) -> Result<usize, CodegenError> {
    let mut offset = 0;
    while offset < min_bytes {
        let insn = decode(&code[offset..]).ok_or(CodegenError::Truncated { offset })?;
        if insn.kind == InsnKind::Terminator {
            return Err(CodegenError::Terminator { offset });
        }
        offset += insn.len;
    }
    Ok(offset)
}

/// Re-emits instructions captured from `pc` so they behave the same at the
/// writer's location.
pub struct X86_64Relocator<'c> {
    code: &'c [u8],
    pc: u64,
}

impl<'c> X86_64Relocator<'c> {
    pub fn new(code: &'c [u8], pc: u64) -> Self {
        Self { code, pc }
    }

    /// Relocates whole instructions until at least `min_bytes` of input are
    /// consumed. Returns the number of input bytes consumed.
    pub fn relocate(&self, w: &mut X86_64Writer, min_bytes: usize) -> Result<usize, CodegenError> {
        let mut offset = 0;
        while offset < min_bytes {
            let insn = decode(&self.code[offset..]).ok_or(CodegenError::Truncated { offset })?;
            let src = &self.code[offset..offset + insn.len];
            let next_pc = self.pc.wrapping_add((offset + insn.len) as u64);
            let target = |rel: i64| next_pc.wrapping_add(rel as u64);

            match insn.kind {
                InsnKind::Terminator => return Err(CodegenError::Terminator { offset }),
                InsnKind::Normal => w.put_bytes(src),
                InsnKind::RipRelative { disp_at } => {
                    let old = i32::from_le_bytes([src[disp_at], src[disp_at + 1], src[disp_at + 2], src[disp_at + 3]]);
                    let absolute = target(old as i64);
                    let new = (absolute as i64).wrapping_sub(w.pc().wrapping_add(insn.len as u64) as i64);
                    let new = i32::try_from(new).map_err(|_| CodegenError::OutOfRange { offset })?;
                    let mut fixed = [0u8; 16];
                    fixed[..insn.len].copy_from_slice(src);
                    fixed[disp_at..disp_at + 4].copy_from_slice(&new.to_le_bytes());
                    w.put_bytes(&fixed[..insn.len]);
                }
                InsnKind::Jmp { rel } => w.put_jmp_address(target(rel)),
                InsnKind::Jcc { cc, rel } => {
                    // Inverted short jump over an absolute jump to the original target.
                    w.put_jcc_short(cc ^ 1, FAR_JMP_SIZE as i8);
                    w.put_jmp_far(target(rel));
                }
                InsnKind::Call { rel: 0 } => {
                    // call $+0 only pushes its own return address.
                    w.put_mov_reg_imm64(Reg::R11, next_pc);
                    w.put_push_reg(Reg::R11);
                }
                InsnKind::Call { rel } => {
                    w.put_mov_reg_imm64(Reg::R11, target(rel));
                    w.put_call_reg(Reg::R11);
                }
            }
            offset += insn.len;
        }
        Ok(offset)
    }
}
