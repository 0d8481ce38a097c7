//! AArch64 prologue relocator. Instructions are fixed-width, so only the
//! PC-relative forms need rewriting.

use crate::arch::arm64::writer::{Arm64Writer, Reg};
use crate::arch::CodegenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsnKind {
    Other,
    B,
    BL,
    BCond,
    CbzCbnz,
    TbzTbnz,
    Adr,
    Adrp,
    /// Literal loads; the payload is the `ldr [xN]` opcode that replaces them.
    LdrLiteral { base_load: u32, gpr: bool },
    Ret,
}

fn classify(insn: u32) -> InsnKind {
    match insn & 0xFC00_0000 {
        0x1400_0000 => return InsnKind::B,
        0x9400_0000 => return InsnKind::BL,
        _ => {}
    }
    if insn & 0xFF00_0010 == 0x5400_0000 {
        return InsnKind::BCond;
    }
    match insn & 0x7E00_0000 {
        0x3400_0000 => return InsnKind::CbzCbnz,
        0x3600_0000 => return InsnKind::TbzTbnz,
        _ => {}
    }
    match insn & 0x9F00_0000 {
        0x1000_0000 => return InsnKind::Adr,
        0x9000_0000 => return InsnKind::Adrp,
        _ => {}
    }
    if insn & 0xFFFF_FC1F == 0xD65F_0000 {
        return InsnKind::Ret;
    }
    match insn & 0xFF00_0000 {
        0x5800_0000 => InsnKind::LdrLiteral { base_load: 0xF940_0000, gpr: true }, // ldr x
        0x1800_0000 => InsnKind::LdrLiteral { base_load: 0xB940_0000, gpr: true }, // ldr w
        0x9800_0000 => InsnKind::LdrLiteral { base_load: 0xB980_0000, gpr: true }, // ldrsw
        0x1C00_0000 => InsnKind::LdrLiteral { base_load: 0xBD40_0000, gpr: false }, // ldr s
        0x5C00_0000 => InsnKind::LdrLiteral { base_load: 0xFD40_0000, gpr: false }, // ldr d
        0x9C00_0000 => InsnKind::LdrLiteral { base_load: 0x3DC0_0000, gpr: false }, // ldr q
        _ => InsnKind::Other,
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

fn imm26(insn: u32) -> i64 {
    sign_extend(insn & 0x03FF_FFFF, 26) << 2
}

fn imm19(insn: u32) -> i64 {
    sign_extend((insn >> 5) & 0x7FFFF, 19) << 2
}

fn imm14(insn: u32) -> i64 {
    sign_extend((insn >> 5) & 0x3FFF, 14) << 2
}

fn adr_imm(insn: u32) -> i64 {
    let immlo = (insn >> 29) & 0x3;
    let immhi = (insn >> 5) & 0x7FFFF;
    sign_extend((immhi << 2) | immlo, 21)
}

fn rt(insn: u32) -> Reg {
    Reg::from_field(insn)
}

/// Offset from the skipping branch to the end of a `ldr/br/.quad` stub.
const SKIP_STUB: u32 = 20 / 4;

/// Number of instructions (`count` at most) that can be moved, stopping after
/// the first call: code past a `bl`/`blr` runs after a return into the
/// trampoline and must stay where it is.
pub fn relocatable_count(code: &[u8], count: usize) -> usize {
    let mut n = 0;
    for word in code.chunks_exact(4).take(count) {
        let insn = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        n += 1;
        if classify(insn) == InsnKind::BL || insn & 0xFFFF_FC1F == 0xD63F_0000 {
            break;
        }
    }
    n
}

pub struct Arm64Relocator<'c> {
    code: &'c [u8],
    pc: u64,
}

impl<'c> Arm64Relocator<'c> {
    pub fn new(code: &'c [u8], pc: u64) -> Self {
        Self { code, pc }
    }

    fn insn(&self, index: usize) -> Option<u32> {
        let bytes = self.code.get(index * 4..index * 4 + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Relocates `count` instructions into `w`.
    ///
    /// Branches that target another relocated instruction are pointed at its
    /// new copy so they never land in the patched prologue.
    pub fn relocate(&self, w: &mut Arm64Writer, count: usize) -> Result<(), CodegenError> {
        let mut insns = [0u32; 8];
        if count > insns.len() {
            return Err(CodegenError::Truncated { offset: insns.len() * 4 });
        }
        for (i, slot) in insns.iter_mut().enumerate().take(count) {
            *slot = self.insn(i).ok_or(CodegenError::Truncated { offset: i * 4 })?;
            if classify(*slot) == InsnKind::Ret && i + 1 < count {
                return Err(CodegenError::Terminator { offset: i * 4 });
            }
        }
        let insns = &insns[..count];

        // First pass sizes each rewritten instruction so intra-block targets
        // can be mapped to their new addresses.
        let mut new_pcs = [0u64; 8];
        let mut nowhere = [0u8; 0];
        let mut sizing = Arm64Writer::new(&mut nowhere, w.pc());
        for (i, &insn) in insns.iter().enumerate() {
            new_pcs[i] = sizing.pc();
            self.rewrite(&mut sizing, i, insn, &|t| t);
        }

        let start = self.pc;
        let end = self.pc.wrapping_add(count as u64 * 4);
        let map = |target: u64| {
            if target >= start && target < end && (target - start) % 4 == 0 {
                new_pcs[((target - start) / 4) as usize]
            } else {
                target
            }
        };
        for (i, &insn) in insns.iter().enumerate() {
            self.rewrite(w, i, insn, &map);
        }
        Ok(())
    }

    fn rewrite(&self, w: &mut Arm64Writer, index: usize, insn: u32, map: &dyn Fn(u64) -> u64) {
        let pc = self.pc.wrapping_add(index as u64 * 4);
        let rel = |off: i64| pc.wrapping_add(off as u64);

        match classify(insn) {
            InsnKind::Other | InsnKind::Ret => w.put_u32(insn),
            InsnKind::Adr => w.put_ldr_reg_address(rt(insn), rel(adr_imm(insn))),
            InsnKind::Adrp => {
                let page = (pc & !0xFFF).wrapping_add((adr_imm(insn) << 12) as u64);
                w.put_ldr_reg_address(rt(insn), page);
            }
            InsnKind::LdrLiteral { base_load, gpr } => {
                // Load the literal's address into a scratch register, then
                // load through it. x17 when the destination itself is x16.
                let dst = insn & 0x1F;
                let scratch = if gpr && dst == 16 { Reg::X17 } else { Reg::X16 };
                w.put_ldr_reg_address(scratch, rel(imm19(insn)));
                w.put_u32(base_load | ((scratch as u32) << 5) | dst);
            }
            InsnKind::B => w.put_ldr_br_address(Reg::X16, map(rel(imm26(insn)))),
            InsnKind::BL => {
                w.put_mov_reg_u64(Reg::X16, map(rel(imm26(insn))));
                w.put_blr_reg(Reg::X16);
            }
            InsnKind::BCond => {
                let cond = insn & 0xF;
                if cond < 0xE {
                    w.put_u32(0x5400_0000 | (SKIP_STUB << 5) | (cond ^ 1));
                }
                w.put_ldr_br_address(Reg::X16, map(rel(imm19(insn))));
            }
            InsnKind::CbzCbnz => {
                let inverted = (insn ^ (1 << 24)) & !0x00FF_FFE0;
                w.put_u32(inverted | (SKIP_STUB << 5));
                w.put_ldr_br_address(Reg::X16, map(rel(imm19(insn))));
            }
            InsnKind::TbzTbnz => {
                let inverted = (insn ^ (1 << 24)) & !0x0007_FFE0;
                w.put_u32(inverted | (SKIP_STUB << 5));
                w.put_ldr_br_address(Reg::X16, map(rel(imm14(insn))));
            }
        }
    }
}
