use crate::arch::arm64::relocator::{relocatable_count, Arm64Relocator};
use crate::arch::arm64::writer::{Arm64Writer, Reg};
use crate::arch::arm64::{B_RANGE, FAR_JMP_SIZE, NEAR_B_SIZE};
use crate::arch::{within, CodegenError};
use crate::code::allocator::CodeAllocator;
use crate::code::patcher::MAX_PATCH;
use crate::error::PatchFault;
use crate::platform::PlatformPatcher;

use super::installer::{relocation_fault, Captured, Plan};

/// Relocated prologue (at most four instructions, each growing to a few
/// words), the jump back and a relay stub.
const BLOCK_SIZE: usize = 256;

/// Plans a Replace-mode patch: a single `b` when the replacement or the
/// block is within ±128 MiB, `ldr x16, #8; br x16; .quad` otherwise.
pub(crate) fn plan<'p, P: PlatformPatcher>(
    alloc: &CodeAllocator<'p, P>,
    captured: &Captured,
    replacement: usize,
    keep_original: bool,
) -> Result<Plan<'p, P>, PatchFault> {
    let patch_pc = captured.patch_address as u64;
    let replacement = replacement as u64;
    let repl_is_near = within(patch_pc, replacement, B_RANGE);

    let mut block = if keep_original || !repl_is_near {
        Some(alloc.alloc_near(captured.patch_address, B_RANGE, BLOCK_SIZE)?)
    } else {
        None
    };
    let page_is_near = block.as_ref().is_some_and(|b| b.is_near(captured.patch_address, B_RANGE));
    let len = if repl_is_near || page_is_near { NEAR_B_SIZE } else { FAR_JMP_SIZE };
    let count = len / 4;

    // A call inside the displaced instructions would return into the
    // middle of the redirect.
    let movable = relocatable_count(captured.code(), count);
    if movable < count {
        return Err(relocation_fault(captured.target, CodegenError::Terminator { offset: movable * 4 }));
    }

    let mut trampoline = None;
    let mut redirect_target = replacement;
    let mut used = 0;
    if let Some(block) = block.as_mut() {
        let base = block.address() as u64;
        let mut w = Arm64Writer::new(block.bytes_mut(), base);
        if keep_original {
            trampoline = Some(base as usize);
            Arm64Relocator::new(captured.code(), patch_pc)
                .relocate(&mut w, count)
                .map_err(|e| relocation_fault(captured.target, e))?;
            w.put_ldr_br_address(Reg::X16, patch_pc + len as u64);
        }
        if !repl_is_near && page_is_near {
            redirect_target = w.pc();
            w.put_ldr_br_address(Reg::X16, replacement);
        }
        used = w.finish().map_err(|e| relocation_fault(captured.target, e))?;
    }

    let block = match block {
        Some(block) if used > 0 => {
            block.seal()?;
            Some(block)
        }
        _ => None,
    };

    let mut redirect = [0u8; MAX_PATCH];
    let mut w = Arm64Writer::new(&mut redirect, patch_pc);
    if len == NEAR_B_SIZE {
        w.put_b_imm(redirect_target);
    } else {
        w.put_ldr_br_address(Reg::X16, redirect_target);
    }
    w.finish().map_err(|e| relocation_fault(captured.target, e))?;

    Ok(Plan { len, redirect, block, trampoline })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{FakePatcher, SAMPLE_RETURNS_42};

    fn captured(p: &FakePatcher, code: &[u8]) -> Captured {
        let target = p.map_code(code);
        Captured::from_bytes(target, &p.peek(target, MAX_PATCH))
    }

    fn b_target(redirect: &[u8], pc: usize) -> usize {
        let insn = u32::from_le_bytes(redirect[..4].try_into().unwrap());
        assert_eq!(insn >> 26, 0b000101);
        let imm = ((insn & 0x03FF_FFFF) << 6) as i32 >> 6;
        (pc as i64 + imm as i64 * 4) as usize
    }

    #[test]
    fn near_replacement_is_one_branch() {
        let p = FakePatcher::new();
        let c = captured(&p, SAMPLE_RETURNS_42);
        let alloc = CodeAllocator::new(&p, true);
        let replacement = c.target + 0x400;

        let plan = plan(&alloc, &c, replacement, true).unwrap();
        assert_eq!(plan.len, 4);
        assert_eq!(b_target(&plan.redirect, c.target), replacement);
        let tramp = plan.trampoline.unwrap();
        assert_eq!(p.peek(tramp, 4), &SAMPLE_RETURNS_42[..4]);
    }

    #[test]
    fn far_replacement_uses_relay() {
        let p = FakePatcher::new();
        let c = captured(&p, SAMPLE_RETURNS_42);
        let alloc = CodeAllocator::new(&p, true);
        let far = 0x1000_0000_0000usize;

        let plan = plan(&alloc, &c, far, false).unwrap();
        assert!(plan.trampoline.is_none());
        let relay = b_target(&plan.redirect, c.target);
        let stub = p.peek(relay, 16);
        assert_eq!(u64::from_le_bytes(stub[8..16].try_into().unwrap()), far as u64);
    }
}
