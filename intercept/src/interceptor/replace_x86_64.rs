use crate::arch::x86_64::relocator::{measure, X86_64Relocator};
use crate::arch::x86_64::writer::X86_64Writer;
use crate::arch::x86_64::{FAR_JMP_SIZE, NEAR_JMP_SIZE, NEAR_RANGE};
use crate::arch::within;
use crate::code::allocator::CodeAllocator;
use crate::code::patcher::MAX_PATCH;
use crate::error::PatchFault;
use crate::platform::PlatformPatcher;

use super::installer::{relocation_fault, Captured, Plan};

/// Room for a relocated prologue (worst case every instruction expands to a
/// far jump), the jump back and a relay stub.
const BLOCK_SIZE: usize = 256;

/// Plans a Replace-mode patch.
///
/// The redirect is a 5-byte `jmp rel32` when either the replacement or the
/// allocated block is within ±2 GiB, and a 16-byte absolute jump otherwise.
/// A far replacement reached from a near block goes through a relay stub
/// placed after the trampoline.
pub(crate) fn plan<'p, P: PlatformPatcher>(
    alloc: &CodeAllocator<'p, P>,
    captured: &Captured,
    replacement: usize,
    keep_original: bool,
) -> Result<Plan<'p, P>, PatchFault> {
    let patch_pc = captured.patch_address as u64;
    let replacement = replacement as u64;
    let repl_is_near = within(patch_pc + NEAR_JMP_SIZE as u64, replacement, NEAR_RANGE);

    let mut block = if keep_original || !repl_is_near {
        Some(alloc.alloc_near(captured.patch_address, NEAR_RANGE, BLOCK_SIZE)?)
    } else {
        None
    };
    let page_is_near = block.as_ref().is_some_and(|b| b.is_near(captured.patch_address, NEAR_RANGE));
    let redirect_size = if repl_is_near || page_is_near { NEAR_JMP_SIZE } else { FAR_JMP_SIZE };

    let len = measure(captured.code(), redirect_size).map_err(|e| relocation_fault(captured.target, e))?;
    if len > MAX_PATCH {
        return Err(relocation_fault(
            captured.target,
            crate::arch::CodegenError::Overflow { needed: len, capacity: MAX_PATCH },
        ));
    }

    let mut trampoline = None;
    let mut redirect_target = replacement;
    let mut used = 0;
    if let Some(block) = block.as_mut() {
        let base = block.address() as u64;
        let mut w = X86_64Writer::new(block.bytes_mut(), base);
        if keep_original {
            trampoline = Some(base as usize);
            X86_64Relocator::new(captured.code(), patch_pc)
                .relocate(&mut w, len)
                .map_err(|e| relocation_fault(captured.target, e))?;
            w.put_jmp_address(patch_pc + len as u64);
        }
        if !repl_is_near && page_is_near {
            redirect_target = w.pc();
            w.put_jmp_far(replacement);
        }
        used = w.finish().map_err(|e| relocation_fault(captured.target, e))?;
    }

    let block = match block {
        Some(block) if used > 0 => {
            block.seal()?;
            Some(block)
        }
        // Nothing ended up in the block; dropping frees it.
        _ => None,
    };

    let mut redirect = [0u8; MAX_PATCH];
    let mut w = X86_64Writer::new(&mut redirect, patch_pc);
    if redirect_size == NEAR_JMP_SIZE {
        w.put_jmp_near(redirect_target);
    } else {
        w.put_jmp_far(redirect_target);
    }
    w.put_nop_n(len - redirect_size);
    w.finish().map_err(|e| relocation_fault(captured.target, e))?;

    Ok(Plan { len, redirect, block, trampoline, attach: None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{FakePatcher, SAMPLE_RETURNS_42};

    const FAR: usize = 0x1000_0000_0000;

    fn captured(p: &FakePatcher, code: &[u8]) -> Captured {
        let target = p.map_code(code);
        Captured::from_bytes(target, &p.peek(target, MAX_PATCH))
    }

    fn rel32_target(redirect: &[u8], pc: usize) -> usize {
        let rel = i32::from_le_bytes([redirect[1], redirect[2], redirect[3], redirect[4]]);
        (pc as i64 + 5 + rel as i64) as usize
    }

    #[test]
    fn near_replacement_gets_short_jump_and_trampoline() {
        let p = FakePatcher::new();
        let c = captured(&p, SAMPLE_RETURNS_42);
        let alloc = CodeAllocator::new(&p, true);
        let replacement = c.target + 0x200;

        let plan = plan(&alloc, &c, replacement, true).unwrap();
        // push rbp (1) + mov rbp, rsp (3) + mov eax, 42 (5) covers 5 bytes.
        assert_eq!(plan.len, 9);
        assert_eq!(plan.redirect[0], 0xE9);
        assert_eq!(rel32_target(&plan.redirect, c.target), replacement);
        assert_eq!(&plan.redirect[5..9], &[0x0F, 0x1F, 0x40, 0x00]);

        let tramp = plan.trampoline.unwrap();
        assert_eq!(p.peek(tramp, 9), &SAMPLE_RETURNS_42[..9]);
        let back = p.peek(tramp + 9, 5);
        assert_eq!(back[0], 0xE9);
        assert_eq!(rel32_target(&back, tramp + 9), c.target + 9);
    }

    #[test]
    fn far_replacement_goes_through_relay() {
        let p = FakePatcher::new();
        let c = captured(&p, SAMPLE_RETURNS_42);
        let alloc = CodeAllocator::new(&p, true);

        let plan = plan(&alloc, &c, FAR, true).unwrap();
        assert_eq!(plan.len, 9);
        let relay = rel32_target(&plan.redirect, c.target);
        let block = plan.block.as_ref().unwrap().address();
        assert!(relay > block);
        let stub = p.peek(relay, 16);
        assert_eq!(&stub[..2], &[0xFF, 0x25]);
        assert_eq!(u64::from_le_bytes(stub[8..16].try_into().unwrap()), FAR as u64);
    }

    #[test]
    fn near_replacement_without_original_needs_no_code() {
        let p = FakePatcher::new();
        let c = captured(&p, SAMPLE_RETURNS_42);
        let alloc = CodeAllocator::new(&p, true);

        let plan = plan(&alloc, &c, c.target + 0x200, false).unwrap();
        assert!(plan.block.is_none());
        assert!(plan.trampoline.is_none());
        assert_eq!(p.live_blocks(), 0);
    }

    #[test]
    fn early_return_cannot_be_relocated() {
        let p = FakePatcher::new();
        // xor eax, eax; ret
        let c = captured(&p, &[0x31, 0xC0, 0xC3, 0xCC, 0xCC, 0xCC]);
        let alloc = CodeAllocator::new(&p, true);

        let err = plan(&alloc, &c, c.target + 0x200, true).unwrap_err();
        assert_eq!(err, PatchFault::Relocation);
        assert_eq!(p.live_blocks(), 0);
    }

    #[test]
    fn rip_relative_prologue_is_fixed_up() {
        let p = FakePatcher::new();
        // lea rax, [rip+0x100]; ret
        let c = captured(&p, &[0x48, 0x8D, 0x05, 0x00, 0x01, 0x00, 0x00, 0xC3]);
        let alloc = CodeAllocator::new(&p, true);

        let plan = plan(&alloc, &c, c.target + 0x200, true).unwrap();
        assert_eq!(plan.len, 7);
        let tramp = plan.trampoline.unwrap();
        let copied = p.peek(tramp, 7);
        let disp = i32::from_le_bytes(copied[3..7].try_into().unwrap());
        assert_eq!((tramp as i64 + 7 + disp as i64) as usize, c.target + 7 + 0x100);
    }
}
