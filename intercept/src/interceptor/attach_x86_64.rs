//! Attach-mode wrapper generation (System V AMD64).
//!
//! One code block holds the relocated prologue followed by the wrapper the
//! redirect jumps to. The wrapper builds a stack frame with this layout:
//!
//! ```text
//! rsp + 0               saved registers (SAVED_AREA_SIZE)
//! rsp + SAVED_AREA_SIZE CpuContext handed to listeners
//! ...                   InvocationContext, Frame
//! ...                   fxsave area (512 bytes, aligned at run time)
//! rsp + frame           rflags from pushfq
//! rsp + frame + 8       128-byte red zone of the interrupted function
//! rsp + frame + 136     caller's return address
//! ```
//!
//! Only register arguments reach the original unchanged: it runs below the
//! wrapper frame, so arguments passed on the stack are not where it expects.

use crate::arch::x86_64::relocator::{measure, X86_64Relocator};
use crate::arch::x86_64::writer::{Reg, X86_64Writer};
use crate::arch::x86_64::{FAR_JMP_SIZE, NEAR_JMP_SIZE, NEAR_RANGE};
use crate::code::allocator::CodeAllocator;
use crate::code::patcher::MAX_PATCH;
use crate::error::PatchFault;
use crate::platform::PlatformPatcher;
use crate::types::{CodeAddress, CpuContext, InvocationContext};

use super::installer::{relocation_fault, Captured, Plan};
use super::listener::CallListener;

const RDI: usize = 0;
const RSI: usize = 8;
const RDX: usize = 16;
const RCX: usize = 24;
const R8: usize = 32;
const R9: usize = 40;
const RAX: usize = 48;
const RETURN_ADDRESS: usize = 56;
const ENTRY_SP: usize = 64;
const RETURN_VALUE: usize = 72;
const RBP: usize = 80;
const RFLAGS: usize = 88;
const R10: usize = 96;
const R11: usize = 104;
const RBX: usize = 112;
const R12: usize = 120;
const R13: usize = 128;
const R14: usize = 136;
const R15: usize = 144;
const SAVED_AREA_SIZE: usize = 152;

const RED_ZONE: i32 = 128;

/// Trampoline plus wrapper, with room to spare.
const BLOCK_SIZE: usize = 1024;

/// Per-hook state the wrapper passes to the enter/leave thunks.
#[derive(Debug)]
pub(crate) struct AttachContext {
    function: CodeAddress,
    listener: CallListener,
}

/// Pointers the wrapper builds on its stack for the thunks.
#[repr(C)]
struct Frame {
    saved: *mut u64,
    cpu: *mut CpuContext,
}

unsafe fn slot(frame: &Frame, offset: usize) -> *mut u64 {
    frame.saved.add(offset / 8)
}

unsafe extern "C" fn enter_thunk(context: *const AttachContext, invocation: *mut InvocationContext, frame: *mut Frame) {
    let context = &*context;
    let frame = &*frame;
    let load = |offset| *slot(frame, offset);

    frame.cpu.write(CpuContext {
        rip: context.function.as_u64(),
        rsp: load(ENTRY_SP),
        rflags: load(RFLAGS),
        rax: load(RAX),
        rbx: load(RBX),
        rcx: load(RCX),
        rdx: load(RDX),
        rsi: load(RSI),
        rdi: load(RDI),
        rbp: load(RBP),
        r8: load(R8),
        r9: load(R9),
        r10: load(R10),
        r11: load(R11),
        r12: load(R12),
        r13: load(R13),
        r14: load(R14),
        r15: load(R15),
    });
    invocation.write(InvocationContext { function: context.function, cpu_context: frame.cpu });

    if let Some(on_enter) = context.listener.on_enter {
        on_enter(invocation, context.listener.user_data);
    }

    // Listeners may have rewritten arguments.
    let cpu = &*frame.cpu;
    for (offset, value) in [(RDI, cpu.rdi), (RSI, cpu.rsi), (RDX, cpu.rdx), (RCX, cpu.rcx), (R8, cpu.r8), (R9, cpu.r9)] {
        *slot(frame, offset) = value;
    }
}

unsafe extern "C" fn leave_thunk(context: *const AttachContext, invocation: *mut InvocationContext, frame: *mut Frame) {
    let context = &*context;
    let frame = &*frame;
    (*frame.cpu).rax = *slot(frame, RETURN_VALUE);

    if let Some(on_leave) = context.listener.on_leave {
        on_leave(invocation, context.listener.user_data);
    }
    *slot(frame, RETURN_VALUE) = (*frame.cpu).rax;
}

/// Plans an Attach-mode patch.
pub(crate) fn plan<'p, P: PlatformPatcher>(
    alloc: &CodeAllocator<'p, P>,
    captured: &Captured,
    listener: CallListener,
) -> Result<Plan<'p, P>, PatchFault> {
    let patch_pc = captured.patch_address as u64;
    let mut block = alloc.alloc_near(captured.patch_address, NEAR_RANGE, BLOCK_SIZE)?;
    let redirect_size =
        if block.is_near(captured.patch_address, NEAR_RANGE) { NEAR_JMP_SIZE } else { FAR_JMP_SIZE };
    let len = measure(captured.code(), redirect_size).map_err(|e| relocation_fault(captured.target, e))?;

    let context = Box::new(AttachContext { function: CodeAddress::new(captured.target), listener });
    let base = block.address() as u64;
    let mut w = X86_64Writer::new(block.bytes_mut(), base);

    X86_64Relocator::new(captured.code(), patch_pc)
        .relocate(&mut w, len)
        .map_err(|e| relocation_fault(captured.target, e))?;
    w.put_jmp_address(patch_pc + len as u64);

    let pad = (16 - (w.offset() % 16)) % 16;
    w.put_nop_n(pad);
    let wrapper = w.pc();
    emit_wrapper(&mut w, &*context as *const AttachContext as u64, base);
    w.finish().map_err(|e| relocation_fault(captured.target, e))?;
    block.seal()?;

    let mut redirect = [0u8; MAX_PATCH];
    let mut w = X86_64Writer::new(&mut redirect, patch_pc);
    if redirect_size == NEAR_JMP_SIZE {
        w.put_jmp_near(wrapper);
    } else {
        w.put_jmp_far(wrapper);
    }
    w.put_nop_n(len - redirect_size);
    w.finish().map_err(|e| relocation_fault(captured.target, e))?;

    Ok(Plan { len, redirect, block: Some(block), trampoline: None, attach: Some(context) })
}

fn emit_wrapper(w: &mut X86_64Writer, context: u64, trampoline: u64) {
    let cpu_at = SAVED_AREA_SIZE;
    let invocation_at = cpu_at + core::mem::size_of::<CpuContext>();
    let frame_at = invocation_at + core::mem::size_of::<InvocationContext>();
    let fxsave_at = frame_at + core::mem::size_of::<Frame>();
    // fxsave needs 512 bytes at a 16-byte boundary; 15 bytes of slack let the
    // wrapper align the pointer whatever rsp is.
    let frame = (fxsave_at + 15 + 512).next_multiple_of(16) as i32;
    let above_frame = frame + 8 + RED_ZONE;

    w.put_lea_reg_mem(Reg::RSP, Reg::RSP, -RED_ZONE);
    w.put_pushfq();
    w.put_sub_reg_imm32(Reg::RSP, frame as u32);

    for (offset, reg) in saved_registers() {
        w.put_mov_mem_reg(Reg::RSP, offset as i32, reg);
    }
    w.put_cld();

    let fxsave_area = |w: &mut X86_64Writer| {
        w.put_lea_reg_mem(Reg::R11, Reg::RSP, (fxsave_at + 15) as i32);
        w.put_and_reg_imm32(Reg::R11, !15u32);
    };
    fxsave_area(w);
    w.put_fxsave_reg_indirect(Reg::R11);

    w.put_mov_reg_mem(Reg::R11, Reg::RSP, above_frame);
    w.put_mov_mem_reg(Reg::RSP, RETURN_ADDRESS as i32, Reg::R11);
    w.put_lea_reg_mem(Reg::R11, Reg::RSP, above_frame + 8);
    w.put_mov_mem_reg(Reg::RSP, ENTRY_SP as i32, Reg::R11);
    w.put_mov_reg_mem(Reg::R11, Reg::RSP, frame);
    w.put_mov_mem_reg(Reg::RSP, RFLAGS as i32, Reg::R11);

    w.put_mov_mem_reg(Reg::RSP, frame_at as i32, Reg::RSP);
    w.put_lea_reg_mem(Reg::R11, Reg::RSP, cpu_at as i32);
    w.put_mov_mem_reg(Reg::RSP, (frame_at + 8) as i32, Reg::R11);

    let call_thunk = |w: &mut X86_64Writer, thunk: u64| {
        w.put_mov_reg_imm64(Reg::RDI, context);
        w.put_lea_reg_mem(Reg::RSI, Reg::RSP, invocation_at as i32);
        w.put_lea_reg_mem(Reg::RDX, Reg::RSP, frame_at as i32);
        w.put_mov_reg_imm64(Reg::R11, thunk);
        w.put_call_reg(Reg::R11);
    };
    call_thunk(w, enter_thunk as usize as u64);

    for (offset, reg) in [(RDI, Reg::RDI), (RSI, Reg::RSI), (RDX, Reg::RDX), (RCX, Reg::RCX), (R8, Reg::R8), (R9, Reg::R9), (RAX, Reg::RAX)] {
        w.put_mov_reg_mem(reg, Reg::RSP, offset as i32);
    }
    w.put_push_mem(Reg::RSP, RFLAGS as i32);
    w.put_popfq();
    w.put_mov_reg_imm64(Reg::R11, trampoline);
    w.put_call_reg(Reg::R11);
    w.put_mov_mem_reg(Reg::RSP, RETURN_VALUE as i32, Reg::RAX);

    call_thunk(w, leave_thunk as usize as u64);

    fxsave_area(w);
    w.put_fxrstor_reg_indirect(Reg::R11);
    w.put_mov_reg_mem(Reg::RAX, Reg::RSP, RETURN_VALUE as i32);
    for (offset, reg) in [(RBX, Reg::RBX), (R12, Reg::R12), (R13, Reg::R13), (R14, Reg::R14), (R15, Reg::R15), (RBP, Reg::RBP)] {
        w.put_mov_reg_mem(reg, Reg::RSP, offset as i32);
    }
    w.put_push_mem(Reg::RSP, RFLAGS as i32);
    w.put_popfq();

    w.put_mov_reg_mem(Reg::R11, Reg::RSP, RETURN_ADDRESS as i32);
    w.put_lea_reg_mem(Reg::RSP, Reg::RSP, above_frame);
    w.put_mov_mem_reg(Reg::RSP, 0, Reg::R11);
    w.put_ret();
}

fn saved_registers() -> [(usize, Reg); 15] {
    [
        (RDI, Reg::RDI),
        (RSI, Reg::RSI),
        (RDX, Reg::RDX),
        (RCX, Reg::RCX),
        (R8, Reg::R8),
        (R9, Reg::R9),
        (RAX, Reg::RAX),
        (R10, Reg::R10),
        (R11, Reg::R11),
        (RBP, Reg::RBP),
        (RBX, Reg::RBX),
        (R12, Reg::R12),
        (R13, Reg::R13),
        (R14, Reg::R14),
        (R15, Reg::R15),
    ]
}
