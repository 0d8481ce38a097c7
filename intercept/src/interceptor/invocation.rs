//! Register access for attach listeners.
//!
//! System V AMD64 passes arguments 0..6 in RDI, RSI, RDX, RCX, R8, R9 and
//! returns in RAX. AAPCS64 uses X0..X7 and returns in X0.

use crate::types::{CodeAddress, CpuContext, InvocationContext};

impl InvocationContext {
    /// Entry address of the hooked function.
    pub fn function(&self) -> CodeAddress {
        self.function
    }

    pub fn cpu(&self) -> &CpuContext {
        // Set by the wrapper to a live snapshot for the whole callback.
        unsafe { &*self.cpu_context }
    }

    pub fn cpu_mut(&mut self) -> &mut CpuContext {
        unsafe { &mut *self.cpu_context }
    }

    /// Integer argument `n`, or `None` past the last register argument.
    pub fn argument(&self, n: usize) -> Option<u64> {
        argument_slot(self.cpu(), n)
    }

    /// Rewrites argument `n` before the original runs. Only meaningful in
    /// `on_enter`; ignored for stack arguments.
    pub fn set_argument(&mut self, n: usize, value: u64) {
        let cpu = self.cpu_mut();
        if let Some(slot) = argument_slot_mut(cpu, n) {
            *slot = value;
        }
    }

    /// The original's return value. Only meaningful in `on_leave`.
    pub fn return_value(&self) -> u64 {
        *return_slot(self.cpu())
    }

    /// Replaces what the caller sees as the return value. Only meaningful in
    /// `on_leave`.
    pub fn set_return_value(&mut self, value: u64) {
        *return_slot_mut(self.cpu_mut()) = value;
    }
}

#[cfg(target_arch = "x86_64")]
fn argument_slot_mut(cpu: &mut CpuContext, n: usize) -> Option<&mut u64> {
    Some(match n {
        0 => &mut cpu.rdi,
        1 => &mut cpu.rsi,
        2 => &mut cpu.rdx,
        3 => &mut cpu.rcx,
        4 => &mut cpu.r8,
        5 => &mut cpu.r9,
        _ => return None,
    })
}

#[cfg(target_arch = "x86_64")]
fn return_slot(cpu: &CpuContext) -> &u64 {
    &cpu.rax
}

#[cfg(target_arch = "x86_64")]
fn return_slot_mut(cpu: &mut CpuContext) -> &mut u64 {
    &mut cpu.rax
}

#[cfg(not(target_arch = "x86_64"))]
fn argument_slot_mut(cpu: &mut CpuContext, n: usize) -> Option<&mut u64> {
    cpu.x.get_mut(..8)?.get_mut(n)
}

#[cfg(not(target_arch = "x86_64"))]
fn return_slot(cpu: &CpuContext) -> &u64 {
    &cpu.x[0]
}

#[cfg(not(target_arch = "x86_64"))]
fn return_slot_mut(cpu: &mut CpuContext) -> &mut u64 {
    &mut cpu.x[0]
}

fn argument_slot(cpu: &CpuContext, n: usize) -> Option<u64> {
    let mut copy = *cpu;
    argument_slot_mut(&mut copy, n).map(|slot| *slot)
}
