use crate::error::PatchFault;
use crate::platform::{CodeSlice, PlatformPatcher};

/// Hands out engine-owned code memory, near a target when possible.
#[derive(Debug)]
pub struct CodeAllocator<'p, P: PlatformPatcher> {
    platform: &'p P,
    prefer_near: bool,
}

impl<'p, P: PlatformPatcher> CodeAllocator<'p, P> {
    pub fn new(platform: &'p P, prefer_near: bool) -> Self {
        Self { platform, prefer_near }
    }

    /// Allocates `size` bytes, first inside `range` of `target`, then anywhere.
    pub fn alloc_near(&self, target: usize, range: u64, size: usize) -> Result<CodeBlock<'p, P>, PatchFault> {
        if self.prefer_near && self.platform.capabilities().near_allocation {
            match self.platform.alloc_code(Some(target), range, size) {
                Ok(slice) => return Ok(CodeBlock::new(self.platform, slice)),
                Err(fault) => log::debug!("no code page within {range:#x} of {target:#x} (code {})", fault.code()),
            }
        }
        self.alloc_any(size)
    }

    pub fn alloc_any(&self, size: usize) -> Result<CodeBlock<'p, P>, PatchFault> {
        let slice = self
            .platform
            .alloc_code(None, 0, size)
            .map_err(|fault| PatchFault::Allocation(fault.code()))?;
        Ok(CodeBlock::new(self.platform, slice))
    }
}

/// A code block that is freed on drop unless [`CodeBlock::keep`] hands it over.
#[derive(Debug)]
pub struct CodeBlock<'p, P: PlatformPatcher> {
    platform: &'p P,
    slice: Option<CodeSlice>,
}

impl<'p, P: PlatformPatcher> CodeBlock<'p, P> {
    fn new(platform: &'p P, slice: CodeSlice) -> Self {
        Self { platform, slice: Some(slice) }
    }

    pub fn slice(&self) -> CodeSlice {
        // Only `keep` and `drop` take the slice out, both by value.
        self.slice.unwrap_or(CodeSlice { address: 0, size: 0 })
    }

    pub fn address(&self) -> usize {
        self.slice().address
    }

    /// Whether the block starts within `range` bytes of `target`.
    pub fn is_near(&self, target: usize, range: u64) -> bool {
        let slice = self.slice();
        crate::arch::within(target as u64, slice.address as u64, range)
            && crate::arch::within(target as u64, (slice.address + slice.size) as u64, range)
    }

    /// Writable view of the block for code emission.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self.slice {
            // The block is unsealed and exclusively owned until `seal`.
            Some(slice) => unsafe { slice.bytes_mut() },
            None => &mut [],
        }
    }

    /// Makes the block executable.
    pub fn seal(&self) -> Result<(), PatchFault> {
        self.platform
            .seal_code(&self.slice())
            .map_err(|fault| PatchFault::Allocation(fault.code()))
    }

    /// Transfers ownership of the memory to the caller.
    pub fn keep(mut self) -> CodeSlice {
        self.slice.take().unwrap_or(CodeSlice { address: 0, size: 0 })
    }
}

impl<P: PlatformPatcher> Drop for CodeBlock<'_, P> {
    fn drop(&mut self) {
        if let Some(slice) = self.slice.take() {
            // Never published, so no thread can be running it.
            unsafe { self.platform.free_code(slice) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{FakeEvent, FakePatcher, SAMPLE_RETURNS_42};

    #[test]
    fn prefers_near_then_falls_back() {
        let p = FakePatcher::new();
        let target = p.map_code(SAMPLE_RETURNS_42);
        let alloc = CodeAllocator::new(&p, true);

        let block = alloc.alloc_near(target, 0x7FFF_FFFF, 64).unwrap();
        assert!(block.is_near(target, 0x7FFF_FFFF));
        drop(block);
        assert_eq!(p.live_blocks(), 0);

        p.far_only(true);
        let block = alloc.alloc_near(target, 0x7FFF_FFFF, 64).unwrap();
        let slice = block.keep();
        assert!(p.events().contains(&FakeEvent::Alloc { address: slice.address, size: slice.size, near: false }));
        assert_eq!(p.live_blocks(), 1);
    }

    #[test]
    fn far_only_config_skips_near_attempt() {
        let p = FakePatcher::new();
        let target = p.map_code(SAMPLE_RETURNS_42);
        let block = CodeAllocator::new(&p, false).alloc_near(target, 0x7FFF_FFFF, 64).unwrap();
        let address = block.address();
        drop(block);
        assert!(p.events().iter().all(|e| !matches!(e, FakeEvent::Alloc { near: true, .. })));
        assert!(p.freed().iter().any(|s| s.address == address));
    }
}
