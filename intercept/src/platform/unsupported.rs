//! Stand-in for operating systems without a patching backend. Every
//! capability is off and every primitive reports `Unsupported`.

use std::time::Duration;

use super::{Capabilities, CodeSlice, PlatformFault, PlatformPatcher, Protection, Quiesced, Region, WriteMode};

#[derive(Debug, Default)]
pub struct UnsupportedPatcher;

impl UnsupportedPatcher {
    pub fn new() -> Self {
        Self
    }
}

impl PlatformPatcher for UnsupportedPatcher {
    type ThreadToken = ();

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn page_size(&self) -> usize {
        4096
    }

    fn query_region(&self, _address: usize) -> Option<Region> {
        None
    }

    fn protect(&self, _page_start: usize, _len: usize, _protection: Protection) -> Result<(), PlatformFault> {
        Err(PlatformFault::Unsupported)
    }

    unsafe fn write_code(&self, _address: usize, _bytes: &[u8], _mode: WriteMode) -> Result<(), PlatformFault> {
        Err(PlatformFault::Unsupported)
    }

    fn alloc_code(&self, _near: Option<usize>, _max_distance: u64, _size: usize) -> Result<CodeSlice, PlatformFault> {
        Err(PlatformFault::Unsupported)
    }

    fn seal_code(&self, _slice: &CodeSlice) -> Result<(), PlatformFault> {
        Err(PlatformFault::Unsupported)
    }

    unsafe fn free_code(&self, _slice: CodeSlice) {}

    fn flush_icache(&self, _address: usize, _len: usize) {}

    fn suspend_other_threads(&self, _timeout: Duration) -> Result<Quiesced<()>, PlatformFault> {
        Err(PlatformFault::Unsupported)
    }

    fn resume_threads(&self, _quiesced: Quiesced<()>) {}
}
