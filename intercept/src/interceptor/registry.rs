use std::collections::HashMap;

use crate::error::{HookError, Result};
use crate::types::{CodeAddress, HookRecord};

/// Active hooks keyed by target address, at most one per target.
///
/// Generic over the per-hook payload so the bookkeeping can be exercised
/// without patching anything.
#[derive(Debug)]
pub struct HookRegistry<T> {
    entries: HashMap<CodeAddress, (HookRecord, T)>,
}

impl<T> Default for HookRegistry<T> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<T> HookRegistry<T> {
    pub fn contains(&self, target: CodeAddress) -> bool {
        self.entries.contains_key(&target)
    }

    /// Adds a record. Fails without touching the registry when the target is
    /// already hooked.
    pub fn try_insert(&mut self, record: HookRecord, payload: T) -> Result<()> {
        let target = record.target_address;
        if self.entries.contains_key(&target) {
            return Err(HookError::AlreadyHooked { address: target });
        }
        self.entries.insert(target, (record, payload));
        Ok(())
    }

    pub fn remove(&mut self, target: CodeAddress) -> Result<(HookRecord, T)> {
        self.entries.remove(&target).ok_or(HookError::UnknownTarget { address: target })
    }

    pub fn lookup(&self, target: CodeAddress) -> Option<&HookRecord> {
        self.entries.get(&target).map(|(record, _)| record)
    }

    pub(crate) fn payload_mut(&mut self, target: CodeAddress) -> Option<&mut T> {
        self.entries.get_mut(&target).map(|(_, payload)| payload)
    }

    /// Records ordered by target address.
    pub fn records(&self) -> Vec<HookRecord> {
        let mut records: Vec<HookRecord> = self.entries.values().map(|(r, _)| r.clone()).collect();
        records.sort_by_key(|r| r.target_address);
        records
    }

    /// Empties the registry, returning entries ordered by target address.
    pub fn drain_all(&mut self) -> Vec<(HookRecord, T)> {
        let mut all: Vec<_> = self.entries.drain().map(|(_, entry)| entry).collect();
        all.sort_by_key(|(r, _)| r.target_address);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HookMode, HookOrigin};

    fn record(target: usize) -> HookRecord {
        HookRecord {
            target_address: CodeAddress::new(target),
            replacement_address: Some(CodeAddress::new(0x9000)),
            trampoline_address: Some(CodeAddress::new(0xA000)),
            mode: HookMode::Replace,
            origin: HookOrigin::Raw,
        }
    }

    #[test]
    fn second_insert_is_rejected_without_change() {
        let mut reg = HookRegistry::default();
        reg.try_insert(record(0x1000), 1).unwrap();
        let err = reg.try_insert(record(0x1000), 2).unwrap_err();
        assert!(matches!(err, HookError::AlreadyHooked { address } if address == CodeAddress::new(0x1000)));
        assert_eq!(reg.len(), 1);
        assert_eq!(*reg.payload_mut(CodeAddress::new(0x1000)).unwrap(), 1);
    }

    #[test]
    fn remove_unknown_target() {
        let mut reg: HookRegistry<()> = HookRegistry::default();
        assert!(matches!(reg.remove(CodeAddress::new(0x10)), Err(HookError::UnknownTarget { .. })));
    }

    #[test]
    fn lookup_remove_and_drain() {
        let mut reg = HookRegistry::default();
        reg.try_insert(record(0x3000), ()).unwrap();
        reg.try_insert(record(0x1000), ()).unwrap();
        reg.try_insert(record(0x2000), ()).unwrap();
        assert_eq!(reg.lookup(CodeAddress::new(0x2000)).unwrap().target_address, CodeAddress::new(0x2000));
        assert!(reg.lookup(CodeAddress::new(0x4000)).is_none());

        let (removed, ()) = reg.remove(CodeAddress::new(0x2000)).unwrap();
        assert_eq!(removed, record(0x2000));
        assert!(!reg.contains(CodeAddress::new(0x2000)));

        let order: Vec<_> = reg.records().iter().map(|r| r.target_address.as_usize()).collect();
        assert_eq!(order, vec![0x1000, 0x3000]);
        assert_eq!(reg.drain_all().len(), 2);
        assert!(reg.is_empty());
    }
}
