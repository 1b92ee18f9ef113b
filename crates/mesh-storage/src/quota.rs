//! Byte quota for locally stored payloads.
//!
//! Usage is counted in caller payload bytes (pre-encryption), so the numbers a
//! caller sees match what they stored.

use mesh_core::{MeshError, MeshResult, QuotaInfo};

#[derive(Debug, Clone)]
pub struct QuotaManager {
    total: u64,
    used: u64,
}

impl QuotaManager {
    pub fn new(total: u64) -> Self {
        Self { total, used: 0 }
    }

    /// `used + size <= total`.
    pub fn can_store_file(&self, size: u64) -> bool {
        self.used
            .checked_add(size)
            .is_some_and(|after| after <= self.total)
    }

    /// Reserve room for replacing a `previous`-byte file with a `size`-byte one.
    pub fn reserve_replacement(&mut self, previous: u64, size: u64) -> MeshResult<()> {
        let base = self.used.saturating_sub(previous);
        match base.checked_add(size) {
            Some(after) if after <= self.total => {
                self.used = after;
                Ok(())
            }
            _ => Err(MeshError::QuotaExceeded {
                requested: size,
                available: self.total.saturating_sub(base),
            }),
        }
    }

    pub fn reserve(&mut self, size: u64) -> MeshResult<()> {
        self.reserve_replacement(0, size)
    }

    /// Account bytes that are already stored, even past the quota.
    pub fn charge(&mut self, size: u64) {
        self.used = self.used.saturating_add(size);
    }

    pub fn release(&mut self, size: u64) {
        self.used = self.used.saturating_sub(size);
    }

    /// Change the quota. Usage above a shrunk quota is kept; further stores
    /// fail until enough is released.
    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub fn quota_info(&self) -> QuotaInfo {
        QuotaInfo {
            total_quota: self.total,
            used_quota: self.used,
        }
    }

    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_fit_is_allowed() {
        let mut q = QuotaManager::new(100);
        assert!(q.can_store_file(100));
        q.reserve(100).unwrap();
        assert!(!q.can_store_file(1));
        assert!(q.can_store_file(0));
    }

    #[test]
    fn over_quota_leaves_usage_unchanged() {
        let mut q = QuotaManager::new(100);
        q.reserve(60).unwrap();
        let err = q.reserve(41).unwrap_err();
        assert!(matches!(
            err,
            MeshError::QuotaExceeded {
                requested: 41,
                available: 40
            }
        ));
        assert_eq!(q.quota_info().used_quota, 60);
    }

    #[test]
    fn replacement_counts_only_the_difference() {
        let mut q = QuotaManager::new(100);
        q.reserve(80).unwrap();
        q.reserve_replacement(80, 100).unwrap();
        assert_eq!(q.quota_info().used_quota, 100);
        q.release(100);
        assert_eq!(q.available(), 100);
    }

    #[test]
    fn huge_sizes_do_not_overflow() {
        let mut q = QuotaManager::new(u64::MAX);
        q.reserve(10).unwrap();
        assert!(!q.can_store_file(u64::MAX));
    }

    proptest! {
        #[test]
        fn used_never_exceeds_total(sizes in proptest::collection::vec(0u64..500, 0..50)) {
            let mut q = QuotaManager::new(1_000);
            for s in sizes {
                let _ = q.reserve(s);
                prop_assert!(q.quota_info().used_quota <= 1_000);
            }
        }
    }
}
