//! Per-owner store quota
//!
//! A process-wide owner to store-count map, seeded from the cluster at
//! startup and kept current by the create/delete endpoints. The
//! read-check-update runs under one mutex so concurrent creates cannot
//! slip past the cap.

use crate::error::ApiError;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Process-wide ownership quota.
pub struct OwnerQuota {
    cap: usize,
    counts: Mutex<HashMap<String, usize>>,
}

impl OwnerQuota {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the map from a snapshot of existing stores.
    pub fn seed<I: IntoIterator<Item = String>>(&self, owners: I) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for owner in owners {
            *counts.entry(owner).or_insert(0) += 1;
        }
        *self.counts.lock() = counts;
    }

    /// Reserve one slot for `owner`, failing when the cap is reached.
    pub fn try_reserve(&self, owner: &str) -> Result<(), ApiError> {
        let mut counts = self.counts.lock();
        let count = counts.entry(owner.to_string()).or_insert(0);
        if *count >= self.cap {
            return Err(ApiError::QuotaExceeded(format!(
                "owner '{}' already has {}/{} stores",
                owner, count, self.cap
            )));
        }
        *count += 1;
        Ok(())
    }

    /// Give a slot back (failed create, or a completed delete).
    pub fn release(&self, owner: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(owner);
            }
        }
    }

    /// Current count for an owner.
    pub fn count(&self, owner: &str) -> usize {
        *self.counts.lock().get(owner).unwrap_or(&0)
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_is_enforced() {
        let quota = OwnerQuota::new(2);
        assert!(quota.try_reserve("alice").is_ok());
        assert!(quota.try_reserve("alice").is_ok());
        let err = quota.try_reserve("alice").unwrap_err();
        assert!(matches!(err, ApiError::QuotaExceeded(_)));
    }

    #[test]
    fn test_owners_are_independent() {
        let quota = OwnerQuota::new(1);
        assert!(quota.try_reserve("alice").is_ok());
        assert!(quota.try_reserve("bob").is_ok());
        assert!(quota.try_reserve("alice").is_err());
    }

    #[test]
    fn test_release_frees_a_slot() {
        let quota = OwnerQuota::new(1);
        assert!(quota.try_reserve("alice").is_ok());
        assert!(quota.try_reserve("alice").is_err());
        quota.release("alice");
        assert!(quota.try_reserve("alice").is_ok());
    }

    #[test]
    fn test_seed_replaces_counts() {
        let quota = OwnerQuota::new(5);
        quota.seed(vec![
            "alice".to_string(),
            "alice".to_string(),
            "bob".to_string(),
        ]);
        assert_eq!(quota.count("alice"), 2);
        assert_eq!(quota.count("bob"), 1);
        assert_eq!(quota.count("carol"), 0);
    }

    #[test]
    fn test_release_never_underflows() {
        let quota = OwnerQuota::new(2);
        quota.release("ghost");
        assert_eq!(quota.count("ghost"), 0);
    }
}
