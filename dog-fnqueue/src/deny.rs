use std::collections::HashSet;

use parking_lot::Mutex;

use crate::error::QueueError;

#[derive(Debug, Default)]
struct DenySets {
    concurrency: HashSet<String>,
    throttle: HashSet<String>,
}

/// Keys proven to be at capacity during one peek and lease batch.
///
/// Leases of later items whose keys are listed here fail without touching
/// the store. Create a fresh value per batch.
#[derive(Debug, Default)]
pub struct LeaseDenies {
    inner: Mutex<DenySets>,
}

impl LeaseDenies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the key carried by a constraint error. Other errors are ignored.
    pub fn record(&self, err: &QueueError) {
        let Some(key) = err.constraint_key() else {
            return;
        };
        let mut sets = self.inner.lock();
        if err.is_throttled() {
            sets.throttle.insert(key.to_string());
        } else {
            sets.concurrency.insert(key.to_string());
        }
    }

    pub fn deny_concurrency(&self, key: &str) -> bool {
        self.inner.lock().concurrency.contains(key)
    }

    pub fn deny_throttle(&self, key: &str) -> bool {
        self.inner.lock().throttle.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        let sets = self.inner.lock();
        sets.concurrency.is_empty() && sets.throttle.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_keys_by_kind() {
        let denies = LeaseDenies::new();
        assert!(denies.is_empty());

        denies.record(&QueueError::AccountConcurrencyLimit { key: "acct".into() });
        denies.record(&QueueError::QueueItemThrottled { key: "thr".into() });
        denies.record(&QueueError::ItemNotFound);

        assert!(denies.deny_concurrency("acct"));
        assert!(!denies.deny_throttle("acct"));
        assert!(denies.deny_throttle("thr"));
        assert!(!denies.deny_concurrency("thr"));
    }
}
