use dashmap::DashMap;

use crate::scheduler::job::JobItem;

/// Decides whether an item may run. A blacklisted item is reported as
/// suppressed and its outputs count as unavailable.
pub trait FunctionBlacklistQuery: Send + Sync + 'static {
    fn is_blacklisted(&self, item: &JobItem) -> bool;
}

/// Told about every item that ended in failure, including overrunning its
/// time limit.
pub trait FunctionBlacklistMaintainer: Send + Sync + 'static {
    fn failed_item(&self, item: &JobItem);
}

/// Blacklists nothing and ignores failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBlacklist;

impl FunctionBlacklistQuery for NoBlacklist {
    fn is_blacklisted(&self, _item: &JobItem) -> bool {
        false
    }
}

impl FunctionBlacklistMaintainer for NoBlacklist {
    fn failed_item(&self, _item: &JobItem) {}
}

/// Suppresses a function on this node once it has failed `threshold` times.
///
/// Keyed by function id, so one bad function is suppressed for every target.
#[derive(Debug)]
pub struct FailureCountBlacklist {
    threshold: u32,
    failures: DashMap<String, u32>,
}

impl FailureCountBlacklist {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: DashMap::new(),
        }
    }

    pub fn failures(&self, function_id: &str) -> u32 {
        self.failures.get(function_id).map_or(0, |count| *count)
    }

    /// Forget every recorded failure, e.g. after the function repository changed.
    pub fn clear(&self) {
        self.failures.clear();
    }
}

impl FunctionBlacklistQuery for FailureCountBlacklist {
    fn is_blacklisted(&self, item: &JobItem) -> bool {
        self.failures(&item.function_id) >= self.threshold
    }
}

impl FunctionBlacklistMaintainer for FailureCountBlacklist {
    fn failed_item(&self, item: &JobItem) {
        let mut count = self.failures.entry(item.function_id.clone()).or_insert(0);
        *count += 1;
        if *count == self.threshold {
            tracing::warn!(
                function_id = %item.function_id,
                failures = *count,
                "Function blacklisted on this node"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklists_after_threshold() {
        let blacklist = FailureCountBlacklist::new(2);
        let item = JobItem::new("SwapPV", "trade-1");
        let other_target = JobItem::new("SwapPV", "trade-2");

        blacklist.failed_item(&item);
        assert!(!blacklist.is_blacklisted(&item));
        blacklist.failed_item(&item);
        assert!(blacklist.is_blacklisted(&other_target));
        assert!(!blacklist.is_blacklisted(&JobItem::new("Delta", "trade-1")));

        blacklist.clear();
        assert_eq!(blacklist.failures("SwapPV"), 0);
        assert!(!blacklist.is_blacklisted(&item));
    }

    #[test]
    fn zero_threshold_means_one() {
        let blacklist = FailureCountBlacklist::new(0);
        let item = JobItem::new("SwapPV", "trade-1");
        assert!(!blacklist.is_blacklisted(&item));
        blacklist.failed_item(&item);
        assert!(blacklist.is_blacklisted(&item));
    }
}
