use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::scheduler::capacity::CapacityTracker;

/// The function-repository version counter. The only grid-wide mutable
/// value; every session task reads it through a clone of this handle.
#[derive(Debug, Clone)]
pub struct RepositoryVersion(Arc<AtomicI64>);

impl RepositoryVersion {
    pub fn new(initial: i64) -> Self {
        Self(Arc::new(AtomicI64::new(initial)))
    }

    pub fn current(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Pushes Init to every node when the function repository changes.
#[derive(Debug, Clone)]
pub struct VersionBroadcaster {
    version: RepositoryVersion,
    tracker: Arc<CapacityTracker>,
}

impl VersionBroadcaster {
    pub fn new(version: RepositoryVersion, tracker: Arc<CapacityTracker>) -> Self {
        Self { version, tracker }
    }

    pub fn current(&self) -> i64 {
        self.version.current()
    }

    /// Bump the version and send Init to every connected node. Each node is
    /// ineligible for dispatch until its next Ready. Returns the new version.
    pub fn on_repository_changed(&self) -> i64 {
        let version = self.version.increment();
        let mut notified = 0usize;
        for session in self.tracker.sessions() {
            // A concurrent newer change may already have reached this node;
            // send_init keeps only the latest.
            if session.lock().send_init(version) {
                notified += 1;
            }
        }
        tracing::info!(version, notified, "Function repository changed");
        version
    }
}
