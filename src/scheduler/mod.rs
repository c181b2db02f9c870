//! Coordinator-side scheduling.
//!
//! [`GridScheduler`] is the context object every node session and the status
//! API share. It owns:
//!
//! - [`JobRegistry`]: lifecycle of every submitted job
//! - [`CapacityTracker`]: per-node capacity, version acknowledgement and cost scale
//! - [`Dispatcher`]: moves queued jobs onto eligible nodes
//! - [`CancellationCoordinator`]: cancel requests from upstream
//! - [`VersionBroadcaster`]: function-repository changes
//! - [`ResolverProxy`]: node-initiated dependent-value queries
//!
//! Nothing here awaits while holding a lock. Locks are always taken in the
//! order node session, then job record.

pub mod cancel;
pub mod capacity;
pub mod dispatcher;
pub mod job;
pub mod registry;
pub mod resolver;
pub mod version;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::{GridError, Result};
use crate::protocol::Outbox;

pub use cancel::{CancelOutcome, CancellationCoordinator};
pub use capacity::{CapacityTracker, NodeId, NodeSession, NodeSnapshot, SharedSession};
pub use dispatcher::Dispatcher;
pub use job::{
    CacheHint, ItemStatus, Job, JobItem, JobOutcome, JobResultItem, JobSpecification,
    ValueSpecification,
};
pub use registry::{JobEvent, JobRecord, JobRegistry, JobState, ResultDisposition};
pub use resolver::{DependentValueResolver, NoDependentValues, ResolverProxy, StaticResolver};
pub use version::{RepositoryVersion, VersionBroadcaster};

/// Failure reason recorded for jobs held by a node that went away.
pub const NODE_DISCONNECTED: &str = "node disconnected";

#[derive(Debug, Clone)]
pub struct GridScheduler {
    registry: Arc<JobRegistry>,
    tracker: Arc<CapacityTracker>,
    versions: VersionBroadcaster,
    dispatcher: Dispatcher,
    cancellation: CancellationCoordinator,
    resolver: ResolverProxy,
}

impl GridScheduler {
    pub fn new(config: &CoordinatorConfig, resolver: Arc<dyn DependentValueResolver>) -> Self {
        let version = RepositoryVersion::new(config.initial_repository_version);
        let registry = Arc::new(JobRegistry::with_capacity(config.max_jobs));
        let tracker = Arc::new(CapacityTracker::new(
            version.clone(),
            config.admission.clone(),
        ));
        Self {
            versions: VersionBroadcaster::new(version, tracker.clone()),
            dispatcher: Dispatcher::new(registry.clone(), tracker.clone()),
            cancellation: CancellationCoordinator::new(registry.clone(), tracker.clone()),
            resolver: ResolverProxy::new(
                resolver,
                Duration::from_millis(config.resolver_deadline_ms),
            ),
            registry,
            tracker,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<CapacityTracker> {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn resolver(&self) -> &ResolverProxy {
        &self.resolver
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.registry.subscribe()
    }

    pub fn current_version(&self) -> i64 {
        self.versions.current()
    }

    /// Queue a job. Returns immediately; dispatch happens on the dispatcher task.
    pub fn submit(&self, job: Job) -> Result<JobSpecification> {
        let spec = self.registry.submit(job)?;
        self.dispatcher.wake();
        Ok(spec)
    }

    /// Put a failed job back in the queue.
    pub fn resubmit(&self, spec: &JobSpecification) -> Result<()> {
        self.registry.resubmit(spec)?;
        self.dispatcher.wake();
        Ok(())
    }

    pub fn cancel(&self, spec: &JobSpecification) -> CancelOutcome {
        let outcome = self.cancellation.cancel(spec);
        if outcome.is_cancelled() {
            // A cancelled in-flight job frees a slot.
            self.dispatcher.wake();
        }
        outcome
    }

    pub fn cancel_cycle(&self, session_id: Uuid, cycle_id: u64) -> usize {
        let cancelled = self.cancellation.cancel_cycle(session_id, cycle_id);
        if cancelled > 0 {
            self.dispatcher.wake();
        }
        cancelled
    }

    pub fn on_repository_changed(&self) -> i64 {
        self.versions.on_repository_changed()
    }

    pub fn register_node(&self, node_id: &str, outbox: Outbox) -> Result<SharedSession> {
        self.tracker.register_node(node_id, outbox)
    }

    pub fn on_ready(&self, node_id: &str, capacity: i64) -> Result<()> {
        self.tracker.on_ready(node_id, capacity)?;
        self.dispatcher.wake();
        Ok(())
    }

    pub fn on_scaling(&self, node_id: &str, factor: f64) -> Result<()> {
        self.tracker.on_scaling(node_id, factor)?;
        self.dispatcher.wake();
        Ok(())
    }

    /// The node started executing `spec`. Acknowledgements for jobs the node
    /// no longer holds are ignored.
    pub fn on_job_accepted(&self, node_id: &str, spec: &JobSpecification) -> bool {
        let applied = self.registry.mark_executing(spec, node_id);
        if !applied {
            tracing::debug!(node_id, job = %spec, "Ignoring acceptance of job not dispatched to node");
        }
        applied
    }

    /// Apply a result reported by `node_id`. The slot is released only when
    /// the result is applied; a cancelled job already released its slot.
    pub fn on_job_result(
        &self,
        node_id: &str,
        spec: &JobSpecification,
        outcome: JobOutcome,
    ) -> ResultDisposition {
        let session = self.tracker.session(node_id);
        let disposition = match &session {
            Some(session) => {
                let mut session = session.lock();
                let disposition = self.registry.finish(spec, node_id, outcome);
                if let ResultDisposition::Applied(_) = disposition {
                    session.in_flight.remove(spec);
                }
                disposition
            }
            None => self.registry.finish(spec, node_id, outcome),
        };
        match disposition {
            ResultDisposition::Applied(state) => {
                tracing::debug!(node_id, job = %spec, state = %state, "Job result applied");
                self.dispatcher.wake();
            }
            ResultDisposition::Discarded => {
                tracing::warn!(
                    node_id,
                    job = %spec,
                    state = ?self.registry.state(spec),
                    "Discarding result for job not held by node"
                );
            }
        }
        disposition
    }

    /// Answer a dependent-value request on the node's outbox.
    pub fn on_dependent_value_request(
        &self,
        node_id: &str,
        correlation_id: i64,
        spec: JobSpecification,
    ) -> Result<bool> {
        let session = self
            .tracker
            .session(node_id)
            .ok_or_else(|| GridError::NodeNotFound(node_id.to_string()))?;
        let outbox = session.lock().outbox().clone();
        Ok(self
            .resolver
            .on_request(node_id, correlation_id, spec, outbox))
    }

    /// Remove a node and fail every job it still held. Returns the failed jobs.
    pub fn on_node_disconnected(&self, node_id: &str) -> Vec<JobSpecification> {
        let Some(session) = self.tracker.remove_node(node_id) else {
            return Vec::new();
        };
        let held: Vec<JobSpecification> = {
            let mut session = session.lock();
            let held: Vec<JobSpecification> = session.in_flight.drain().collect();
            held.into_iter()
                .filter(|spec| self.registry.fail(spec, node_id, NODE_DISCONNECTED))
                .collect()
        };
        // Sweep records still assigned to the node outside its in-flight set.
        let mut failed = held;
        for spec in self.registry.in_flight_on(node_id) {
            if self.registry.fail(&spec, node_id, NODE_DISCONNECTED) {
                failed.push(spec);
            }
        }
        if failed.is_empty() {
            tracing::info!(node_id, "Node disconnected");
        } else {
            tracing::warn!(node_id, failed = failed.len(), "Node disconnected holding jobs");
        }
        self.dispatcher.wake();
        failed
    }
}
