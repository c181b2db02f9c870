use std::sync::Arc;

use uuid::Uuid;

use crate::scheduler::capacity::{CapacityTracker, NodeId};
use crate::scheduler::job::JobSpecification;
use crate::scheduler::registry::{JobRegistry, JobState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job is now `Cancelled`. `notified` names the node that was sent a
    /// Cancel; `None` means no node held it.
    Cancelled { notified: Option<NodeId> },
    /// Already finished; nothing changed.
    AlreadyTerminal(JobState),
    Unknown,
}

impl CancelOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CancelOutcome::Cancelled { .. })
    }
}

/// Turns cancel requests into registry transitions and node Cancel messages.
///
/// Cancellation is fire-and-forget: the record becomes `Cancelled` at once and
/// any result the node still sends for it is discarded.
#[derive(Debug, Clone)]
pub struct CancellationCoordinator {
    registry: Arc<JobRegistry>,
    tracker: Arc<CapacityTracker>,
}

impl CancellationCoordinator {
    pub fn new(registry: Arc<JobRegistry>, tracker: Arc<CapacityTracker>) -> Self {
        Self { registry, tracker }
    }

    pub fn cancel(&self, spec: &JobSpecification) -> CancelOutcome {
        // States only move forward, so each retry observes a later state and
        // the loop ends after a handful of races at most.
        loop {
            let Some(state) = self.registry.state(spec) else {
                tracing::warn!(job = %spec, "Cancel requested for unknown job");
                return CancelOutcome::Unknown;
            };
            if state.is_terminal() {
                tracing::debug!(job = %spec, state = %state, "Cancel ignored, job already finished");
                return CancelOutcome::AlreadyTerminal(state);
            }
            if state == JobState::Queued {
                if self.registry.cancel_queued(spec) {
                    tracing::info!(job = %spec, "Queued job cancelled");
                    return CancelOutcome::Cancelled { notified: None };
                }
                continue;
            }

            let Some(node_id) = self.registry.assigned_node(spec) else {
                continue;
            };
            match self.tracker.session(&node_id) {
                Some(session) => {
                    let mut session = session.lock();
                    if self.registry.cancel_in_flight(spec, &node_id) {
                        session.in_flight.remove(spec);
                        session.outbox().cancel(*spec);
                        tracing::info!(job = %spec, node_id = %node_id, "Cancel sent to node");
                        return CancelOutcome::Cancelled {
                            notified: Some(node_id),
                        };
                    }
                }
                None => {
                    // The node is being torn down; win the race against its
                    // disconnect handling, which will then find a terminal job.
                    if self.registry.cancel_in_flight(spec, &node_id) {
                        tracing::info!(job = %spec, node_id = %node_id, "Job cancelled on departed node");
                        return CancelOutcome::Cancelled { notified: None };
                    }
                }
            }
        }
    }

    /// Cancel every unfinished job of one cycle. Cancels bound for the same
    /// node leave as a single message. Returns how many jobs were cancelled.
    pub fn cancel_cycle(&self, session_id: Uuid, cycle_id: u64) -> usize {
        let cancelled = self
            .registry
            .active_in_cycle(session_id, cycle_id)
            .iter()
            .filter(|spec| self.cancel(spec).is_cancelled())
            .count();
        tracing::info!(%session_id, cycle_id, cancelled, "Cycle cancelled");
        cancelled
    }
}
