use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::protocol::Message;
use crate::scheduler::capacity::{CapacityTracker, NodeId};
use crate::scheduler::job::{Job, JobSpecification};
use crate::scheduler::registry::{JobRegistry, JobState};

enum Attempt {
    Sent(NodeId),
    /// The record left `Queued` while waiting (cancelled).
    Stale,
    /// No eligible node right now; the job stays at the head of the queue.
    NoNode,
}

/// Moves queued jobs onto nodes.
///
/// Woken by submissions and by node events (Ready, Scaling, results,
/// disconnects); also retries on a fixed backoff so a queue that found no
/// node is never stranded.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    tracker: Arc<CapacityTracker>,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(registry: Arc<JobRegistry>, tracker: Arc<CapacityTracker>) -> Self {
        Self {
            registry,
            tracker,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Ask the dispatch loop to run a pass soon.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Dispatch queued jobs in submission order until the queue is empty or
    /// no node can take the next one. Returns how many were sent.
    pub fn dispatch_pending(&self) -> usize {
        let mut dispatched = 0;
        while let Some(spec) = self.registry.pop_ready() {
            // Cancelled or purged while waiting: drop the entry before it can
            // stall the queue head.
            let Some(record) = self.registry.get(&spec) else {
                continue;
            };
            if record.state != JobState::Queued {
                continue;
            }
            match self.try_dispatch(&spec, &record.job) {
                Attempt::Sent(node_id) => {
                    tracing::debug!(job = %spec, node_id = %node_id, "Job dispatched");
                    dispatched += 1;
                }
                Attempt::Stale => continue,
                Attempt::NoNode => {
                    self.registry.requeue_front(spec);
                    break;
                }
            }
        }
        dispatched
    }

    fn try_dispatch(&self, spec: &JobSpecification, job: &Job) -> Attempt {
        let Some(node_id) = self.tracker.select_node(job) else {
            return Attempt::NoNode;
        };
        let Some(session) = self.tracker.session(&node_id) else {
            return Attempt::NoNode;
        };
        let mut session = session.lock();
        // Selection read the sessions without holding this lock throughout;
        // re-check before committing.
        if !session.is_eligible(self.tracker.current_version()) {
            return Attempt::NoNode;
        }
        let Some(job) = self.registry.mark_dispatched(spec, &node_id) else {
            return Attempt::Stale;
        };
        if !session.outbox().send(Message::Execute { job }) {
            tracing::warn!(job = %spec, node_id = %node_id, "Node outbox closed, job not dispatched");
            // The session task is gone; keep the node out of selection until
            // its disconnect is processed. revert_dispatch requeues the job.
            session.closed = true;
            self.registry.revert_dispatch(spec);
            return Attempt::Stale;
        }
        session.in_flight.insert(*spec);
        Attempt::Sent(node_id)
    }

    /// Dispatch loop. Runs until `shutdown` is cancelled.
    pub async fn run(self, retry_interval: Duration, shutdown: CancellationToken) {
        let mut retry = tokio::time::interval(retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            retry_interval_ms = retry_interval.as_millis() as u64,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Dispatcher stopping");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = retry.tick() => {}
            }

            let dispatched = self.dispatch_pending();
            if dispatched > 0 {
                tracing::debug!(dispatched, "Dispatch pass complete");
            }
        }
    }
}
