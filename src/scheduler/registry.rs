use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{GridError, Result};
use crate::scheduler::capacity::NodeId;
use crate::scheduler::job::{Job, JobOutcome, JobSpecification};

const DEFAULT_MAX_JOBS: usize = 100_000;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Dispatched,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }

    /// Dispatched or executing: the job occupies a slot on its assigned node.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobState::Dispatched | JobState::Executing)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Dispatched => write!(f, "dispatched"),
            JobState::Executing => write!(f, "executing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Cancelled => write!(f, "cancelled"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle of one job, independent of which node holds it.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub specification: JobSpecification,
    pub job: Arc<Job>,
    pub state: JobState,
    pub assigned_node: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<JobOutcome>,
}

impl JobRecord {
    fn new(job: Job) -> Self {
        Self {
            specification: job.specification,
            job: Arc::new(job),
            state: JobState::Queued,
            assigned_node: None,
            created_at: Utc::now(),
            completed_at: None,
            outcome: None,
        }
    }

    fn terminate(&mut self, state: JobState) {
        self.state = state;
        self.completed_at = Some(Utc::now());
    }
}

/// Lifecycle transition published upward.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub specification: JobSpecification,
    pub state: JobState,
    pub node: Option<NodeId>,
    pub at: DateTime<Utc>,
}

/// What happened to a result a node reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    Applied(JobState),
    /// Unknown job, already terminal, or held by another node.
    Discarded,
}

/// Authoritative map of job specification to lifecycle state.
///
/// Records live in a sharded map so transitions on different jobs never
/// contend on one lock. Queued specifications are additionally kept in FIFO
/// order for the dispatcher.
#[derive(Debug)]
pub struct JobRegistry {
    records: DashMap<JobSpecification, JobRecord>,
    ready: Mutex<VecDeque<JobSpecification>>,
    max_jobs: usize,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: DashMap::new(),
            ready: Mutex::new(VecDeque::new()),
            max_jobs,
            events,
        }
    }

    /// Subscribe to lifecycle transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn publish(&self, specification: JobSpecification, state: JobState, node: Option<NodeId>) {
        tracing::debug!(job = %specification, state = %state, node = ?node, "Job state changed");
        // No subscribers is fine.
        let _ = self.events.send(JobEvent {
            specification,
            state,
            node,
            at: Utc::now(),
        });
    }

    /// Insert a new `Queued` record. Never blocks on dispatch.
    pub fn submit(&self, job: Job) -> Result<JobSpecification> {
        if self.records.len() >= self.max_jobs {
            return Err(GridError::RegistryFull(self.max_jobs));
        }
        let spec = job.specification;
        match self.records.entry(spec) {
            Entry::Occupied(_) => return Err(GridError::DuplicateJob(spec)),
            Entry::Vacant(slot) => {
                slot.insert(JobRecord::new(job));
            }
        }
        self.ready.lock().push_back(spec);
        self.publish(spec, JobState::Queued, None);
        Ok(spec)
    }

    /// Put a failed job back in the queue. Re-dispatch after failure is always
    /// the caller's decision.
    pub fn resubmit(&self, spec: &JobSpecification) -> Result<()> {
        {
            let mut record = self
                .records
                .get_mut(spec)
                .ok_or(GridError::JobNotFound(*spec))?;
            if record.state != JobState::Failed {
                return Err(GridError::Internal(format!(
                    "job {} is {}, only failed jobs can be resubmitted",
                    spec, record.state
                )));
            }
            record.state = JobState::Queued;
            record.assigned_node = None;
            record.completed_at = None;
            record.outcome = None;
        }
        self.ready.lock().push_back(*spec);
        self.publish(*spec, JobState::Queued, None);
        Ok(())
    }

    pub fn get(&self, spec: &JobSpecification) -> Option<JobRecord> {
        self.records.get(spec).map(|r| r.clone())
    }

    pub fn state(&self, spec: &JobSpecification) -> Option<JobState> {
        self.records.get(spec).map(|r| r.state)
    }

    pub fn assigned_node(&self, spec: &JobSpecification) -> Option<NodeId> {
        self.records.get(spec).and_then(|r| r.assigned_node.clone())
    }

    /// Next queued specification in submission order.
    pub(crate) fn pop_ready(&self) -> Option<JobSpecification> {
        self.ready.lock().pop_front()
    }

    /// Return a specification to the head of the queue after a failed admission.
    pub(crate) fn requeue_front(&self, spec: JobSpecification) {
        self.ready.lock().push_front(spec);
    }

    /// Number of records still waiting for a node.
    pub fn queued_len(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state == JobState::Queued)
            .count()
    }

    /// `Queued -> Dispatched`. Returns the job to send, or `None` if the record
    /// is no longer queued (for example cancelled while waiting).
    pub(crate) fn mark_dispatched(&self, spec: &JobSpecification, node: &str) -> Option<Arc<Job>> {
        let job = {
            let mut record = self.records.get_mut(spec)?;
            if record.state != JobState::Queued {
                return None;
            }
            record.state = JobState::Dispatched;
            record.assigned_node = Some(node.to_string());
            record.job.clone()
        };
        self.publish(*spec, JobState::Dispatched, Some(node.to_string()));
        Some(job)
    }

    /// Undo a dispatch whose Execute could not be delivered.
    pub(crate) fn revert_dispatch(&self, spec: &JobSpecification) {
        let reverted = match self.records.get_mut(spec) {
            Some(mut record) if record.state == JobState::Dispatched => {
                record.state = JobState::Queued;
                record.assigned_node = None;
                true
            }
            _ => false,
        };
        if reverted {
            self.requeue_front(*spec);
            self.publish(*spec, JobState::Queued, None);
        }
    }

    /// `Dispatched -> Executing` when the node acknowledges the job.
    pub fn mark_executing(&self, spec: &JobSpecification, node: &str) -> bool {
        let applied = match self.records.get_mut(spec) {
            Some(mut record)
                if record.state == JobState::Dispatched
                    && record.assigned_node.as_deref() == Some(node) =>
            {
                record.state = JobState::Executing;
                true
            }
            _ => false,
        };
        if applied {
            self.publish(*spec, JobState::Executing, Some(node.to_string()));
        }
        applied
    }

    /// Apply a node-reported outcome. First report wins: anything already
    /// terminal, unknown, or assigned elsewhere is discarded.
    pub(crate) fn finish(
        &self,
        spec: &JobSpecification,
        node: &str,
        outcome: JobOutcome,
    ) -> ResultDisposition {
        let state = {
            let Some(mut record) = self.records.get_mut(spec) else {
                return ResultDisposition::Discarded;
            };
            if !record.state.is_in_flight() || record.assigned_node.as_deref() != Some(node) {
                return ResultDisposition::Discarded;
            }
            let state = match outcome {
                JobOutcome::Completed { .. } => JobState::Completed,
                JobOutcome::Failed { .. } => JobState::Failed,
            };
            record.outcome = Some(outcome);
            record.terminate(state);
            state
        };
        self.publish(*spec, state, Some(node.to_string()));
        ResultDisposition::Applied(state)
    }

    /// Fail an in-flight job held by `node`, e.g. on disconnect.
    pub(crate) fn fail(&self, spec: &JobSpecification, node: &str, reason: &str) -> bool {
        self.finish(spec, node, JobOutcome::failed(reason))
            == ResultDisposition::Applied(JobState::Failed)
    }

    /// `Queued -> Cancelled`. False if the record is not queued any more.
    pub(crate) fn cancel_queued(&self, spec: &JobSpecification) -> bool {
        let applied = match self.records.get_mut(spec) {
            Some(mut record) if record.state == JobState::Queued => {
                record.terminate(JobState::Cancelled);
                true
            }
            _ => false,
        };
        if applied {
            self.ready.lock().retain(|queued| queued != spec);
            self.publish(*spec, JobState::Cancelled, None);
        }
        applied
    }

    /// `Dispatched|Executing -> Cancelled` for a job held by `node`. The
    /// caller holds that node's session lock.
    pub(crate) fn cancel_in_flight(&self, spec: &JobSpecification, node: &str) -> bool {
        let applied = match self.records.get_mut(spec) {
            Some(mut record)
                if record.state.is_in_flight() && record.assigned_node.as_deref() == Some(node) =>
            {
                record.terminate(JobState::Cancelled);
                true
            }
            _ => false,
        };
        if applied {
            self.publish(*spec, JobState::Cancelled, Some(node.to_string()));
        }
        applied
    }

    /// All records sorted chronologically by creation time.
    pub fn all_records(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Non-terminal records of one cycle.
    pub fn active_in_cycle(&self, session_id: uuid::Uuid, cycle_id: u64) -> Vec<JobSpecification> {
        self.records
            .iter()
            .filter(|r| {
                r.specification.session_id == session_id
                    && r.specification.cycle_id == cycle_id
                    && !r.state.is_terminal()
            })
            .map(|r| r.specification)
            .collect()
    }

    /// Records currently holding a slot on `node`.
    pub fn in_flight_on(&self, node: &str) -> Vec<JobSpecification> {
        self.records
            .iter()
            .filter(|r| r.state.is_in_flight() && r.assigned_node.as_deref() == Some(node))
            .map(|r| r.specification)
            .collect()
    }

    /// Drop terminal records that finished before `cutoff`. Returns the number removed.
    pub fn purge_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            !(record.state.is_terminal() && record.completed_at.is_some_and(|at| at < cutoff))
        });
        let purged = before.saturating_sub(self.records.len());
        self.prune_ready();
        purged
    }

    /// Drop ready-queue entries whose record is gone or no longer `Queued`.
    fn prune_ready(&self) {
        self.ready.lock().retain(|spec| {
            self.records
                .get(spec)
                .is_some_and(|record| record.state == JobState::Queued)
        });
    }

    /// Entries waiting in the FIFO ready queue. Never more than the number of
    /// `Queued` records.
    pub fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_jobs
    }
}
