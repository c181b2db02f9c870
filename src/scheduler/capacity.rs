use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::AdmissionPolicy;
use crate::error::{GridError, Result};
use crate::protocol::{Message, Outbox};
use crate::scheduler::job::{Job, JobSpecification};
use crate::scheduler::version::RepositoryVersion;

pub type NodeId = String;

/// Version a node holds before it has acknowledged any Init.
pub const UNACKNOWLEDGED_VERSION: i64 = -1;

/// Per-connection state of one calculation node.
#[derive(Debug)]
pub struct NodeSession {
    pub node_id: NodeId,
    /// Last advertised capacity; overwritten by every Ready.
    pub capacity: i64,
    pub in_flight: HashSet<JobSpecification>,
    pub acked_version: i64,
    /// Version carried by the most recent Init sent to the node.
    pub sent_version: i64,
    pub cost_scale: f64,
    pub connected_at: DateTime<Utc>,
    /// Set once the node is torn down; nothing may be dispatched afterwards.
    pub closed: bool,
    outbox: Outbox,
}

impl NodeSession {
    fn new(node_id: NodeId, outbox: Outbox) -> Self {
        Self {
            node_id,
            capacity: 0,
            in_flight: HashSet::new(),
            acked_version: UNACKNOWLEDGED_VERSION,
            sent_version: UNACKNOWLEDGED_VERSION,
            cost_scale: 1.0,
            connected_at: Utc::now(),
            closed: false,
            outbox,
        }
    }

    pub fn free_capacity(&self) -> i64 {
        self.capacity - self.in_flight.len() as i64
    }

    /// Acknowledged the current repository version, open, and has a free slot.
    pub fn is_eligible(&self, current_version: i64) -> bool {
        !self.closed && self.acked_version == current_version && self.free_capacity() > 0
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Send Init for `version` unless a newer one already went out.
    pub(crate) fn send_init(&mut self, version: i64) -> bool {
        if self.closed || version <= self.sent_version {
            return false;
        }
        self.sent_version = version;
        self.outbox.send(Message::Init {
            function_repository_version: version,
        })
    }

    fn snapshot(&self, current_version: i64) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.node_id.clone(),
            capacity: self.capacity,
            in_flight: self.in_flight.len(),
            acked_version: self.acked_version,
            cost_scale: self.cost_scale,
            eligible: self.is_eligible(current_version),
            connected_at: self.connected_at,
        }
    }
}

/// Read-only view of a session for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub capacity: i64,
    pub in_flight: usize,
    pub acked_version: i64,
    pub cost_scale: f64,
    pub eligible: bool,
    pub connected_at: DateTime<Utc>,
}

pub type SharedSession = Arc<Mutex<NodeSession>>;

/// Aggregates all node sessions and decides where the next job goes.
///
/// The session map is write-locked only on connect and disconnect; each
/// session has its own lock so dispatch decisions for different nodes stay
/// independent.
#[derive(Debug)]
pub struct CapacityTracker {
    sessions: RwLock<HashMap<NodeId, SharedSession>>,
    version: RepositoryVersion,
    policy: AdmissionPolicy,
}

impl CapacityTracker {
    pub fn new(version: RepositoryVersion, policy: AdmissionPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            version,
            policy,
        }
    }

    pub fn current_version(&self) -> i64 {
        self.version.current()
    }

    /// Register a newly connected node. It starts unacknowledged and is sent
    /// an Init for the current version before it can receive any job.
    pub fn register_node(&self, node_id: &str, outbox: Outbox) -> Result<SharedSession> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(node_id) {
            return Err(GridError::DuplicateNode(node_id.to_string()));
        }
        let mut session = NodeSession::new(node_id.to_string(), outbox);
        session.send_init(self.version.current());
        let session = Arc::new(Mutex::new(session));
        sessions.insert(node_id.to_string(), session.clone());
        tracing::info!(node_id, "Node registered");
        Ok(session)
    }

    /// Remove a node entirely and mark its session closed. The caller owns the
    /// fate of the returned in-flight jobs.
    pub fn remove_node(&self, node_id: &str) -> Option<SharedSession> {
        let session = self.sessions.write().remove(node_id)?;
        session.lock().closed = true;
        tracing::info!(node_id, "Node removed");
        Some(session)
    }

    pub fn session(&self, node_id: &str) -> Option<SharedSession> {
        self.sessions.read().get(node_id).cloned()
    }

    pub fn sessions(&self) -> Vec<SharedSession> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Overwrite the advertised capacity. Readiness after an Init is the
    /// acknowledgement of that Init's version.
    pub fn on_ready(&self, node_id: &str, capacity: i64) -> Result<()> {
        let session = self
            .session(node_id)
            .ok_or_else(|| GridError::NodeNotFound(node_id.to_string()))?;
        let mut session = session.lock();
        session.capacity = capacity.max(0);
        if session.acked_version != session.sent_version {
            tracing::info!(
                node_id,
                version = session.sent_version,
                "Node acknowledged function repository version"
            );
        }
        session.acked_version = session.sent_version;
        tracing::debug!(node_id, capacity, "Node ready");
        Ok(())
    }

    /// Store the latest invocation cost scale. Non-finite or non-positive
    /// factors are ignored.
    pub fn on_scaling(&self, node_id: &str, factor: f64) -> Result<()> {
        let session = self
            .session(node_id)
            .ok_or_else(|| GridError::NodeNotFound(node_id.to_string()))?;
        if !factor.is_finite() || factor <= 0.0 {
            tracing::warn!(node_id, factor, "Ignoring invalid invocation cost scale");
            return Ok(());
        }
        session.lock().cost_scale = factor;
        tracing::debug!(node_id, factor, "Node cost scale updated");
        Ok(())
    }

    /// Pick the node for `job`: largest cost-scaled free capacity among nodes
    /// at the current repository version, ties to the fewest in-flight jobs
    /// and then the lowest node id. Never blocks on I/O.
    pub fn select_node(&self, _job: &Job) -> Option<NodeId> {
        let current = self.version.current();
        let sessions = self.sessions.read();
        let mut best: Option<Candidate> = None;
        for session in sessions.values() {
            let session = session.lock();
            if !session.is_eligible(current) {
                continue;
            }
            let free = session.free_capacity() as f64;
            let score = if self.policy.cost_scaled {
                free / session.cost_scale
            } else {
                free
            };
            let candidate = Candidate {
                score,
                in_flight: session.in_flight.len(),
                node_id: session.node_id.clone(),
            };
            if best.as_ref().map_or(true, |b| candidate.beats(b)) {
                best = Some(candidate);
            }
        }
        best.map(|c| c.node_id)
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let current = self.version.current();
        let mut nodes: Vec<NodeSnapshot> = self
            .sessions
            .read()
            .values()
            .map(|s| s.lock().snapshot(current))
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }
}

struct Candidate {
    score: f64,
    in_flight: usize,
    node_id: NodeId,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        match self.score.partial_cmp(&other.score) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) => false,
            _ => match self.in_flight.cmp(&other.in_flight) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => self.node_id < other.node_id,
            },
        }
    }
}
