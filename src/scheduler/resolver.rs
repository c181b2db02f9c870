use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::Result;
use crate::protocol::{Message, Outbox};
use crate::scheduler::capacity::NodeId;
use crate::scheduler::job::{JobSpecification, ValueSpecification};

/// The dependency-graph side that answers mid-execution queries.
#[async_trait]
pub trait DependentValueResolver: Send + Sync + 'static {
    /// Additional value specifications `job` needs. An empty list means the
    /// job has no further dependencies.
    async fn resolve(&self, job: &JobSpecification) -> Result<Vec<ValueSpecification>>;
}

/// Resolver for grids whose jobs never discover dependencies at run time.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependentValues;

#[async_trait]
impl DependentValueResolver for NoDependentValues {
    async fn resolve(&self, _job: &JobSpecification) -> Result<Vec<ValueSpecification>> {
        Ok(Vec::new())
    }
}

/// Resolver backed by a table filled in by the graph builder.
#[derive(Debug, Default)]
pub struct StaticResolver {
    values: RwLock<HashMap<JobSpecification, Vec<ValueSpecification>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: JobSpecification, values: Vec<ValueSpecification>) {
        self.values.write().insert(job, values);
    }
}

#[async_trait]
impl DependentValueResolver for StaticResolver {
    async fn resolve(&self, job: &JobSpecification) -> Result<Vec<ValueSpecification>> {
        Ok(self.values.read().get(job).cloned().unwrap_or_default())
    }
}

/// Services node-initiated dependent-value requests.
///
/// Each request is resolved on its own task, so a slow graph resolver never
/// holds up the requesting node's session or any other node. Every request
/// gets exactly one Reply: resolver failures and deadline misses degrade to an
/// empty Reply.
#[derive(Clone)]
pub struct ResolverProxy {
    resolver: Arc<dyn DependentValueResolver>,
    deadline: Duration,
    outstanding: Arc<DashMap<(NodeId, i64), ()>>,
}

impl std::fmt::Debug for ResolverProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverProxy")
            .field("deadline", &self.deadline)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

impl ResolverProxy {
    pub fn new(resolver: Arc<dyn DependentValueResolver>, deadline: Duration) -> Self {
        Self {
            resolver,
            deadline,
            outstanding: Arc::new(DashMap::new()),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Requests accepted but not yet answered.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Accept a request and answer it asynchronously on `outbox`. Returns
    /// false if the same `(node, correlation_id)` is already being resolved.
    pub fn on_request(
        &self,
        node_id: &str,
        correlation_id: i64,
        job: JobSpecification,
        outbox: Outbox,
    ) -> bool {
        let key = (node_id.to_string(), correlation_id);
        match self.outstanding.entry(key.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(node_id, correlation_id, job = %job, "Duplicate dependent value request ignored");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let proxy = self.clone();
        tokio::spawn(async move {
            let values = proxy.resolve_within_deadline(&key.0, correlation_id, &job).await;
            proxy.outstanding.remove(&key);
            if !outbox.send(Message::DependentValueReply {
                correlation_id,
                values,
            }) {
                tracing::debug!(
                    node_id = %key.0,
                    correlation_id,
                    "Node gone before dependent value reply"
                );
            }
        });
        true
    }

    async fn resolve_within_deadline(
        &self,
        node_id: &str,
        correlation_id: i64,
        job: &JobSpecification,
    ) -> Vec<ValueSpecification> {
        match tokio::time::timeout(self.deadline, self.resolver.resolve(job)).await {
            Ok(Ok(values)) => {
                tracing::debug!(
                    node_id,
                    correlation_id,
                    job = %job,
                    values = values.len(),
                    "Dependent values resolved"
                );
                values
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    node_id,
                    correlation_id,
                    job = %job,
                    error = %e,
                    "Dependent value resolution failed, replying empty"
                );
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    node_id,
                    correlation_id,
                    job = %job,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "Dependent value resolution timed out, replying empty"
                );
                Vec::new()
            }
        }
    }
}
