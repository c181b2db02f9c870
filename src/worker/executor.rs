use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::protocol::Message;
use crate::scheduler::job::{
    ItemStatus, Job, JobItem, JobOutcome, JobResultItem, JobSpecification, ValueSpecification,
};
use crate::worker::blacklist::{FunctionBlacklistMaintainer, FunctionBlacklistQuery, NoBlacklist};
use crate::worker::statistics::InvocationStatistics;

/// Failure reason for an item stopped by its execution time limit.
pub const EXECUTION_TIME_EXCEEDED: &str = "execution time exceeded";

/// Runs the computation functions of one node.
#[async_trait]
pub trait JobInvoker: Send + Sync + 'static {
    /// Load the function repository at `version`. Called on every Init.
    async fn reload(&self, function_repository_version: i64) -> Result<()>;

    /// Execute one item. An `Err` is reported as a failed item, not a failed job.
    async fn invoke(&self, item: &JobItem, context: &InvocationContext) -> Result<ItemStatus>;
}

/// Issues dependent-value queries for one connection and routes the replies.
#[derive(Debug, Clone)]
pub struct DependencyRequester {
    inner: Arc<RequesterInner>,
}

#[derive(Debug)]
struct RequesterInner {
    next_correlation_id: AtomicI64,
    pending: DashMap<i64, oneshot::Sender<Vec<ValueSpecification>>>,
    outbound: mpsc::UnboundedSender<Message>,
    deadline: Duration,
}

impl DependencyRequester {
    pub fn new(outbound: mpsc::UnboundedSender<Message>, deadline: Duration) -> Self {
        Self {
            inner: Arc::new(RequesterInner {
                next_correlation_id: AtomicI64::new(1),
                pending: DashMap::new(),
                outbound,
                deadline,
            }),
        }
    }

    /// Ask the coordinator which further values `job` needs. A missed
    /// deadline or lost connection yields an empty list.
    pub async fn request(&self, job: JobSpecification) -> Vec<ValueSpecification> {
        let correlation_id = self.inner.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id, tx);

        let sent = self.inner.outbound.send(Message::DependentValueRequest {
            correlation_id,
            job,
        });
        if sent.is_err() {
            self.inner.pending.remove(&correlation_id);
            return Vec::new();
        }

        match tokio::time::timeout(self.inner.deadline, rx).await {
            Ok(Ok(values)) => values,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                self.inner.pending.remove(&correlation_id);
                tracing::warn!(job = %job, correlation_id, "Dependent value request timed out");
                Vec::new()
            }
        }
    }

    /// Deliver a reply. False if nobody is waiting for `correlation_id` any more.
    pub fn complete(&self, correlation_id: i64, values: Vec<ValueSpecification>) -> bool {
        match self.inner.pending.remove(&correlation_id) {
            Some((_, tx)) => tx.send(values).is_ok(),
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }
}

/// What an invoked function can see of the job it runs in.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    job: JobSpecification,
    requester: DependencyRequester,
}

impl InvocationContext {
    pub fn new(job: JobSpecification, requester: DependencyRequester) -> Self {
        Self { job, requester }
    }

    pub fn job(&self) -> &JobSpecification {
        &self.job
    }

    /// Values discovered mid-execution that this job additionally needs.
    pub async fn dependent_values(&self) -> Vec<ValueSpecification> {
        self.requester.request(self.job).await
    }
}

/// Per-item safeguards applied while a job runs: an optional execution time
/// limit and a function blacklist.
#[derive(Clone)]
pub struct ExecutionGuards {
    max_item_execution: Option<Duration>,
    blacklist: Arc<dyn FunctionBlacklistQuery>,
    failures: Arc<dyn FunctionBlacklistMaintainer>,
}

impl Default for ExecutionGuards {
    fn default() -> Self {
        Self {
            max_item_execution: None,
            blacklist: Arc::new(NoBlacklist),
            failures: Arc::new(NoBlacklist),
        }
    }
}

impl std::fmt::Debug for ExecutionGuards {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGuards")
            .field("max_item_execution", &self.max_item_execution)
            .finish_non_exhaustive()
    }
}

impl ExecutionGuards {
    pub fn with_max_item_execution(mut self, limit: Option<Duration>) -> Self {
        self.max_item_execution = limit;
        self
    }

    pub fn with_blacklist(
        mut self,
        query: Arc<dyn FunctionBlacklistQuery>,
        maintainer: Arc<dyn FunctionBlacklistMaintainer>,
    ) -> Self {
        self.blacklist = query;
        self.failures = maintainer;
        self
    }

    pub fn max_item_execution(&self) -> Option<Duration> {
        self.max_item_execution
    }

    /// Invoke one item under the time limit. Errors and overruns become a
    /// failed item.
    async fn invoke(
        &self,
        invoker: &dyn JobInvoker,
        item: &JobItem,
        context: &InvocationContext,
    ) -> ItemStatus {
        let invocation = invoker.invoke(item, context);
        let result = match self.max_item_execution {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        job = %context.job(),
                        function_id = %item.function_id,
                        limit_ms = limit.as_millis() as u64,
                        "Item exceeded its execution time limit"
                    );
                    return ItemStatus::Failure(EXECUTION_TIME_EXCEEDED.to_string());
                }
            },
            None => invocation.await,
        };
        match result {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    job = %context.job(),
                    function_id = %item.function_id,
                    error = %e,
                    "Item invocation failed"
                );
                ItemStatus::Failure(e.to_string())
            }
        }
    }
}

/// Run every item of `job` in order.
///
/// An item whose inputs include an output of an earlier item that did not
/// succeed is not invoked and reports those inputs as missing. Blacklisted
/// items are suppressed without being invoked.
pub async fn execute_job(
    job: Arc<Job>,
    invoker: Arc<dyn JobInvoker>,
    statistics: Arc<InvocationStatistics>,
    guards: ExecutionGuards,
    context: InvocationContext,
) -> JobOutcome {
    let run = AssertUnwindSafe(execute_items(
        &job,
        invoker.as_ref(),
        &statistics,
        &guards,
        &context,
    ));
    match run.catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::error!(job = %job.specification, "Job execution panicked");
            JobOutcome::failed("job execution panicked")
        }
    }
}

async fn execute_items(
    job: &Job,
    invoker: &dyn JobInvoker,
    statistics: &InvocationStatistics,
    guards: &ExecutionGuards,
    context: &InvocationContext,
) -> JobOutcome {
    let started = Instant::now();
    let mut unavailable: BTreeSet<ValueSpecification> = BTreeSet::new();
    let mut results = Vec::with_capacity(job.items.len());

    for item in &job.items {
        let missing: BTreeSet<ValueSpecification> =
            item.inputs.intersection(&unavailable).cloned().collect();
        if !missing.is_empty() {
            tracing::debug!(
                job = %job.specification,
                function_id = %item.function_id,
                missing = missing.len(),
                "Skipping item with missing inputs"
            );
            unavailable.extend(item.outputs.iter().cloned());
            results.push(JobResultItem {
                function_id: item.function_id.clone(),
                status: ItemStatus::MissingInputs(missing),
            });
            continue;
        }

        if guards.blacklist.is_blacklisted(item) {
            tracing::debug!(
                job = %job.specification,
                function_id = %item.function_id,
                "Item suppressed by blacklist"
            );
            unavailable.extend(item.outputs.iter().cloned());
            results.push(JobResultItem {
                function_id: item.function_id.clone(),
                status: ItemStatus::Suppressed,
            });
            continue;
        }

        let invoked = Instant::now();
        let status = guards.invoke(invoker, item, context).await;
        statistics.record(&item.function_id, invoked.elapsed());
        if matches!(status, ItemStatus::Failure(_)) {
            guards.failures.failed_item(item);
        }

        if status != ItemStatus::Success {
            unavailable.extend(item.outputs.iter().cloned());
        }
        results.push(JobResultItem {
            function_id: item.function_id.clone(),
            status,
        });
    }

    let duration = started.elapsed();
    tracing::info!(
        job = %job.specification,
        items = results.len(),
        failed = results.iter().filter(|r| !r.is_success()).count(),
        duration_ms = duration.as_millis() as u64,
        "Job completed"
    );
    JobOutcome::completed(results, duration)
}

/// Invoker that simulates work by sleeping. Used by the `node` binary and demos.
#[derive(Debug, Clone)]
pub struct SimulatedInvoker {
    item_duration: Duration,
    failure_rate: f64,
    query_dependencies: bool,
}

impl Default for SimulatedInvoker {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl SimulatedInvoker {
    pub fn new(item_duration: Duration) -> Self {
        Self {
            item_duration,
            failure_rate: 0.0,
            query_dependencies: false,
        }
    }

    /// Fraction of items, in `[0, 1]`, that report failure.
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    /// Ask the coordinator for dependent values before each item.
    pub fn with_dependency_queries(mut self, enabled: bool) -> Self {
        self.query_dependencies = enabled;
        self
    }
}

#[async_trait]
impl JobInvoker for SimulatedInvoker {
    async fn reload(&self, function_repository_version: i64) -> Result<()> {
        tracing::info!(version = function_repository_version, "Function repository loaded");
        Ok(())
    }

    async fn invoke(&self, item: &JobItem, context: &InvocationContext) -> Result<ItemStatus> {
        if self.query_dependencies {
            let values = context.dependent_values().await;
            tracing::debug!(
                job = %context.job(),
                function_id = %item.function_id,
                values = values.len(),
                "Dependent values received"
            );
        }
        tokio::time::sleep(self.item_duration).await;
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            return Ok(ItemStatus::Failure(format!(
                "simulated failure in {}",
                item.function_id
            )));
        }
        Ok(ItemStatus::Success)
    }
}
