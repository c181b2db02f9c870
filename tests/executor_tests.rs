use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use calc_grid::error::{GridError, Result};
use calc_grid::protocol::Message;
use calc_grid::scheduler::{
    ItemStatus, Job, JobItem, JobOutcome, JobSpecification, ValueSpecification,
};
use calc_grid::worker::{
    execute_job, DependencyRequester, ExecutionGuards, FailureCountBlacklist, InvocationContext,
    InvocationStatistics, JobInvoker, SimulatedInvoker, EXECUTION_TIME_EXCEEDED,
};

/// Invoker whose behaviour is keyed by function id.
#[derive(Default)]
struct ScriptedInvoker {
    invoked: Mutex<Vec<String>>,
}

#[async_trait]
impl JobInvoker for ScriptedInvoker {
    async fn reload(&self, _version: i64) -> Result<()> {
        Ok(())
    }

    async fn invoke(&self, item: &JobItem, _context: &InvocationContext) -> Result<ItemStatus> {
        self.invoked.lock().push(item.function_id.clone());
        match item.function_id.as_str() {
            "fail" => Ok(ItemStatus::Failure("bad curve".to_string())),
            "error" => Err(GridError::Internal("invoker crashed".to_string())),
            "panic" => panic!("function blew up"),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ItemStatus::Success)
            }
            _ => Ok(ItemStatus::Success),
        }
    }
}

fn context(spec: JobSpecification) -> (InvocationContext, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let requester = DependencyRequester::new(tx, Duration::from_millis(100));
    (InvocationContext::new(spec, requester), rx)
}

fn value(name: &str) -> ValueSpecification {
    ValueSpecification::new("trade-1", name)
}

fn items(outcome: &JobOutcome) -> Vec<ItemStatus> {
    match outcome {
        JobOutcome::Completed { items, .. } => items.iter().map(|i| i.status.clone()).collect(),
        other => panic!("expected Completed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_all_items_succeed() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let job = Job::new(spec, 0)
        .with_item(JobItem::new("a", "trade-1").with_output(value("A")))
        .with_item(JobItem::new("b", "trade-1").with_input(value("A")));
    let invoker = Arc::new(ScriptedInvoker::default());
    let statistics = Arc::new(InvocationStatistics::default());
    let (ctx, _rx) = context(spec);

    let outcome = execute_job(
        Arc::new(job),
        invoker.clone(),
        statistics.clone(),
        ExecutionGuards::default(),
        ctx,
    )
    .await;

    assert_eq!(items(&outcome), vec![ItemStatus::Success, ItemStatus::Success]);
    assert_eq!(*invoker.invoked.lock(), vec!["a", "b"]);
    assert_eq!(statistics.sample_count(), 2);
}

#[tokio::test]
async fn test_failed_output_makes_downstream_inputs_missing() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let job = Job::new(spec, 0)
        .with_item(JobItem::new("fail", "trade-1").with_output(value("Curve")))
        .with_item(
            JobItem::new("pv", "trade-1")
                .with_input(value("Curve"))
                .with_input(value("Spot"))
                .with_output(value("PV")),
        )
        .with_item(JobItem::new("greeks", "trade-1").with_input(value("PV")))
        .with_item(JobItem::new("independent", "trade-2"));
    let invoker = Arc::new(ScriptedInvoker::default());
    let (ctx, _rx) = context(spec);

    let outcome = execute_job(
        Arc::new(job),
        invoker.clone(),
        Arc::new(InvocationStatistics::default()),
        ExecutionGuards::default(),
        ctx,
    )
    .await;

    assert_eq!(
        items(&outcome),
        vec![
            ItemStatus::Failure("bad curve".to_string()),
            ItemStatus::MissingInputs(BTreeSet::from([value("Curve")])),
            ItemStatus::MissingInputs(BTreeSet::from([value("PV")])),
            ItemStatus::Success,
        ]
    );
    // Skipped items are never invoked.
    assert_eq!(*invoker.invoked.lock(), vec!["fail", "independent"]);
}

#[tokio::test]
async fn test_invoker_error_fails_only_that_item() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let job = Job::new(spec, 0)
        .with_item(JobItem::new("error", "trade-1"))
        .with_item(JobItem::new("ok", "trade-1"));
    let (ctx, _rx) = context(spec);

    let outcome = execute_job(
        Arc::new(job),
        Arc::new(ScriptedInvoker::default()),
        Arc::new(InvocationStatistics::default()),
        ExecutionGuards::default(),
        ctx,
    )
    .await;

    let statuses = items(&outcome);
    assert!(matches!(&statuses[0], ItemStatus::Failure(reason) if reason.contains("invoker crashed")));
    assert_eq!(statuses[1], ItemStatus::Success);
}

#[tokio::test]
async fn test_panicking_function_fails_the_job() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let job = Job::new(spec, 0).with_item(JobItem::new("panic", "trade-1"));
    let (ctx, _rx) = context(spec);

    let outcome = execute_job(
        Arc::new(job),
        Arc::new(ScriptedInvoker::default()),
        Arc::new(InvocationStatistics::default()),
        ExecutionGuards::default(),
        ctx,
    )
    .await;

    assert!(matches!(outcome, JobOutcome::Failed { .. }));
}

#[tokio::test]
async fn test_dependency_request_routes_reply() {
    let spec = JobSpecification::new(Uuid::new_v4(), 3, 9);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let requester = DependencyRequester::new(tx, Duration::from_secs(5));
    let ctx = InvocationContext::new(spec, requester.clone());

    let waiting = tokio::spawn(async move { ctx.dependent_values().await });

    let correlation_id = match rx.recv().await {
        Some(Message::DependentValueRequest {
            correlation_id,
            job,
        }) => {
            assert_eq!(job, spec);
            correlation_id
        }
        other => panic!("expected DependentValueRequest, got {:?}", other),
    };
    assert_eq!(requester.pending(), 1);
    assert!(requester.complete(correlation_id, vec![value("Spot")]));

    assert_eq!(waiting.await.unwrap(), vec![value("Spot")]);
    assert_eq!(requester.pending(), 0);
    // A second reply for the same id has nobody to go to.
    assert!(!requester.complete(correlation_id, vec![]));
}

#[tokio::test]
async fn test_dependency_request_deadline_yields_empty() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let (ctx, mut rx) = context(spec);

    let values = ctx.dependent_values().await;

    assert!(values.is_empty());
    assert!(matches!(
        rx.try_recv(),
        Ok(Message::DependentValueRequest { .. })
    ));
}

#[tokio::test]
async fn test_simulated_invoker_failure_rate() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let job = (0..5).fold(Job::new(spec, 0), |job, i| {
        job.with_item(JobItem::new(format!("f{}", i), "trade-1"))
    });
    let (ctx, _rx) = context(spec);
    let invoker = SimulatedInvoker::new(Duration::from_millis(1)).with_failure_rate(1.0);

    let outcome = execute_job(
        Arc::new(job),
        Arc::new(invoker),
        Arc::new(InvocationStatistics::default()),
        ExecutionGuards::default(),
        ctx,
    )
    .await;

    assert!(items(&outcome)
        .iter()
        .all(|s| matches!(s, ItemStatus::Failure(_))));
}

#[tokio::test]
async fn test_item_over_time_limit_fails_and_job_continues() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let job = Job::new(spec, 0)
        .with_item(JobItem::new("slow", "trade-1").with_output(value("PV")))
        .with_item(JobItem::new("greeks", "trade-1").with_input(value("PV")))
        .with_item(JobItem::new("ok", "trade-2"));
    let invoker = Arc::new(ScriptedInvoker::default());
    let guards =
        ExecutionGuards::default().with_max_item_execution(Some(Duration::from_millis(50)));
    let (ctx, _rx) = context(spec);
    let started = tokio::time::Instant::now();

    let outcome = execute_job(
        Arc::new(job),
        invoker.clone(),
        Arc::new(InvocationStatistics::default()),
        guards,
        ctx,
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        items(&outcome),
        vec![
            ItemStatus::Failure(EXECUTION_TIME_EXCEEDED.to_string()),
            ItemStatus::MissingInputs(BTreeSet::from([value("PV")])),
            ItemStatus::Success,
        ]
    );
    assert_eq!(*invoker.invoked.lock(), vec!["slow", "ok"]);
}

#[tokio::test]
async fn test_blacklisted_function_is_suppressed() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let blacklist = Arc::new(FailureCountBlacklist::new(2));
    let guards = ExecutionGuards::default().with_blacklist(blacklist.clone(), blacklist.clone());
    // The second failure reaches the threshold midway through the job.
    let job = Job::new(spec, 0)
        .with_item(JobItem::new("fail", "trade-1"))
        .with_item(JobItem::new("fail", "trade-2"))
        .with_item(JobItem::new("fail", "trade-3").with_output(value("Curve")))
        .with_item(JobItem::new("pv", "trade-3").with_input(value("Curve")));
    let invoker = Arc::new(ScriptedInvoker::default());
    let (ctx, _rx) = context(spec);

    let outcome = execute_job(
        Arc::new(job),
        invoker.clone(),
        Arc::new(InvocationStatistics::default()),
        guards,
        ctx,
    )
    .await;

    assert_eq!(
        items(&outcome),
        vec![
            ItemStatus::Failure("bad curve".to_string()),
            ItemStatus::Failure("bad curve".to_string()),
            ItemStatus::Suppressed,
            ItemStatus::MissingInputs(BTreeSet::from([value("Curve")])),
        ]
    );
    assert_eq!(*invoker.invoked.lock(), vec!["fail", "fail"]);
    assert_eq!(blacklist.failures("fail"), 2);
}

#[tokio::test]
async fn test_timeouts_and_errors_feed_the_blacklist() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let blacklist = Arc::new(FailureCountBlacklist::new(5));
    let guards = ExecutionGuards::default()
        .with_max_item_execution(Some(Duration::from_millis(20)))
        .with_blacklist(blacklist.clone(), blacklist.clone());
    let job = Job::new(spec, 0)
        .with_item(JobItem::new("slow", "trade-1"))
        .with_item(JobItem::new("error", "trade-1"))
        .with_item(JobItem::new("ok", "trade-1"));
    let (ctx, _rx) = context(spec);

    execute_job(
        Arc::new(job),
        Arc::new(ScriptedInvoker::default()),
        Arc::new(InvocationStatistics::default()),
        guards,
        ctx,
    )
    .await;

    assert_eq!(blacklist.failures("slow"), 1);
    assert_eq!(blacklist.failures("error"), 1);
    assert_eq!(blacklist.failures("ok"), 0);
}
