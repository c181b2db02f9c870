use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use calc_grid::error::{GridError, Result};
use calc_grid::protocol::{Message, Outbox, OutboxReceiver};
use calc_grid::scheduler::{
    DependentValueResolver, JobSpecification, ResolverProxy, StaticResolver, ValueSpecification,
};

struct SlowResolver(Duration);

#[async_trait]
impl DependentValueResolver for SlowResolver {
    async fn resolve(&self, _job: &JobSpecification) -> Result<Vec<ValueSpecification>> {
        tokio::time::sleep(self.0).await;
        Ok(vec![ValueSpecification::new("late", "Value")])
    }
}

struct FailingResolver;

#[async_trait]
impl DependentValueResolver for FailingResolver {
    async fn resolve(&self, job: &JobSpecification) -> Result<Vec<ValueSpecification>> {
        Err(GridError::Resolver(format!("graph for {} unavailable", job)))
    }
}

async fn next_reply(rx: &mut OutboxReceiver) -> (i64, Vec<ValueSpecification>) {
    match tokio::time::timeout(Duration::from_secs(2), rx.next()).await {
        Ok(Some(Message::DependentValueReply {
            correlation_id,
            values,
        })) => (correlation_id, values),
        other => panic!("expected DependentValueReply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reply_carries_resolved_values() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 4);
    let values = vec![
        ValueSpecification::new("EUR", "DiscountCurve"),
        ValueSpecification::new("USD", "DiscountCurve"),
    ];
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert(spec, values.clone());
    let proxy = ResolverProxy::new(resolver, Duration::from_secs(1));
    let (outbox, mut rx) = Outbox::channel();

    assert!(proxy.on_request("A", 17, spec, outbox));

    assert_eq!(next_reply(&mut rx).await, (17, values));
    assert_eq!(proxy.outstanding(), 0);
}

#[tokio::test]
async fn test_unknown_job_gets_empty_reply() {
    let proxy = ResolverProxy::new(Arc::new(StaticResolver::new()), Duration::from_secs(1));
    let (outbox, mut rx) = Outbox::channel();

    proxy.on_request("A", 1, JobSpecification::new(Uuid::new_v4(), 1, 1), outbox);

    assert_eq!(next_reply(&mut rx).await, (1, vec![]));
}

#[tokio::test]
async fn test_deadline_miss_yields_empty_reply() {
    let proxy = ResolverProxy::new(
        Arc::new(SlowResolver(Duration::from_secs(30))),
        Duration::from_millis(50),
    );
    let (outbox, mut rx) = Outbox::channel();
    let started = tokio::time::Instant::now();

    proxy.on_request("A", 5, JobSpecification::new(Uuid::new_v4(), 1, 1), outbox);
    assert_eq!(proxy.outstanding(), 1);

    assert_eq!(next_reply(&mut rx).await, (5, vec![]));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn test_resolver_error_yields_empty_reply() {
    let proxy = ResolverProxy::new(Arc::new(FailingResolver), Duration::from_secs(1));
    let (outbox, mut rx) = Outbox::channel();

    proxy.on_request("A", 2, JobSpecification::new(Uuid::new_v4(), 1, 1), outbox);

    assert_eq!(next_reply(&mut rx).await, (2, vec![]));
}

#[tokio::test]
async fn test_duplicate_outstanding_request_ignored() {
    let proxy = ResolverProxy::new(
        Arc::new(SlowResolver(Duration::from_millis(100))),
        Duration::from_secs(1),
    );
    let (outbox, mut rx) = Outbox::channel();
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);

    assert!(proxy.on_request("A", 9, spec, outbox.clone()));
    assert!(!proxy.on_request("A", 9, spec, outbox.clone()));
    // Same correlation id from another node is a different request.
    assert!(proxy.on_request("B", 9, spec, outbox.clone()));

    next_reply(&mut rx).await;
    next_reply(&mut rx).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.next())
            .await
            .is_err(),
        "only one reply per outstanding request"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_accept_exactly_one() {
    let proxy = ResolverProxy::new(
        Arc::new(SlowResolver(Duration::from_millis(200))),
        Duration::from_secs(1),
    );
    let (outbox, mut rx) = Outbox::channel();
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let barrier = Arc::new(tokio::sync::Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let proxy = proxy.clone();
            let outbox = outbox.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                proxy.on_request("A", 5, spec, outbox)
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(proxy.outstanding(), 1);

    next_reply(&mut rx).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.next())
            .await
            .is_err(),
        "only one reply for concurrent duplicates"
    );
}

#[tokio::test]
async fn test_slow_resolution_does_not_block_other_requests() {
    let spec = JobSpecification::new(Uuid::new_v4(), 1, 1);
    let proxy = ResolverProxy::new(
        Arc::new(SlowResolver(Duration::from_millis(300))),
        Duration::from_secs(2),
    );
    let fast = ResolverProxy::new(Arc::new(StaticResolver::new()), Duration::from_secs(2));
    let (outbox, mut rx) = Outbox::channel();

    proxy.on_request("A", 1, spec, outbox.clone());
    fast.on_request("A", 2, spec, outbox);

    assert_eq!(next_reply(&mut rx).await.0, 2);
    assert_eq!(next_reply(&mut rx).await.0, 1);
}
