//! Runs a coordinator and three simulated nodes in one process, submits a
//! calculation cycle, cancels one job and changes the function repository
//! half way through.
//!
//! ```text
//! RUST_LOG=calc_grid=debug cargo run --example local_grid
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use calc_grid::config::{CoordinatorConfig, WorkerConfig};
use calc_grid::coordinator::{Coordinator, NodeListener};
use calc_grid::scheduler::{Job, JobItem, JobSpecification, JobState, StaticResolver, ValueSpecification};
use calc_grid::worker::{CalculationNode, SimulatedInvoker};

const JOBS: u64 = 24;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = CancellationToken::new();
    let session_id = Uuid::new_v4();

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert(
        JobSpecification::new(session_id, 1, 0),
        vec![ValueSpecification::new("EUR", "FxSpot")],
    );

    let listener = NodeListener::bind("127.0.0.1:0".parse()?).await?;
    let addr = listener.local_addr()?;
    let coordinator = Coordinator::new(
        CoordinatorConfig::new(addr).with_dispatch_retry_interval_ms(50),
        resolver,
    );
    let scheduler = coordinator.scheduler().clone();
    let mut events = BroadcastStream::new(scheduler.subscribe());
    tokio::spawn(coordinator.serve(listener, shutdown.clone()));

    for (i, (slots, item_ms)) in [(2, 40), (4, 40), (4, 120)].into_iter().enumerate() {
        let config = WorkerConfig::new(format!("node-{}", i + 1), addr.to_string())
            .with_slots(slots)
            .with_scaling_interval_ms(200)
            .with_reconnect_delay_ms(200);
        let invoker = SimulatedInvoker::new(Duration::from_millis(item_ms))
            .with_failure_rate(0.05)
            .with_dependency_queries(i == 0);
        tokio::spawn(CalculationNode::new(config, Arc::new(invoker)).run(shutdown.clone()));
    }

    let mut pending: HashSet<JobSpecification> = HashSet::new();
    for job_id in 0..JOBS {
        let spec = JobSpecification::new(session_id, 1, job_id);
        let spot = ValueSpecification::new(format!("trade-{}", job_id), "Spot");
        let job = Job::new(spec, 0)
            .with_item(JobItem::new("MarketData", format!("trade-{}", job_id)).with_output(spot.clone()))
            .with_item(JobItem::new("PresentValue", format!("trade-{}", job_id)).with_input(spot));
        pending.insert(scheduler.submit(job)?);
    }

    let victim = JobSpecification::new(session_id, 1, JOBS - 1);
    println!("cancel {}: {:?}", victim, scheduler.cancel(&victim));
    pending.remove(&victim);

    let mut repository_changed = false;
    while !pending.is_empty() {
        let event = match tokio::time::timeout(Duration::from_secs(10), events.next()).await {
            Ok(Some(Ok(event))) => event,
            Ok(Some(Err(lagged))) => {
                println!("event stream lagged: {}", lagged);
                continue;
            }
            Ok(None) | Err(_) => break,
        };
        if !event.state.is_terminal() {
            continue;
        }
        pending.remove(&event.specification);
        if event.state == JobState::Failed {
            // Re-queue after failure is the caller's decision; retry once.
            if scheduler.resubmit(&event.specification).is_ok() {
                pending.insert(event.specification);
            }
        }
        if !repository_changed && pending.len() < (JOBS / 2) as usize {
            repository_changed = true;
            println!("function repository now at {}", scheduler.on_repository_changed());
        }
    }

    println!();
    println!("{:<50} {:<10} NODE", "JOB", "STATE");
    for record in scheduler.registry().all_records() {
        println!(
            "{:<50} {:<10} {}",
            record.specification.to_string(),
            record.state.to_string(),
            record.assigned_node.unwrap_or_else(|| "-".to_string())
        );
    }
    println!();
    for node in scheduler.tracker().snapshot() {
        println!(
            "{} capacity={} in_flight={} version={} cost_scale={:.2}",
            node.node_id, node.capacity, node.in_flight, node.acked_version, node.cost_scale
        );
    }

    shutdown.cancel();
    Ok(())
}
