use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use calc_grid::config::{AdmissionPolicy, CoordinatorConfig, WorkerConfig};
use calc_grid::coordinator::Coordinator;
use calc_grid::scheduler::NoDependentValues;
use calc_grid::shutdown::install_shutdown_handler;
use calc_grid::worker::{CalculationNode, FailureCountBlacklist, SimulatedInvoker};

#[derive(Parser, Debug)]
#[command(name = "calc-grid")]
#[command(version)]
#[command(about = "Dispatches calculation jobs from a coordinator to a grid of nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the coordinator that nodes connect to
    Coordinator(CoordinatorArgs),

    /// Run a calculation node
    Node(NodeArgs),
}

// =============================================================================
// Coordinator Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// Address nodes connect to
    #[arg(long, default_value = "127.0.0.1:7420")]
    listen: SocketAddr,

    /// Port for the HTTP status API (optional)
    #[arg(long)]
    status_port: Option<u16>,

    /// Function repository version to start from
    #[arg(long, default_value = "0")]
    repository_version: i64,

    /// Backoff between dispatch passes when no node is eligible
    #[arg(long, default_value = "250")]
    dispatch_retry_ms: u64,

    /// Deadline for answering a node's dependent value query
    #[arg(long, default_value = "5000")]
    resolver_deadline_ms: u64,

    /// Time a new node connection has to send Hello
    #[arg(long, default_value = "5000")]
    handshake_timeout_ms: u64,

    /// Largest frame accepted from a node, in bytes
    #[arg(long, default_value = "16777216")]
    max_frame_length: usize,

    /// Maximum number of jobs held in the registry
    #[arg(long, default_value = "100000")]
    max_jobs: usize,

    /// Rank nodes by raw free capacity, ignoring their reported cost scale
    #[arg(long)]
    ignore_cost_scale: bool,
}

// =============================================================================
// Node Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Node ID (unique across the grid)
    #[arg(long)]
    node_id: String,

    /// Coordinator address (host:port)
    #[arg(long, default_value = "127.0.0.1:7420")]
    coordinator: String,

    /// Jobs this node runs concurrently
    #[arg(long, default_value = "4")]
    slots: u32,

    /// Interval between Scaling reports
    #[arg(long, default_value = "5000")]
    scaling_interval_ms: u64,

    /// How long a job waits for a dependent-value reply
    #[arg(long, default_value = "10000")]
    dependency_deadline_ms: u64,

    /// Stop a job item that runs longer than this and report it failed
    #[arg(long)]
    max_item_execution_ms: Option<u64>,

    /// Suppress a function on this node after this many failures (0 disables)
    #[arg(long, default_value = "0")]
    blacklist_after_failures: u32,

    /// Largest frame accepted from the coordinator, in bytes
    #[arg(long, default_value = "16777216")]
    max_frame_length: usize,

    /// Simulated time per job item
    #[arg(long, default_value = "50")]
    item_ms: u64,

    /// Fraction of simulated items that fail
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    /// Delay before reconnecting to the coordinator
    #[arg(long, default_value = "1000")]
    reconnect_delay_ms: u64,
}

async fn run_coordinator(args: CoordinatorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = CoordinatorConfig::new(args.listen)
        .with_initial_repository_version(args.repository_version)
        .with_dispatch_retry_interval_ms(args.dispatch_retry_ms)
        .with_resolver_deadline_ms(args.resolver_deadline_ms)
        .with_handshake_timeout_ms(args.handshake_timeout_ms)
        .with_max_frame_length(args.max_frame_length)
        .with_max_jobs(args.max_jobs)
        .with_admission(AdmissionPolicy {
            cost_scaled: !args.ignore_cost_scale,
        });
    if let Some(port) = args.status_port {
        config = config.with_status_addr(SocketAddr::new(args.listen.ip(), port));
    }

    tracing::info!(
        listen = %config.listen_addr,
        status = ?config.status_addr,
        version = config.initial_repository_version,
        "Starting coordinator"
    );

    let shutdown = install_shutdown_handler()?;
    let coordinator = Coordinator::new(config, Arc::new(NoDependentValues));
    coordinator.run(shutdown).await?;
    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = WorkerConfig::new(args.node_id, args.coordinator)
        .with_slots(args.slots)
        .with_scaling_interval_ms(args.scaling_interval_ms)
        .with_dependency_deadline_ms(args.dependency_deadline_ms)
        .with_max_frame_length(args.max_frame_length)
        .with_reconnect_delay_ms(args.reconnect_delay_ms);
    if let Some(ms) = args.max_item_execution_ms {
        config = config.with_max_item_execution_ms(ms);
    }
    let invoker = SimulatedInvoker::new(Duration::from_millis(args.item_ms))
        .with_failure_rate(args.failure_rate);

    let shutdown = install_shutdown_handler()?;
    let mut node = CalculationNode::new(config, Arc::new(invoker));
    if args.blacklist_after_failures > 0 {
        let blacklist = Arc::new(FailureCountBlacklist::new(args.blacklist_after_failures));
        node = node.with_blacklist(blacklist.clone(), blacklist);
    }
    node.run(shutdown).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Coordinator(coordinator_args) => run_coordinator(coordinator_args).await,
        Commands::Node(node_args) => run_node(node_args).await,
    }
}
