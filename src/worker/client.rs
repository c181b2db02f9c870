use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{GridError, Result};
use crate::protocol::{Frame, GridCodec, Message};
use crate::scheduler::job::{Job, JobSpecification};
use crate::worker::blacklist::{FunctionBlacklistMaintainer, FunctionBlacklistQuery};
use crate::worker::executor::{
    execute_job, DependencyRequester, ExecutionGuards, InvocationContext, JobInvoker,
};
use crate::worker::statistics::{InvocationStatistics, ScalingReporter};

/// A calculation node: connects to the coordinator, runs the jobs it is sent
/// and reconnects when the connection drops.
pub struct CalculationNode {
    config: WorkerConfig,
    invoker: Arc<dyn JobInvoker>,
    statistics: Arc<InvocationStatistics>,
    guards: ExecutionGuards,
}

/// State of one coordinator connection. Everything here dies with it.
struct Connection {
    framed: Framed<TcpStream, GridCodec>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    requester: DependencyRequester,
    running: HashMap<JobSpecification, AbortHandle>,
}

impl CalculationNode {
    pub fn new(config: WorkerConfig, invoker: Arc<dyn JobInvoker>) -> Self {
        let guards = ExecutionGuards::default()
            .with_max_item_execution(config.max_item_execution_ms.map(Duration::from_millis));
        Self {
            config,
            invoker,
            statistics: Arc::new(InvocationStatistics::default()),
            guards,
        }
    }

    /// Suppress blacklisted functions and report failing items to `maintainer`.
    pub fn with_blacklist(
        mut self,
        query: Arc<dyn FunctionBlacklistQuery>,
        maintainer: Arc<dyn FunctionBlacklistMaintainer>,
    ) -> Self {
        self.guards = self.guards.with_blacklist(query, maintainer);
        self
    }

    pub fn statistics(&self) -> &Arc<InvocationStatistics> {
        &self.statistics
    }

    /// Serve the coordinator until `shutdown` is cancelled, reconnecting after
    /// every lost connection.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            node_id = %self.config.node_id,
            coordinator = %self.config.coordinator_addr,
            slots = self.config.slots,
            "Calculation node starting"
        );

        loop {
            match self.serve_connection(&shutdown).await {
                Ok(()) => {
                    tracing::info!(node_id = %self.config.node_id, "Coordinator connection closed")
                }
                Err(e) => {
                    tracing::warn!(node_id = %self.config.node_id, error = %e, "Coordinator connection failed")
                }
            }
            if shutdown.is_cancelled() {
                break;
            }

            let delay = self.reconnect_delay();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(node_id = %self.config.node_id, "Calculation node stopped");
    }

    /// Configured delay plus up to 50% jitter so a restarted coordinator is
    /// not hit by every node at once.
    fn reconnect_delay(&self) -> Duration {
        let base = self.config.reconnect_delay_ms;
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }

    async fn serve_connection(&self, shutdown: &CancellationToken) -> Result<()> {
        let stream = TcpStream::connect(&self.config.coordinator_addr).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, GridCodec::new(self.config.max_frame_length));
        framed
            .send(Message::Hello {
                node_id: self.config.node_id.clone(),
                slots: self.config.slots,
            })
            .await?;
        tracing::info!(node_id = %self.config.node_id, "Connected to coordinator");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let requester = DependencyRequester::new(
            outbound_tx.clone(),
            Duration::from_millis(self.config.dependency_deadline_ms),
        );
        let mut conn = Connection {
            framed,
            outbound_tx,
            outbound_rx,
            requester,
            running: HashMap::new(),
        };

        let reporter_task = {
            let reporter = ScalingReporter::new(self.config.scaling_interval_ms);
            let statistics = self.statistics.clone();
            let tx = conn.outbound_tx.clone();
            tokio::spawn(async move { reporter.run(&statistics, tx).await })
        };

        let result = self.drive(&mut conn, shutdown).await;

        reporter_task.abort();
        // The coordinator fails every job this node held once the connection
        // is gone, so finishing them would be wasted work.
        for (spec, handle) in conn.running.drain() {
            tracing::debug!(job = %spec, "Aborting job after disconnect");
            handle.abort();
        }
        result
    }

    async fn drive(&self, conn: &mut Connection, shutdown: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                Some(message) = conn.outbound_rx.recv() => {
                    if let Message::JobResult { job, .. } = &message {
                        conn.running.remove(job);
                    }
                    conn.framed.send(message).await?;
                }
                inbound = conn.framed.next() => match inbound {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(Frame::Unknown { kind, schema_version })) => {
                        tracing::warn!(kind, schema_version, "Skipping unknown message from coordinator");
                    }
                    Some(Ok(Frame::Message(message))) => self.handle(conn, message).await?,
                },
            }
        }
    }

    async fn handle(&self, conn: &mut Connection, message: Message) -> Result<()> {
        match message {
            Message::Init {
                function_repository_version,
            } => {
                self.invoker.reload(function_repository_version).await?;
                let capacity = i32::try_from(self.config.slots).unwrap_or(i32::MAX);
                conn.framed.send(Message::Ready { capacity }).await?;
                tracing::info!(
                    version = function_repository_version,
                    capacity,
                    "Ready at function repository version"
                );
            }
            Message::Execute { job } => self.start_job(conn, job),
            Message::Cancel { jobs } => {
                for spec in jobs {
                    match conn.running.remove(&spec) {
                        Some(handle) => {
                            handle.abort();
                            tracing::info!(job = %spec, "Job cancelled");
                        }
                        None => tracing::debug!(job = %spec, "Cancel for job not running"),
                    }
                }
            }
            Message::DependentValueReply {
                correlation_id,
                values,
            } => {
                if !conn.requester.complete(correlation_id, values) {
                    tracing::debug!(correlation_id, "Dependent value reply arrived after deadline");
                }
            }
            other => {
                return Err(GridError::Protocol(format!(
                    "{:?} is not sent by the coordinator",
                    other.kind()
                )))
            }
        }
        Ok(())
    }

    fn start_job(&self, conn: &mut Connection, job: Arc<Job>) {
        let spec = job.specification;
        if conn.running.contains_key(&spec) {
            tracing::warn!(job = %spec, "Ignoring duplicate Execute");
            return;
        }
        // Queued ahead of the result so the coordinator always sees the
        // acceptance first.
        if conn.outbound_tx.send(Message::JobAccepted { job: spec }).is_err() {
            return;
        }

        let invoker = self.invoker.clone();
        let statistics = self.statistics.clone();
        let guards = self.guards.clone();
        let context = InvocationContext::new(spec, conn.requester.clone());
        let tx = conn.outbound_tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = execute_job(job, invoker, statistics, guards, context).await;
            // Fails only when the connection is already gone.
            let _ = tx.send(Message::JobResult { job: spec, outcome });
        });
        tracing::debug!(job = %spec, "Job started");
        conn.running.insert(spec, handle.abort_handle());
    }
}
