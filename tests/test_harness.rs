//! Test harness for coordinator/node integration tests.
//!
//! Provides a coordinator on an ephemeral port, real calculation nodes, and a
//! scripted node that speaks the wire protocol directly.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use calc_grid::config::{CoordinatorConfig, WorkerConfig};
use calc_grid::coordinator::{Coordinator, NodeListener};
use calc_grid::protocol::{Frame, GridCodec, Message};
use calc_grid::scheduler::{
    DependentValueResolver, GridScheduler, JobSpecification, JobState, NoDependentValues,
};
use calc_grid::worker::{CalculationNode, JobInvoker};

/// How long a scripted node waits for any single message.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinator configuration with shorter timeouts for faster tests
pub fn test_coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig::new("127.0.0.1:0".parse().unwrap())
        .with_dispatch_retry_interval_ms(20)
        .with_resolver_deadline_ms(200)
        .with_handshake_timeout_ms(500)
}

/// Worker configuration with shorter intervals for faster tests
#[allow(dead_code)]
pub fn test_worker_config(node_id: &str, addr: SocketAddr, slots: u32) -> WorkerConfig {
    WorkerConfig::new(node_id, addr.to_string())
        .with_slots(slots)
        .with_scaling_interval_ms(50)
        .with_dependency_deadline_ms(500)
        .with_reconnect_delay_ms(50)
}

/// A running coordinator plus the nodes started against it.
pub struct TestGrid {
    pub addr: SocketAddr,
    pub scheduler: GridScheduler,
    shutdown: CancellationToken,
    coordinator_handle: JoinHandle<()>,
    nodes: HashMap<String, (CancellationToken, JoinHandle<()>)>,
}

impl TestGrid {
    pub async fn start() -> Self {
        Self::start_with(test_coordinator_config(), Arc::new(NoDependentValues)).await
    }

    pub async fn start_with(
        config: CoordinatorConfig,
        resolver: Arc<dyn DependentValueResolver>,
    ) -> Self {
        let listener = NodeListener::bind(config.listen_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let coordinator = Coordinator::new(config, resolver);
        let scheduler = coordinator.scheduler().clone();
        let shutdown = CancellationToken::new();
        let coordinator_handle = tokio::spawn(coordinator.serve(listener, shutdown.clone()));

        Self {
            addr,
            scheduler,
            shutdown,
            coordinator_handle,
            nodes: HashMap::new(),
        }
    }

    /// Start a real calculation node.
    #[allow(dead_code)]
    pub fn spawn_node(&mut self, node_id: &str, slots: u32, invoker: Arc<dyn JobInvoker>) {
        let config = test_worker_config(node_id, self.addr, slots);
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(CalculationNode::new(config, invoker).run(token.clone()));
        self.nodes.insert(node_id.to_string(), (token, handle));
    }

    /// Stop a node started with [`spawn_node`](Self::spawn_node).
    #[allow(dead_code)]
    pub async fn stop_node(&mut self, node_id: &str) -> bool {
        match self.nodes.remove(node_id) {
            Some((token, handle)) => {
                token.cancel();
                let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
                true
            }
            None => false,
        }
    }

    /// Connect a scripted node; it has sent Hello but nothing else.
    #[allow(dead_code)]
    pub async fn connect_scripted(&self, node_id: &str, slots: u32) -> ScriptedNode {
        ScriptedNode::connect(self.addr, node_id, slots).await
    }

    #[allow(dead_code)]
    pub async fn wait_for_nodes(&self, count: usize, timeout: Duration) -> bool {
        let tracker = self.scheduler.tracker().clone();
        wait_for(
            || {
                let tracker = tracker.clone();
                async move { tracker.node_count() == count }
            },
            timeout,
            Duration::from_millis(10),
        )
        .await
    }

    /// Wait until every node is eligible at the current repository version.
    #[allow(dead_code)]
    pub async fn wait_for_eligible(&self, count: usize, timeout: Duration) -> bool {
        let tracker = self.scheduler.tracker().clone();
        wait_for(
            || {
                let tracker = tracker.clone();
                async move { tracker.snapshot().iter().filter(|n| n.eligible).count() == count }
            },
            timeout,
            Duration::from_millis(10),
        )
        .await
    }

    #[allow(dead_code)]
    pub async fn wait_for_state(
        &self,
        spec: JobSpecification,
        state: JobState,
        timeout: Duration,
    ) -> bool {
        let registry = self.scheduler.registry().clone();
        wait_for(
            || {
                let registry = registry.clone();
                async move { registry.state(&spec) == Some(state) }
            },
            timeout,
            Duration::from_millis(10),
        )
        .await
    }

    /// Shutdown the coordinator and all nodes (best effort cleanup)
    #[allow(dead_code)]
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for (_, (_, handle)) in self.nodes.drain() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}

impl Drop for TestGrid {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.coordinator_handle.abort();
        for (_, (_, handle)) in self.nodes.drain() {
            handle.abort();
        }
    }
}

/// A node driven message by message from the test.
pub struct ScriptedNode {
    framed: Framed<TcpStream, GridCodec>,
}

#[allow(dead_code)]
impl ScriptedNode {
    pub async fn connect(addr: SocketAddr, node_id: &str, slots: u32) -> Self {
        let mut node = Self::connect_raw(addr).await;
        node.send(Message::Hello {
            node_id: node_id.to_string(),
            slots,
        })
        .await;
        node
    }

    /// Connect without saying Hello.
    pub async fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, GridCodec::default()),
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.framed.send(message).await.unwrap();
    }

    /// Write raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    /// Next message from the coordinator; panics on timeout or close.
    pub async fn recv(&mut self) -> Message {
        match self.try_recv(RECV_TIMEOUT).await {
            Some(message) => message,
            None => panic!("no message from coordinator within {:?}", RECV_TIMEOUT),
        }
    }

    /// Next message within `within`, or `None` on timeout or close.
    pub async fn try_recv(&mut self, within: Duration) -> Option<Message> {
        match tokio::time::timeout(within, self.framed.next()).await {
            Ok(Some(Ok(Frame::Message(message)))) => Some(message),
            Ok(Some(Ok(Frame::Unknown { kind, .. }))) => panic!("unknown frame kind {}", kind),
            Ok(Some(Err(e))) => panic!("decode failed: {}", e),
            Ok(None) | Err(_) => None,
        }
    }

    /// True once the coordinator has closed the connection.
    pub async fn is_closed(&mut self, within: Duration) -> bool {
        matches!(
            tokio::time::timeout(within, self.framed.next()).await,
            Ok(None) | Ok(Some(Err(_)))
        )
    }

    pub async fn expect_init(&mut self) -> i64 {
        match self.recv().await {
            Message::Init {
                function_repository_version,
            } => function_repository_version,
            other => panic!("expected Init, got {:?}", other),
        }
    }

    pub async fn expect_execute(&mut self) -> JobSpecification {
        match self.recv().await {
            Message::Execute { job } => job.specification,
            other => panic!("expected Execute, got {:?}", other),
        }
    }

    /// Acknowledge the pending Init and advertise `capacity`.
    pub async fn ready(&mut self, capacity: i32) {
        self.send(Message::Ready { capacity }).await;
    }

    /// Assert nothing arrives for `within`.
    pub async fn expect_silence(&mut self, within: Duration) {
        if let Some(message) = self.try_recv(within).await {
            panic!("expected no message, got {:?}", message);
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
#[allow(dead_code)]
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
