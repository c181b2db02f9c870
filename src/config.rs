use std::net::{Ipv4Addr, SocketAddr};

use crate::protocol::DEFAULT_MAX_FRAME_LENGTH;

const DEFAULT_COORDINATOR_PORT: u16 = 7420;

/// How the dispatcher ranks eligible nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionPolicy {
    /// Divide free capacity by the node's invocation cost scale. When false,
    /// nodes are ranked by raw free capacity.
    pub cost_scaled: bool,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self { cost_scaled: true }
    }
}

/// Settings for the coordinator process.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address node connections are accepted on.
    pub listen_addr: SocketAddr,
    /// Address of the HTTP status API; disabled when `None`.
    pub status_addr: Option<SocketAddr>,
    /// Function repository version in force at startup.
    pub initial_repository_version: i64,
    /// Backoff between dispatch passes while jobs wait for a node.
    pub dispatch_retry_interval_ms: u64,
    /// How long a dependent-value query may take before an empty reply is sent.
    pub resolver_deadline_ms: u64,
    /// Time a new connection has to send Hello.
    pub handshake_timeout_ms: u64,
    /// Largest frame accepted from a node, in bytes.
    pub max_frame_length: usize,
    /// Records the job registry holds before submissions are refused.
    pub max_jobs: usize,
    /// How eligible nodes are ranked.
    pub admission: AdmissionPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_COORDINATOR_PORT)),
            status_addr: None,
            initial_repository_version: 0,
            dispatch_retry_interval_ms: 250,
            resolver_deadline_ms: 5_000,
            handshake_timeout_ms: 5_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_jobs: 100_000,
            admission: AdmissionPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_status_addr(mut self, addr: SocketAddr) -> Self {
        self.status_addr = Some(addr);
        self
    }

    pub fn with_initial_repository_version(mut self, version: i64) -> Self {
        self.initial_repository_version = version;
        self
    }

    pub fn with_dispatch_retry_interval_ms(mut self, ms: u64) -> Self {
        self.dispatch_retry_interval_ms = ms;
        self
    }

    pub fn with_resolver_deadline_ms(mut self, ms: u64) -> Self {
        self.resolver_deadline_ms = ms;
        self
    }

    pub fn with_handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    pub fn with_max_frame_length(mut self, bytes: usize) -> Self {
        self.max_frame_length = bytes;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_admission(mut self, admission: AdmissionPolicy) -> Self {
        self.admission = admission;
        self
    }
}

/// Settings for one calculation node process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity announced in Hello; unique across the grid.
    pub node_id: String,
    /// host:port of the coordinator, supports both IP and hostnames.
    pub coordinator_addr: String,
    /// Jobs this node runs concurrently.
    pub slots: u32,
    /// Interval between Scaling reports.
    pub scaling_interval_ms: u64,
    /// Per-request deadline for dependent-value queries.
    pub dependency_deadline_ms: u64,
    /// Longest a single job item may run before it is stopped and reported
    /// as failed. No limit when `None`.
    pub max_item_execution_ms: Option<u64>,
    /// Largest frame accepted from the coordinator, in bytes.
    pub max_frame_length: usize,
    /// Base delay before reconnecting; up to half again is added as jitter.
    pub reconnect_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            coordinator_addr: format!("127.0.0.1:{}", DEFAULT_COORDINATOR_PORT),
            slots: 4,
            scaling_interval_ms: 5_000,
            dependency_deadline_ms: 10_000,
            max_item_execution_ms: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn new(node_id: impl Into<String>, coordinator_addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            coordinator_addr: coordinator_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_scaling_interval_ms(mut self, ms: u64) -> Self {
        self.scaling_interval_ms = ms;
        self
    }

    pub fn with_dependency_deadline_ms(mut self, ms: u64) -> Self {
        self.dependency_deadline_ms = ms;
        self
    }

    pub fn with_max_item_execution_ms(mut self, ms: u64) -> Self {
        self.max_item_execution_ms = Some(ms);
        self
    }

    pub fn with_max_frame_length(mut self, bytes: usize) -> Self {
        self.max_frame_length = bytes;
        self
    }

    pub fn with_reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.reconnect_delay_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_policy_default_is_cost_scaled() {
        assert!(AdmissionPolicy::default().cost_scaled);
    }

    #[test]
    fn coordinator_config_default() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:7420");
        assert!(cfg.status_addr.is_none());
        assert_eq!(cfg.initial_repository_version, 0);
        assert_eq!(cfg.dispatch_retry_interval_ms, 250);
        assert_eq!(cfg.resolver_deadline_ms, 5_000);
        assert_eq!(cfg.handshake_timeout_ms, 5_000);
        assert_eq!(cfg.max_frame_length, 16 * 1024 * 1024);
        assert_eq!(cfg.max_jobs, 100_000);
    }

    #[test]
    fn coordinator_config_builders() {
        let listen: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let status: SocketAddr = "10.0.0.1:8080".parse().unwrap();
        let cfg = CoordinatorConfig::new(listen)
            .with_status_addr(status)
            .with_initial_repository_version(5)
            .with_resolver_deadline_ms(50)
            .with_handshake_timeout_ms(750)
            .with_max_frame_length(4096)
            .with_max_jobs(10)
            .with_admission(AdmissionPolicy { cost_scaled: false });
        assert_eq!(cfg.listen_addr, listen);
        assert_eq!(cfg.status_addr, Some(status));
        assert_eq!(cfg.initial_repository_version, 5);
        assert_eq!(cfg.resolver_deadline_ms, 50);
        assert_eq!(cfg.handshake_timeout_ms, 750);
        assert_eq!(cfg.max_frame_length, 4096);
        assert_eq!(cfg.max_jobs, 10);
        assert!(!cfg.admission.cost_scaled);
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.node_id, "node-1");
        assert_eq!(cfg.coordinator_addr, "127.0.0.1:7420");
        assert_eq!(cfg.slots, 4);
        assert_eq!(cfg.reconnect_delay_ms, 1_000);
        assert!(cfg.max_item_execution_ms.is_none());
    }

    #[test]
    fn worker_config_limits() {
        let cfg = WorkerConfig::default()
            .with_max_item_execution_ms(30_000)
            .with_max_frame_length(1024);
        assert_eq!(cfg.max_item_execution_ms, Some(30_000));
        assert_eq!(cfg.max_frame_length, 1024);
    }

    #[test]
    fn worker_config_new_with_slots() {
        let cfg = WorkerConfig::new("calc-7", "grid.example.com:7420").with_slots(16);
        assert_eq!(cfg.node_id, "calc-7");
        assert_eq!(cfg.coordinator_addr, "grid.example.com:7420");
        assert_eq!(cfg.slots, 16);
        assert_eq!(cfg.scaling_interval_ms, 5_000);
    }
}
