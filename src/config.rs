use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, WlmError};
use crate::resources::ResourceVector;

/// Scheduling cycle and queue policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the background scheduling cycle. Cycles also run right after
    /// any queue or capacity change.
    pub cycle_interval_ms: u64,
    /// Let lower-priority jobs that fit run ahead of a blocked higher-priority
    /// job. When false the cycle stops at the first job that cannot be placed.
    pub backfill: bool,
    /// Effective priority points gained per minute spent in the queue.
    pub aging_rate_per_minute: f64,
    /// Upper bound on the priority boost gained through aging.
    pub max_aging_boost: u32,
    pub max_assignments_per_cycle: usize,
    /// Applied when a submission does not carry a wall-time limit.
    pub default_time_limit_secs: u64,
    pub max_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 1000,
            backfill: true,
            aging_rate_per_minute: 1.0,
            max_aging_boost: 1000,
            max_assignments_per_cycle: 1000,
            default_time_limit_secs: 3600,
            max_jobs: 10_000,
        }
    }
}

/// Node liveness tracking.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a node is marked down.
    pub missed_heartbeat_limit: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            missed_heartbeat_limit: 3,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval_ms
                .saturating_mul(u64::from(self.missed_heartbeat_limit.max(1))),
        )
    }
}

/// What happens to jobs on a node that went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeFailurePolicy {
    /// Put the job back in the queue, bounded by `max_launch_attempts`.
    Requeue,
    /// Fail the job immediately.
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub launch_timeout_ms: u64,
    pub terminate_timeout_ms: u64,
    pub max_launch_attempts: u32,
    /// Consecutive launch timeouts after which a node is considered down.
    pub unreachable_threshold: u32,
    pub node_failure_policy: NodeFailurePolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 2000,
            terminate_timeout_ms: 5000,
            max_launch_attempts: 3,
            unreachable_threshold: 3,
            node_failure_policy: NodeFailurePolicy::Requeue,
        }
    }
}

impl DispatchConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

/// Shared-secret token verification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// File holding the raw HS256 signing key.
    pub key_path: Option<PathBuf>,
    /// Users allowed to administer nodes and other users' jobs.
    pub admin_users: BTreeSet<String>,
    /// Lifetime of tokens minted by the controller for its own calls to agents.
    pub internal_token_lifetime_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_path: None,
            admin_users: BTreeSet::from(["root".to_string()]),
            internal_token_lifetime_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// JSON Lines file of terminal jobs. In-memory only when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    /// REST gateway address; the gateway is disabled when unset.
    pub gateway_addr: Option<SocketAddr>,
    pub request_timeout_ms: u64,
    pub channel_capacity: usize,
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
    pub dispatch: DispatchConfig,
    pub auth: AuthConfig,
    pub accounting: AccountingConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 6817)),
            gateway_addr: None,
            request_timeout_ms: 10_000,
            channel_capacity: 1024,
            scheduler: SchedulerConfig::default(),
            registry: RegistryConfig::default(),
            dispatch: DispatchConfig::default(),
            auth: AuthConfig::default(),
            accounting: AccountingConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Load a TOML file. Missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| WlmError::Config(e.to_string()))
    }

    pub fn with_gateway(mut self, addr: SocketAddr) -> Self {
        self.gateway_addr = Some(addr);
        self
    }

    pub fn with_backfill(mut self, backfill: bool) -> Self {
        self.scheduler.backfill = backfill;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Configuration of a node agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    pub listen_addr: SocketAddr,
    /// Address the controller should use to reach this agent. Defaults to
    /// `listen_addr`.
    pub advertise_addr: Option<String>,
    /// Controller gRPC endpoint, e.g. `http://127.0.0.1:6817`.
    pub controller_addr: String,
    pub capacity: ResourceVector,
    pub heartbeat_interval_ms: u64,
    pub token_lifetime_secs: u64,
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, listen_addr: SocketAddr, capacity: ResourceVector) -> Self {
        Self {
            node_id: node_id.into(),
            listen_addr,
            advertise_addr: None,
            controller_addr: "http://127.0.0.1:6817".to_string(),
            capacity,
            heartbeat_interval_ms: 1000,
            token_lifetime_secs: 300,
        }
    }

    pub fn advertised_address(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string())
    }
}
