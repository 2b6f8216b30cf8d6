use parking_lot::RwLock;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which State Store implementation backs the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-memory only; state is lost on restart.
    Memory,
    /// Write-through JSON persistence under `data_dir`.
    File,
}

/// State Store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Backing implementation.
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// Data directory for the file backend.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            data_dir: default_data_dir(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Claim lease duration in seconds.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// Heartbeat interval in seconds (lease renewal cadence).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Concurrent handler slots per worker process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            lease_seconds: default_lease_seconds(),
            heartbeat_interval: default_heartbeat_interval(),
            concurrency: default_concurrency(),
        }
    }
}

impl WorkerSettings {
    /// The lease duration.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    /// The heartbeat cadence.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }
}

/// Per-task execution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSettings {
    /// Default handler deadline in seconds.
    #[serde(default = "default_deadline_seconds")]
    pub default_deadline_seconds: u64,
    /// Attempts allowed before a failure becomes terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base of the exponential retry backoff, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            default_deadline_seconds: default_deadline_seconds(),
            max_attempts: default_max_attempts(),
            retry_backoff_base_ms: default_backoff_base_ms(),
            retry_backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl TaskSettings {
    /// Backoff before re-queueing attempt `attempt + 1` (base 2, capped).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

/// Role-queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Soft depth cap per role queue; exceeding it triggers backpressure.
    #[serde(default = "default_soft_cap")]
    pub soft_cap_per_role: usize,
    /// How long a claim call blocks waiting for work, in seconds.
    #[serde(default = "default_claim_wait")]
    pub claim_wait_seconds: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            soft_cap_per_role: default_soft_cap(),
            claim_wait_seconds: default_claim_wait(),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EventBusSettings {
    /// Bounded buffer size per subscriber.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Heartbeat cadence towards subscribers, in seconds.
    #[serde(default = "default_bus_heartbeat")]
    pub heartbeat_seconds: u64,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: default_subscriber_buffer(),
            heartbeat_seconds: default_bus_heartbeat(),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSettings {
    /// How long to wait for the per-job advance lock, in seconds.
    #[serde(default = "default_lock_timeout")]
    pub per_job_lock_timeout_seconds: u64,
    /// Minimum accepted requirements length.
    #[serde(default = "default_min_requirements_len")]
    pub min_requirements_len: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            per_job_lock_timeout_seconds: default_lock_timeout(),
            min_requirements_len: default_min_requirements_len(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// The full configuration snapshot.
///
/// A snapshot is immutable once built; admin updates swap the whole snapshot
/// through a [`ConfigHandle`] so readers never observe a torn config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanforgeConfig {
    /// State Store settings.
    #[serde(default)]
    pub store: StoreSettings,
    /// Worker pool settings.
    #[serde(default)]
    pub worker: WorkerSettings,
    /// Per-task execution settings.
    #[serde(default)]
    pub task: TaskSettings,
    /// Role-queue settings.
    #[serde(default)]
    pub queue: QueueSettings,
    /// Event bus settings.
    #[serde(default)]
    pub eventbus: EventBusSettings,
    /// Orchestrator settings.
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerSettings,
}

/// Shared handle to the current [`PlanforgeConfig`] snapshot.
///
/// Readers take an `Arc` to the snapshot for the duration of one operation;
/// admin updates swap the pointer atomically.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<PlanforgeConfig>>>,
}

impl ConfigHandle {
    /// Wraps an initial snapshot.
    pub fn new(config: PlanforgeConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<PlanforgeConfig> {
        self.inner.read().clone()
    }

    /// Replaces the snapshot.
    pub fn swap(&self, config: PlanforgeConfig) {
        *self.inner.write() = Arc::new(config);
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(PlanforgeConfig::default())
    }
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_lease_seconds() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_concurrency() -> usize {
    4
}
fn default_deadline_seconds() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    60_000
}
fn default_soft_cap() -> usize {
    1000
}
fn default_claim_wait() -> u64 {
    5
}
fn default_subscriber_buffer() -> usize {
    256
}
fn default_bus_heartbeat() -> u64 {
    15
}
fn default_lock_timeout() -> u64 {
    5
}
fn default_min_requirements_len() -> usize {
    1
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
