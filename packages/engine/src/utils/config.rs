// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. Built-in defaults ([`EngineConfig::default`])
//! 2. An optional file (`agentcore.toml` / `.yaml` / `.json`, or the path in
//!    `AGENTCORE_CONFIG`)
//! 3. Environment variables such as `AGENTCORE__LEDGER__WINDOW_SECS=600`
//!
//! Durations are stored as integer milliseconds or seconds so the file format
//! stays obvious; accessor methods return [`Duration`].

use crate::checkpoint::codec::CompressionLevel;
use crate::ledger::{EnforcementMode, ExhaustionAction};
use crate::lifecycle::instance::TrustLevel;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "AGENTCORE_CONFIG";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lifecycle: LifecycleConfig,
    pub ledger: LedgerConfig,
    pub namespace: NamespaceCeilings,
    pub checkpoint: CheckpointConfig,
    pub graph: GraphConfig,
    pub fleet: FleetConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from the default file location and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "agentcore".to_string());
        Self::build(&path, false)
    }

    /// Load configuration from a specific file, layered over defaults
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        Self::build(&path, true)
    }

    fn build(path: &str, required: bool) -> Result<Self> {
        let defaults = Config::try_from(&EngineConfig::default()).map_err(config_error)?;

        let settings = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name(path).required(required))
            .add_source(
                Environment::with_prefix("AGENTCORE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let config: EngineConfig = settings.try_deserialize().map_err(config_error)?;
        config.validate()?;

        debug!(path, "engine configuration loaded");
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.ledger.window_secs == 0 {
            return Err(EngineError::ConfigError(
                "ledger.window_secs must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ledger.warn_ratio) {
            return Err(EngineError::ConfigError(
                "ledger.warn_ratio must be within 0.0..=1.0".into(),
            ));
        }
        if self.graph.max_graph_depth == 0 || self.graph.max_total_steps == 0 {
            return Err(EngineError::ConfigError(
                "graph depth limits must be greater than 0".into(),
            ));
        }
        if self.graph.max_parallel_branches == 0 {
            return Err(EngineError::ConfigError(
                "graph.max_parallel_branches must be greater than 0".into(),
            ));
        }
        if self.checkpoint.max_size_bytes == 0 {
            return Err(EngineError::ConfigError(
                "checkpoint.max_size_bytes must be greater than 0".into(),
            ));
        }
        if self.fleet.warm_pool_target > self.fleet.warm_pool_capacity {
            return Err(EngineError::ConfigError(format!(
                "fleet.warm_pool_target ({}) exceeds warm_pool_capacity ({})",
                self.fleet.warm_pool_target, self.fleet.warm_pool_capacity
            )));
        }
        if self.fleet.warm_pool_capacity == 0 {
            return Err(EngineError::ConfigError(
                "fleet.warm_pool_capacity must be greater than 0".into(),
            ));
        }
        if self.namespace.allowed_trust_levels.is_empty() {
            return Err(EngineError::ConfigError(
                "namespace.allowed_trust_levels must not be empty".into(),
            ));
        }
        for policy in [&self.lifecycle.spawn_retry, &self.lifecycle.restart] {
            if policy.multiplier < 1.0 {
                return Err(EngineError::ConfigError(
                    "backoff multiplier must be at least 1.0".into(),
                ));
            }
        }
        Ok(())
    }
}

fn config_error(err: config::ConfigError) -> EngineError {
    EngineError::ConfigError(err.to_string())
}

/// Exponential backoff with optional jitter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Attempts before giving up (including the first one)
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Add 0-25% random jitter to each delay
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64).max(0.0);
        let millis = if self.jitter {
            capped * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped
        };
        Duration::from_millis(millis as u64)
    }
}

/// Lifecycle controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Deadline for the provisioner to confirm an environment
    pub spawn_timeout_ms: u64,
    /// Retry policy for provisioning during spawn
    pub spawn_retry: BackoffPolicy,
    /// Restart policy for unexpected failures while running
    pub restart: BackoffPolicy,
    /// Running instances idle for longer than this are suspended
    pub idle_threshold_secs: u64,
    pub idle_sweep_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Periodic checkpoint cadence; `None` disables auto-checkpointing
    pub auto_checkpoint_interval_secs: Option<u64>,
    /// What happens when an instance runs out of tokens
    pub exhaustion_action: ExhaustionAction,
    /// Delay applied per step when the exhaustion action is `throttle`
    pub throttle_delay_ms: u64,
    /// How long suspend waits for the execution to reach a node boundary
    pub stop_grace_ms: u64,
    pub release_timeout_ms: u64,
    /// Drain budget used by `terminate(force = false)`
    pub default_drain_timeout_secs: u64,
    pub drain_poll_interval_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: 10_000,
            spawn_retry: BackoffPolicy::default(),
            restart: BackoffPolicy {
                max_attempts: 5,
                initial_backoff_ms: 1_000,
                max_backoff_ms: 60_000,
                multiplier: 2.0,
                jitter: true,
            },
            idle_threshold_secs: 900,
            idle_sweep_interval_secs: 60,
            heartbeat_interval_secs: 30,
            auto_checkpoint_interval_secs: Some(300),
            exhaustion_action: ExhaustionAction::Suspend,
            throttle_delay_ms: 1_000,
            stop_grace_ms: 30_000,
            release_timeout_ms: 5_000,
            default_drain_timeout_secs: 30,
            drain_poll_interval_ms: 250,
        }
    }
}

impl LifecycleConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn auto_checkpoint_interval(&self) -> Option<Duration> {
        self.auto_checkpoint_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn default_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.default_drain_timeout_secs)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms.max(1))
    }
}

/// Resource ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Length of one token budget window
    pub window_secs: u64,
    pub enforcement: EnforcementMode,
    /// Fraction of the allocation at which a resource warning is emitted
    pub warn_ratio: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            window_secs: 3_600,
            enforcement: EnforcementMode::Soft,
            warn_ratio: 0.8,
        }
    }
}

impl LedgerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Admission ceilings for one namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceCeilings {
    pub name: String,
    /// Maximum live (non-terminal) instances
    pub max_instances: usize,
    pub max_tokens_per_window: u64,
    pub max_cpu_seconds: f64,
    pub max_memory_bytes: u64,
    pub allowed_trust_levels: Vec<TrustLevel>,
}

impl Default for NamespaceCeilings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_instances: 1_000,
            max_tokens_per_window: 1_000_000,
            max_cpu_seconds: 86_400.0,
            max_memory_bytes: 16 * 1024 * 1024 * 1024,
            allowed_trust_levels: TrustLevel::all(),
        }
    }
}

/// Where checkpoints are stored
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// In-memory store (development and tests)
    Memory,

    /// SQLite metadata plus payload files
    Sqlite { base_dir: PathBuf },
}

impl Default for CheckpointBackend {
    fn default() -> Self {
        CheckpointBackend::Memory
    }
}

/// Checkpoint adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Largest encoded payload accepted
    pub max_size_bytes: u64,
    pub save_timeout_ms: u64,
    pub load_timeout_ms: u64,
    pub compression: CompressionLevel,
    pub backend: CheckpointBackend,
    /// Catalog entries kept per instance, newest first
    pub max_catalog_entries: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 8 * 1024 * 1024,
            save_timeout_ms: 10_000,
            load_timeout_ms: 10_000,
            compression: CompressionLevel::Balanced,
            backend: CheckpointBackend::Memory,
            max_catalog_entries: 32,
        }
    }
}

impl CheckpointConfig {
    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

/// Graph execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum visits of any single node within one execution
    pub max_graph_depth: u32,
    /// Maximum node visits across the whole execution
    pub max_total_steps: u32,
    /// Revisits without scratch-state progress tolerated per node
    pub allowed_stalled_passes: u32,
    pub node_timeout_ms: u64,
    pub branch_timeout_ms: u64,
    pub max_parallel_branches: usize,
    /// Move the instance to `failed` (instead of `suspended`) on graph errors
    pub fail_instance_on_graph_error: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_graph_depth: 16,
            max_total_steps: 256,
            allowed_stalled_passes: 1,
            node_timeout_ms: 120_000,
            branch_timeout_ms: 60_000,
            max_parallel_branches: 8,
            fail_instance_on_graph_error: false,
        }
    }
}

impl GraphConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn branch_timeout(&self) -> Duration {
        Duration::from_millis(self.branch_timeout_ms)
    }
}

/// Fleet coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Number of warm entries the replenisher maintains
    pub warm_pool_target: usize,
    /// Hard bound of the warm pool queue
    pub warm_pool_capacity: usize,
    pub replenish_interval_ms: u64,
    pub provision_timeout_ms: u64,
    pub drain_timeout_secs: u64,
    /// Trust level used for warm entries and scale-up spawns
    pub default_trust_level: TrustLevel,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            warm_pool_target: 4,
            warm_pool_capacity: 16,
            replenish_interval_ms: 5_000,
            provision_timeout_ms: 10_000,
            drain_timeout_secs: 30,
            default_trust_level: TrustLevel::Standard,
        }
    }
}

impl FleetConfig {
    pub fn replenish_interval(&self) -> Duration {
        Duration::from_millis(self.replenish_interval_ms.max(1))
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_millis(self.provision_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
