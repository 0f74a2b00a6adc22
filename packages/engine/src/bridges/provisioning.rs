// packages/engine/src/bridges/provisioning.rs
//! Execution environment provisioning
//!
//! The core never isolates anything itself. It asks a [`Provisioner`] for an
//! environment at the isolation tier implied by the instance's trust level:
//!
//! - trusted -> shared
//! - standard -> container
//! - untrusted -> microvm
//! - confidential -> enclave

use crate::ledger::ResourceLimits;
use crate::lifecycle::instance::TrustLevel;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::InstanceId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use ulid::Ulid;

/// Isolation tier requested from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationTier {
    Shared,
    Container,
    MicroVm,
    Enclave,
}

impl IsolationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationTier::Shared => "shared",
            IsolationTier::Container => "container",
            IsolationTier::MicroVm => "microvm",
            IsolationTier::Enclave => "enclave",
        }
    }
}

impl From<TrustLevel> for IsolationTier {
    fn from(level: TrustLevel) -> Self {
        match level {
            TrustLevel::Trusted => IsolationTier::Shared,
            TrustLevel::Standard => IsolationTier::Container,
            TrustLevel::Untrusted => IsolationTier::MicroVm,
            TrustLevel::Confidential => IsolationTier::Enclave,
        }
    }
}

impl fmt::Display for IsolationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an instance needs from its environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRequest {
    pub instance_id: InstanceId,
    pub limits: ResourceLimits,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Handle to a provisioned environment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub id: String,
    pub instance_id: InstanceId,
    pub tier: IsolationTier,
    pub provisioned_at: DateTime<Utc>,
}

/// Infrastructure provider for execution environments
///
/// `request_environment` fails with `Unavailable` when the provider has no
/// capacity. Other errors are treated as transient by the spawn retry loop.
#[async_trait]
pub trait Provisioner: Send + Sync + Debug {
    async fn request_environment(
        &self,
        trust_level: TrustLevel,
        request: &EnvironmentRequest,
    ) -> Result<EnvironmentHandle>;

    async fn release_environment(&self, handle: &EnvironmentHandle) -> Result<()>;

    /// Liveness check used by heartbeats
    async fn probe(&self, _handle: &EnvironmentHandle) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug)]
struct LocalState {
    active: HashMap<String, EnvironmentHandle>,
    unhealthy: HashSet<String>,
    confirm_delay: Option<Duration>,
}

/// In-process provisioner with a fixed capacity
///
/// Hands out logical environments without isolating anything. Suitable for
/// embedding the core in a single process and for tests.
#[derive(Debug)]
pub struct LocalProvisioner {
    capacity: usize,
    state: Mutex<LocalState>,
    requests: AtomicU64,
    releases: AtomicU64,
}

impl LocalProvisioner {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LocalState {
                active: HashMap::new(),
                unhealthy: HashSet::new(),
                confirm_delay: None,
            }),
            requests: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    /// Delay every confirmation, simulating a slow provider
    pub fn with_confirm_delay(self, delay: Duration) -> Self {
        self.set_confirm_delay(Some(delay));
        self
    }

    pub fn set_confirm_delay(&self, delay: Option<Duration>) {
        self.state.lock().confirm_delay = delay;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_active(&self, handle: &EnvironmentHandle) -> bool {
        self.state.lock().active.contains_key(&handle.id)
    }

    pub fn requests_made(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn releases_made(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Make heartbeat probes for this environment report it dead
    pub fn mark_unhealthy(&self, handle: &EnvironmentHandle) {
        self.state.lock().unhealthy.insert(handle.id.clone());
    }
}

impl Default for LocalProvisioner {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn request_environment(
        &self,
        trust_level: TrustLevel,
        request: &EnvironmentRequest,
    ) -> Result<EnvironmentHandle> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let delay = self.state.lock().confirm_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.active.len() >= self.capacity {
            warn!(
                "Local provisioner at capacity ({}), rejecting {}",
                self.capacity, request.instance_id
            );
            return Err(EngineError::Unavailable(format!(
                "no capacity left for {}",
                request.instance_id
            )));
        }

        let tier = IsolationTier::from(trust_level);
        let handle = EnvironmentHandle {
            id: format!("env_{}", Ulid::new().to_string().to_lowercase()),
            instance_id: request.instance_id.clone(),
            tier,
            provisioned_at: Utc::now(),
        };
        state.active.insert(handle.id.clone(), handle.clone());

        debug!("Provisioned {} environment {} for {}", tier, handle.id, request.instance_id);
        Ok(handle)
    }

    async fn release_environment(&self, handle: &EnvironmentHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.unhealthy.remove(&handle.id);
        if state.active.remove(&handle.id).is_some() {
            self.releases.fetch_add(1, Ordering::Relaxed);
            debug!("Released environment {}", handle.id);
        }
        Ok(())
    }

    async fn probe(&self, handle: &EnvironmentHandle) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.active.contains_key(&handle.id) && !state.unhealthy.contains(&handle.id))
    }
}
