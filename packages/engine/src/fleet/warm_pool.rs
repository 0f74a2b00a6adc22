// packages/engine/src/fleet/warm_pool.rs
//! Warm pool of pre-provisioned environments
//!
//! Instead of provisioning on every scale-up, the fleet keeps a few
//! environments ready, each with a reserved instance id. Activation hands the
//! environment to the lifecycle controller, which owns it from then on.
//!
//! ```text
//! WarmPool
//! ├─ entries: ArrayQueue<PoolEntry>   (bounded, lock-free)
//! ├─ available: Notify                (wakes acquire() waiters)
//! └─ replenishing: AtomicBool         (single-flight top-up)
//! ```

use crate::bridges::provisioning::{EnvironmentHandle, EnvironmentRequest, Provisioner};
use crate::ledger::ResourceLimits;
use crate::lifecycle::TrustLevel;
use crate::utils::clock::Clock;
use crate::utils::config::FleetConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{InstanceId, PoolEntryId};
use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// A provisioned environment waiting for activation
#[derive(Debug, Clone, PartialEq)]
pub struct PoolEntry {
    pub id: PoolEntryId,
    /// Id the instance will carry once activated
    pub instance_id: InstanceId,
    pub environment: EnvironmentHandle,
    pub created_at: DateTime<Utc>,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub target: usize,
    pub capacity: usize,
    pub acquired: u64,
    /// Acquisitions that found the pool empty
    pub misses: u64,
    pub provisioned: u64,
    pub released: u64,
}

struct ReplenishFlag<'a>(&'a AtomicBool);

impl Drop for ReplenishFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bounded queue of warm environments
#[derive(Debug)]
pub struct WarmPool {
    entries: ArrayQueue<PoolEntry>,
    available: Notify,
    target: usize,
    trust_level: TrustLevel,
    limits: ResourceLimits,
    provision_timeout: Duration,
    provisioner: Arc<dyn Provisioner>,
    clock: Arc<dyn Clock>,
    replenishing: AtomicBool,
    acquired: AtomicU64,
    misses: AtomicU64,
    provisioned: AtomicU64,
    released: AtomicU64,
}

impl WarmPool {
    pub fn new(config: &FleetConfig, provisioner: Arc<dyn Provisioner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: ArrayQueue::new(config.warm_pool_capacity.max(1)),
            available: Notify::new(),
            target: config.warm_pool_target,
            trust_level: config.default_trust_level,
            limits: ResourceLimits::for_trust(config.default_trust_level),
            provision_timeout: config.provision_timeout(),
            provisioner,
            clock,
            replenishing: AtomicBool::new(false),
            acquired: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            provisioned: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Trust level warm environments are provisioned for
    pub fn trust_level(&self) -> TrustLevel {
        self.trust_level
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the pool is below its target size
    pub fn needs_replenish(&self) -> bool {
        self.entries.len() < self.target
    }

    /// Take an entry, waiting at most `wait` for one to appear
    ///
    /// A zero `wait` never blocks.
    pub async fn acquire(&self, wait: Duration) -> Option<PoolEntry> {
        if let Some(entry) = self.pop() {
            return Some(entry);
        }
        if wait.is_zero() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.pop() {
                return Some(entry);
            }
            if timeout_at(deadline, notified).await.is_err() {
                let last_chance = self.pop();
                if last_chance.is_none() {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
                return last_chance;
            }
        }
    }

    fn pop(&self) -> Option<PoolEntry> {
        let entry = self.entries.pop()?;
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.record_size();
        debug!(instance_id = %entry.instance_id, "Acquired warm entry {}", entry.id);
        Some(entry)
    }

    /// Queue an entry; a full pool hands it back
    pub fn offer(&self, entry: PoolEntry) -> std::result::Result<(), PoolEntry> {
        self.entries.push(entry)?;
        self.record_size();
        self.available.notify_one();
        Ok(())
    }

    /// Provision entries until the pool reaches its target
    ///
    /// Only one top-up runs at a time; a concurrent call returns 0 at once.
    /// Returns the number of entries added.
    pub async fn replenish(&self) -> usize {
        if self
            .replenishing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Warm pool replenishment already in flight");
            return 0;
        }
        let _flag = ReplenishFlag(&self.replenishing);

        let mut added = 0;
        while self.needs_replenish() {
            let entry = match self.provision_entry().await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Warm pool provisioning failed: {}", e);
                    break;
                }
            };
            match self.offer(entry) {
                Ok(()) => added += 1,
                Err(entry) => {
                    warn!("Warm pool full, releasing entry {}", entry.id);
                    self.release(entry).await;
                    break;
                }
            }
        }

        if added > 0 {
            info!("Warm pool replenished with {} entries ({} available)", added, self.len());
        }
        added
    }

    async fn provision_entry(&self) -> Result<PoolEntry> {
        let instance_id = InstanceId::generate();
        let request = EnvironmentRequest {
            instance_id: instance_id.clone(),
            limits: self.limits.clone(),
            labels: BTreeMap::new(),
        };

        let environment = timeout(
            self.provision_timeout,
            self.provisioner.request_environment(self.trust_level, &request),
        )
        .await
        .map_err(|_| EngineError::Timeout {
            operation: "warm_pool_provision",
            after: self.provision_timeout,
        })??;
        self.provisioned.fetch_add(1, Ordering::Relaxed);

        Ok(PoolEntry {
            id: PoolEntryId::generate(),
            instance_id,
            environment,
            created_at: self.clock.now(),
        })
    }

    /// Give an entry's environment back to the provisioner
    pub async fn release(&self, entry: PoolEntry) {
        match self.provisioner.release_environment(&entry.environment).await {
            Ok(()) => {
                self.released.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("Releasing warm environment {} failed: {}", entry.environment.id, e),
        }
    }

    /// Empty the pool, releasing every environment
    pub async fn release_all(&self) -> usize {
        let mut count = 0;
        while let Some(entry) = self.entries.pop() {
            self.release(entry).await;
            count += 1;
        }
        self.record_size();
        count
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.entries.len(),
            target: self.target,
            capacity: self.entries.capacity(),
            acquired: self.acquired.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            provisioned: self.provisioned.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }

    fn record_size(&self) {
        metrics::gauge!("agentcore_warm_pool_size").set(self.entries.len() as f64);
    }
}
