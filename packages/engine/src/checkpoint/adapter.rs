// packages/engine/src/checkpoint/adapter.rs
//! Checkpoint store adapter
//!
//! Encodes snapshots, enforces the size ceiling and deadlines, and keeps the
//! per-instance catalog of checkpoint metadata.

use super::codec::PayloadCodec;
use super::model::{Checkpoint, CheckpointKind, ExecutionSnapshot, RecoveryDescriptor};
use super::store::DurableCheckpointStore;
use crate::graph::execution::Execution;
use crate::ledger::ResourceBudget;
use crate::utils::clock::Clock;
use crate::utils::config::CheckpointConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{CheckpointId, InstanceId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info};

/// Adapter between the lifecycle controller and the durable store
#[derive(Debug)]
pub struct CheckpointAdapter {
    store: Arc<dyn DurableCheckpointStore>,
    codec: PayloadCodec,
    config: CheckpointConfig,
    catalog: DashMap<InstanceId, Vec<Checkpoint>>,
    clock: Arc<dyn Clock>,
}

impl CheckpointAdapter {
    pub fn new(
        store: Arc<dyn DurableCheckpointStore>,
        config: CheckpointConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            codec: PayloadCodec::new(config.compression),
            config,
            catalog: DashMap::new(),
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableCheckpointStore> {
        &self.store
    }

    /// Persist a snapshot and record it as the instance's recovery point
    pub async fn save(
        &self,
        instance_id: &InstanceId,
        execution: Option<&Execution>,
        budget: Option<&ResourceBudget>,
        kind: CheckpointKind,
        label: impl Into<String>,
    ) -> Result<Checkpoint> {
        let now = self.clock.now();
        let snapshot =
            ExecutionSnapshot::new(instance_id.clone(), execution.cloned(), budget.cloned(), now);
        let payload = self.codec.encode(&snapshot)?;
        let size_bytes = payload.len() as u64;

        if size_bytes > self.config.max_size_bytes {
            return Err(EngineError::CheckpointFailed(format!(
                "checkpoint for {} is {} bytes, above the {} byte ceiling",
                instance_id, size_bytes, self.config.max_size_bytes
            )));
        }

        let deadline = self.config.save_timeout();
        let payload_ref = timeout(deadline, self.store.save(instance_id, payload))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: "checkpoint_save",
                after: deadline,
            })?
            .map_err(|e| EngineError::CheckpointFailed(format!("store save failed: {}", e)))?;

        let checkpoint = Checkpoint {
            id: CheckpointId::generate(),
            instance_id: instance_id.clone(),
            execution_id: execution.map(|e| e.id.clone()),
            label: label.into(),
            kind,
            payload_ref,
            size_bytes,
            created_at: now,
        };

        let descriptor = RecoveryDescriptor {
            instance_id: instance_id.clone(),
            checkpoint: checkpoint.clone(),
            marked_at: now,
        };
        timeout(deadline, self.store.mark_pending_recovery(descriptor))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: "checkpoint_mark_recovery",
                after: deadline,
            })?
            .map_err(|e| {
                EngineError::CheckpointFailed(format!("recovery marker not recorded: {}", e))
            })?;

        self.remember(instance_id, checkpoint.clone());

        metrics::counter!("agentcore_checkpoints_total", "kind" => kind.as_str()).increment(1);
        metrics::histogram!("agentcore_checkpoint_bytes").record(size_bytes as f64);
        info!(
            instance_id = %instance_id,
            checkpoint_id = %checkpoint.id,
            kind = %kind,
            "Checkpoint created ({} bytes)",
            size_bytes
        );

        Ok(checkpoint)
    }

    /// Fetch and decode a checkpoint payload
    pub async fn load(&self, checkpoint: &Checkpoint) -> Result<ExecutionSnapshot> {
        let deadline = self.config.load_timeout();
        let payload = timeout(deadline, self.store.load(&checkpoint.payload_ref))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: "checkpoint_load",
                after: deadline,
            })??;

        let snapshot = self.codec.decode(&payload)?;
        if snapshot.instance_id != checkpoint.instance_id {
            return Err(EngineError::CheckpointCorrupted(format!(
                "checkpoint {} holds state for {} instead of {}",
                checkpoint.id, snapshot.instance_id, checkpoint.instance_id
            )));
        }

        debug!("Loaded checkpoint {} for {}", checkpoint.id, checkpoint.instance_id);
        Ok(snapshot)
    }

    /// Most recent checkpoint known for an instance
    pub fn latest(&self, instance_id: &InstanceId) -> Option<Checkpoint> {
        self.catalog
            .get(instance_id)
            .and_then(|entries| entries.iter().max_by_key(|c| c.created_at).cloned())
    }

    pub fn find(&self, instance_id: &InstanceId, checkpoint_id: &CheckpointId) -> Result<Checkpoint> {
        self.catalog
            .get(instance_id)
            .and_then(|entries| entries.iter().find(|c| &c.id == checkpoint_id).cloned())
            .ok_or_else(|| EngineError::CheckpointNotFound(checkpoint_id.to_string()))
    }

    pub fn list(&self, instance_id: &InstanceId) -> Vec<Checkpoint> {
        self.catalog
            .get(instance_id)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Newest pending recovery descriptor for an instance
    ///
    /// The descriptor's checkpoint is adopted into the catalog so a later
    /// resume without an explicit id finds it.
    pub async fn pending_recovery(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<RecoveryDescriptor>> {
        let deadline = self.config.load_timeout();
        let descriptors = timeout(deadline, self.store.list_pending_recovery(Some(instance_id)))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: "checkpoint_list_recovery",
                after: deadline,
            })??;

        let newest = descriptors
            .into_iter()
            .filter(|d| &d.instance_id == instance_id)
            .max_by_key(|d| d.checkpoint.created_at);

        if let Some(descriptor) = &newest {
            let known = self
                .catalog
                .get(instance_id)
                .is_some_and(|entries| entries.iter().any(|c| c.id == descriptor.checkpoint.id));
            if !known {
                self.remember(instance_id, descriptor.checkpoint.clone());
            }
        }

        Ok(newest)
    }

    /// Drop the recovery marker after a clean termination
    ///
    /// Only the newest catalog entry survives, so the final checkpoint of a
    /// terminated instance stays visible.
    pub async fn clear_recovery(&self, instance_id: &InstanceId) -> Result<()> {
        if let Some(mut entries) = self.catalog.get_mut(instance_id) {
            let excess = entries.len().saturating_sub(1);
            entries.drain(..excess);
        }
        let deadline = self.config.save_timeout();
        timeout(deadline, self.store.clear_recovery(instance_id))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: "checkpoint_clear_recovery",
                after: deadline,
            })?
    }

    fn remember(&self, instance_id: &InstanceId, checkpoint: Checkpoint) {
        let cap = self.config.max_catalog_entries.max(1);
        let mut entries = self.catalog.entry(instance_id.clone()).or_default();
        entries.push(checkpoint);
        entries.sort_by_key(|c| c.created_at);
        let excess = entries.len().saturating_sub(cap);
        if excess > 0 {
            entries.drain(..excess);
            debug!(instance_id = %instance_id, "Pruned {} catalog entries", excess);
        }
    }
}
