// packages/engine/src/checkpoint/memory_store.rs
//! In-process checkpoint store
//!
//! Keeps payloads in memory. Used for embedding and tests; the fault hooks
//! let tests simulate slow, failing or corrupting stores.

use super::model::{CheckpointRef, RecoveryDescriptor};
use super::store::DurableCheckpointStore;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::InstanceId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;
use ulid::Ulid;

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    fail_saves: bool,
    save_delay: Option<Duration>,
    load_delay: Option<Duration>,
}

/// Checkpoint store backed by concurrent maps
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    payloads: DashMap<CheckpointRef, Bytes>,
    recovery: DashMap<InstanceId, RecoveryDescriptor>,
    faults: Mutex<Faults>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payload_count(&self) -> usize {
        self.payloads.len()
    }

    pub fn contains(&self, checkpoint_ref: &CheckpointRef) -> bool {
        self.payloads.contains_key(checkpoint_ref)
    }

    /// Make subsequent saves fail with `StorageFailed`
    pub fn set_fail_saves(&self, fail: bool) {
        self.faults.lock().fail_saves = fail;
    }

    pub fn set_save_delay(&self, delay: Option<Duration>) {
        self.faults.lock().save_delay = delay;
    }

    pub fn set_load_delay(&self, delay: Option<Duration>) {
        self.faults.lock().load_delay = delay;
    }

    /// Overwrite a stored payload with bytes that will not decode
    pub fn corrupt(&self, checkpoint_ref: &CheckpointRef) -> bool {
        match self.payloads.get_mut(checkpoint_ref) {
            Some(mut payload) => {
                *payload = Bytes::from_static(b"\x00corrupted\x00");
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl DurableCheckpointStore for MemoryCheckpointStore {
    async fn save(&self, instance_id: &InstanceId, payload: Bytes) -> Result<CheckpointRef> {
        let faults = *self.faults.lock();
        if let Some(delay) = faults.save_delay {
            tokio::time::sleep(delay).await;
        }
        if faults.fail_saves {
            return Err(EngineError::StorageFailed(
                "checkpoint store rejected the write".to_string(),
            ));
        }

        let checkpoint_ref = CheckpointRef::new(format!(
            "mem://{}/{}",
            instance_id,
            Ulid::new().to_string().to_lowercase()
        ));
        debug!("Stored {} bytes at {}", payload.len(), checkpoint_ref);
        self.payloads.insert(checkpoint_ref.clone(), payload);
        Ok(checkpoint_ref)
    }

    async fn load(&self, checkpoint_ref: &CheckpointRef) -> Result<Bytes> {
        let delay = self.faults.lock().load_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.payloads
            .get(checkpoint_ref)
            .map(|payload| payload.value().clone())
            .ok_or_else(|| EngineError::CheckpointNotFound(checkpoint_ref.to_string()))
    }

    async fn list_pending_recovery(
        &self,
        instance_id: Option<&InstanceId>,
    ) -> Result<Vec<RecoveryDescriptor>> {
        let mut descriptors: Vec<RecoveryDescriptor> = match instance_id {
            Some(id) => self
                .recovery
                .get(id)
                .map(|entry| vec![entry.value().clone()])
                .unwrap_or_default(),
            None => self
                .recovery
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
        };
        descriptors.sort_by_key(|d| d.marked_at);
        Ok(descriptors)
    }

    async fn mark_pending_recovery(&self, descriptor: RecoveryDescriptor) -> Result<()> {
        self.recovery
            .insert(descriptor.instance_id.clone(), descriptor);
        Ok(())
    }

    async fn clear_recovery(&self, instance_id: &InstanceId) -> Result<()> {
        self.recovery.remove(instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryCheckpointStore::new();
        let id = InstanceId::generate();
        let r = store.save(&id, Bytes::from_static(b"state")).await.unwrap();
        assert_eq!(store.load(&r).await.unwrap(), Bytes::from_static(b"state"));
        assert_eq!(store.payload_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ref_is_not_found() {
        let store = MemoryCheckpointStore::new();
        let err = store.load(&CheckpointRef::new("mem://nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::CheckpointNotFound(_)));
    }

    #[tokio::test]
    async fn test_failing_saves() {
        let store = MemoryCheckpointStore::new();
        store.set_fail_saves(true);
        let err = store
            .save(&InstanceId::generate(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StorageFailed(_)));
        assert_eq!(store.payload_count(), 0);
    }
}
