// packages/engine/src/checkpoint/store.rs
//! Durable checkpoint store contract

use super::model::{CheckpointRef, RecoveryDescriptor};
use crate::utils::errors::Result;
use crate::utils::ids::InstanceId;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;

/// External store holding checkpoint payloads and recovery markers
///
/// `load` fails with `CheckpointNotFound` for unknown refs. Stores that can
/// detect damaged bytes report `CheckpointCorrupted`; the payload codec
/// catches the rest.
#[async_trait]
pub trait DurableCheckpointStore: Send + Sync + Debug {
    async fn save(&self, instance_id: &InstanceId, payload: Bytes) -> Result<CheckpointRef>;

    async fn load(&self, checkpoint_ref: &CheckpointRef) -> Result<Bytes>;

    /// Pending recovery markers, for one instance or all of them
    async fn list_pending_recovery(
        &self,
        instance_id: Option<&InstanceId>,
    ) -> Result<Vec<RecoveryDescriptor>>;

    /// Record (or replace) the recovery marker for an instance
    async fn mark_pending_recovery(&self, descriptor: RecoveryDescriptor) -> Result<()>;

    async fn clear_recovery(&self, instance_id: &InstanceId) -> Result<()>;
}
