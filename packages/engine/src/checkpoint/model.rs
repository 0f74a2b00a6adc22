// packages/engine/src/checkpoint/model.rs
//! Checkpoint data model

use crate::graph::execution::Execution;
use crate::ledger::ResourceBudget;
use crate::utils::ids::{CheckpointId, ExecutionId, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current payload format
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// What triggered a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Auto,
    Manual,
    PreSuspend,
    PreDrain,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Auto => "auto",
            CheckpointKind::Manual => "manual",
            CheckpointKind::PreSuspend => "pre_suspend",
            CheckpointKind::PreDrain => "pre_drain",
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to bytes held by the durable store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointRef(String);

impl CheckpointRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub instance_id: InstanceId,
    pub execution_id: Option<ExecutionId>,
    pub label: String,
    pub kind: CheckpointKind,
    pub payload_ref: CheckpointRef,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Marker telling a future spawn to restore instead of cold-starting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryDescriptor {
    pub instance_id: InstanceId,
    pub checkpoint: Checkpoint,
    pub marked_at: DateTime<Utc>,
}

/// State captured in a checkpoint payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub format_version: u32,
    pub instance_id: InstanceId,
    pub execution: Option<Execution>,
    pub budget: Option<ResourceBudget>,
    pub captured_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    pub fn new(
        instance_id: InstanceId,
        execution: Option<Execution>,
        budget: Option<ResourceBudget>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            instance_id,
            execution,
            budget,
            captured_at,
        }
    }
}
