// packages/engine/src/utils/errors.rs
//! Error taxonomy for the execution core
//!
//! Every public operation returns either a success value or exactly one
//! [`EngineError`]. Variants map one-to-one onto the failure classes callers
//! are expected to react to:
//!
//! - **State machine**: [`EngineError::InvalidTransition`] is always a caller
//!   bug and is never retried.
//! - **Admission**: `SpawnRejected` / `SpawnTimeout` are retried internally with
//!   backoff before surfacing; `ResourceExhausted` means no capacity remains.
//! - **Budget**: `BudgetExhausted` carries the configured exhaustion action.
//! - **Graph**: `GraphCycleDetected` / `GraphDepthExceeded` are fatal to the
//!   execution that raised them.
//! - **Checkpoint**: `CheckpointFailed`, `CheckpointCorrupted`, `RestoreFailed`.

use crate::ledger::ExhaustionAction;
use crate::lifecycle::state::InstanceState;
use crate::utils::ids::InstanceId;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error types
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid transition for instance {instance_id}: {from} -> {to}")]
    InvalidTransition {
        instance_id: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("spawn rejected: {0}")]
    SpawnRejected(String),

    #[error("spawn not confirmed within {0:?}")]
    SpawnTimeout(Duration),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("token budget exhausted for instance {instance_id} (action: {action})")]
    BudgetExhausted {
        instance_id: InstanceId,
        action: ExhaustionAction,
    },

    #[error("graph cycle detected at node '{node}' after {passes} passes without progress")]
    GraphCycleDetected { node: String, passes: u32 },

    #[error("graph depth exceeded at node '{node}' (limit {limit})")]
    GraphDepthExceeded { node: String, limit: u32 },

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("checkpoint failed: {0}")]
    CheckpointFailed(String),

    #[error("checkpoint corrupted: {0}")]
    CheckpointCorrupted(String),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("node '{node}' failed: {reason}")]
    NodeFailed { node: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("instance {0} already has a scale operation in flight")]
    ScaleConflict(InstanceId),

    #[error("scale operation completed {completed} of {requested}: {reason}")]
    ScaleIncomplete {
        completed: usize,
        requested: usize,
        reason: String,
    },

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("storage failed: {0}")]
    StorageFailed(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable snake_case label, used for metrics and audit payloads
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::SpawnRejected(_) => "spawn_rejected",
            EngineError::SpawnTimeout(_) => "spawn_timeout",
            EngineError::ResourceExhausted(_) => "resource_exhausted",
            EngineError::BudgetExhausted { .. } => "budget_exhausted",
            EngineError::GraphCycleDetected { .. } => "graph_cycle_detected",
            EngineError::GraphDepthExceeded { .. } => "graph_depth_exceeded",
            EngineError::InvalidGraph(_) => "invalid_graph",
            EngineError::CheckpointNotFound(_) => "checkpoint_not_found",
            EngineError::CheckpointFailed(_) => "checkpoint_failed",
            EngineError::CheckpointCorrupted(_) => "checkpoint_corrupted",
            EngineError::RestoreFailed(_) => "restore_failed",
            EngineError::InstanceNotFound(_) => "instance_not_found",
            EngineError::Timeout { .. } => "timeout",
            EngineError::NodeFailed { .. } => "node_failed",
            EngineError::Cancelled => "cancelled",
            EngineError::ScaleConflict(_) => "scale_conflict",
            EngineError::ScaleIncomplete { .. } => "scale_incomplete",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::ConfigError(_) => "config_error",
            EngineError::StorageFailed(_) => "storage_failed",
            EngineError::CompressionFailed(_) => "compression_failed",
            EngineError::Serialization(_) => "serialization",
        }
    }

    /// Whether a spawn attempt failing with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::SpawnTimeout(_)
                | EngineError::Timeout { .. }
                | EngineError::StorageFailed(_)
        )
    }

    /// Graph structure violations that end an execution without retry
    pub fn is_graph_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::GraphCycleDetected { .. } | EngineError::GraphDepthExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(EngineError::Cancelled.kind(), "cancelled");
        assert_eq!(
            EngineError::GraphDepthExceeded {
                node: "a".into(),
                limit: 3
            }
            .kind(),
            "graph_depth_exceeded"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(EngineError::SpawnTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!EngineError::SpawnRejected("bad limits".into()).is_retryable());
        assert!(!EngineError::ResourceExhausted("full".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = EngineError::InvalidTransition {
            instance_id: InstanceId::new("inst_1"),
            from: InstanceState::Terminated,
            to: InstanceState::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for instance inst_1: terminated -> running"
        );
    }
}
