// packages/engine/src/observability/events.rs
//! Lifecycle audit events and the sinks that receive them

use crate::checkpoint::model::CheckpointKind;
use crate::fleet::ScaleDirection;
use crate::ledger::ExhaustionAction;
use crate::lifecycle::instance::TrustLevel;
use crate::utils::errors::Result;
use crate::utils::ids::{CheckpointId, InstanceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tracing::info;

/// Event-specific payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Spawned {
        trust_level: TrustLevel,
        /// Checkpoint the instance was recovered from, if any
        restored_from: Option<CheckpointId>,
        warm: bool,
    },
    Terminated {
        reason: String,
        forced: bool,
        drain_skipped: bool,
    },
    Suspended {
        reason: String,
        checkpoint_id: Option<CheckpointId>,
    },
    Resumed {
        checkpoint_id: Option<CheckpointId>,
    },
    CheckpointCreated {
        checkpoint_id: CheckpointId,
        kind: CheckpointKind,
        size_bytes: u64,
    },
    CheckpointRestored {
        checkpoint_id: CheckpointId,
    },
    ResourceWarning {
        consumed: u64,
        allocated: u64,
    },
    ResourceExceeded {
        consumed: u64,
        allocated: u64,
        action: ExhaustionAction,
    },
    FleetScaled {
        direction: ScaleDirection,
        reason: String,
    },
    Failed {
        reason: String,
    },
    Restarted {
        attempt: u32,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Spawned { .. } => "spawned",
            EventKind::Terminated { .. } => "terminated",
            EventKind::Suspended { .. } => "suspended",
            EventKind::Resumed { .. } => "resumed",
            EventKind::CheckpointCreated { .. } => "checkpoint_created",
            EventKind::CheckpointRestored { .. } => "checkpoint_restored",
            EventKind::ResourceWarning { .. } => "resource_warning",
            EventKind::ResourceExceeded { .. } => "resource_exceeded",
            EventKind::FleetScaled { .. } => "fleet_scaled",
            EventKind::Failed { .. } => "failed",
            EventKind::Restarted { .. } => "restarted",
        }
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub instance_id: InstanceId,
    /// Strictly increasing per instance, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

/// Destination for published event batches
#[async_trait]
pub trait EventSink: Send + Sync + Debug {
    async fn publish(&self, batch: Vec<LifecycleEvent>) -> Result<()>;
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn for_instance(&self, instance_id: &InstanceId) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| &event.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Event names for one instance, in publication order
    pub fn names_for(&self, instance_id: &InstanceId) -> Vec<&'static str> {
        self.events
            .lock()
            .iter()
            .filter(|event| &event.instance_id == instance_id)
            .map(|event| event.kind.name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, batch: Vec<LifecycleEvent>) -> Result<()> {
        self.events.lock().extend(batch);
        Ok(())
    }
}

/// Writes each event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, batch: Vec<LifecycleEvent>) -> Result<()> {
        for event in batch {
            let payload = serde_json::to_string(&event.kind)?;
            info!(
                target: "agentcore::audit",
                instance_id = %event.instance_id,
                sequence = event.sequence,
                event = event.kind.name(),
                "{}",
                payload
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, sequence: u64, kind: EventKind) -> LifecycleEvent {
        LifecycleEvent {
            instance_id: InstanceId::new(id),
            sequence,
            timestamp: Utc::now(),
            kind,
        }
    }

    #[test]
    fn test_kind_serializes_with_type_tag() {
        let kind = EventKind::ResourceExceeded {
            consumed: 1500,
            allocated: 1000,
            action: ExhaustionAction::Suspend,
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "resource_exceeded");
        assert_eq!(value["action"], "suspend");
        assert_eq!(kind.name(), "resource_exceeded");
    }

    #[tokio::test]
    async fn test_memory_sink_filters_by_instance() {
        let sink = MemoryEventSink::new();
        sink.publish(vec![
            event("inst_a", 1, EventKind::Resumed { checkpoint_id: None }),
            event("inst_b", 1, EventKind::Failed { reason: "boom".into() }),
            event("inst_a", 2, EventKind::Restarted { attempt: 1 }),
        ])
        .await
        .unwrap();

        assert_eq!(sink.len(), 3);
        assert_eq!(
            sink.names_for(&InstanceId::new("inst_a")),
            vec!["resumed", "restarted"]
        );
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_batches() {
        let sink = TracingEventSink;
        let result = sink
            .publish(vec![event("inst_a", 1, EventKind::Restarted { attempt: 2 })])
            .await;
        assert!(result.is_ok());
    }
}
