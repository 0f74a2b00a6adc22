// packages/engine/src/graph/execution.rs
//! Execution state
//!
//! An execution owns the scratch state and the counters that bound graph
//! traversal. Every node visit goes through [`Execution::record_visit`],
//! which enforces:
//!
//! - at most `max_graph_depth` visits per node
//! - at most `max_total_steps` visits in total
//! - at most `allowed_stalled_passes` revisits of a node whose scratch state
//!   has not changed since its previous visit

use crate::utils::config::GraphConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{ExecutionId, GraphId, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Key/value state shared by the nodes of one execution
pub type Scratch = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    /// Stopped at a node boundary, resumable
    Interrupted,
    Completed,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Interrupted => "interrupted",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One run of a graph for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub graph_id: GraphId,
    pub instance_id: InstanceId,
    /// Next node to run, or the final node once completed
    pub current_node: String,
    pub visited_count: BTreeMap<String, u32>,
    pub scratch_state: Scratch,
    pub total_steps: u32,
    #[serde(default)]
    pub stalled_passes: BTreeMap<String, u32>,
    #[serde(default)]
    pub last_fingerprint: BTreeMap<String, u64>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(graph_id: GraphId, instance_id: InstanceId, entry_node: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::generate(),
            graph_id,
            instance_id,
            current_node: entry_node.into(),
            visited_count: BTreeMap::new(),
            scratch_state: Scratch::new(),
            total_steps: 0,
            stalled_passes: BTreeMap::new(),
            last_fingerprint: BTreeMap::new(),
            status: ExecutionStatus::Running,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn with_scratch(mut self, scratch: Scratch) -> Self {
        self.scratch_state = scratch;
        self
    }

    pub fn visits(&self, node: &str) -> u32 {
        self.visited_count.get(node).copied().unwrap_or(0)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Account for a visit to `node`, failing if a traversal bound is crossed
    ///
    /// Counters are only updated when the visit is allowed.
    pub fn record_visit(&mut self, node: &str, limits: &GraphConfig) -> Result<()> {
        let total = self.total_steps + 1;
        if total > limits.max_total_steps {
            return Err(EngineError::GraphDepthExceeded {
                node: node.to_string(),
                limit: limits.max_total_steps,
            });
        }

        let visits = self.visits(node) + 1;
        if visits > limits.max_graph_depth {
            return Err(EngineError::GraphDepthExceeded {
                node: node.to_string(),
                limit: limits.max_graph_depth,
            });
        }

        let fingerprint = fingerprint(&self.scratch_state);
        let stalled = match self.last_fingerprint.get(node) {
            Some(previous) if *previous == fingerprint => {
                self.stalled_passes.get(node).copied().unwrap_or(0) + 1
            }
            _ => 0,
        };
        if stalled > limits.allowed_stalled_passes {
            return Err(EngineError::GraphCycleDetected {
                node: node.to_string(),
                passes: stalled,
            });
        }

        self.total_steps = total;
        self.visited_count.insert(node.to_string(), visits);
        self.stalled_passes.insert(node.to_string(), stalled);
        self.last_fingerprint.insert(node.to_string(), fingerprint);
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Stable hash of the scratch state
pub fn fingerprint(scratch: &Scratch) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (key, value) in scratch {
        key.hash(&mut hasher);
        value.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits(depth: u32, total: u32, stalled: u32) -> GraphConfig {
        GraphConfig {
            max_graph_depth: depth,
            max_total_steps: total,
            allowed_stalled_passes: stalled,
            ..Default::default()
        }
    }

    fn execution() -> Execution {
        Execution::new(GraphId::new("graph_t"), InstanceId::new("inst_t"), "a")
    }

    #[test]
    fn test_depth_per_node() {
        let limits = limits(3, 100, 10);
        let mut exec = execution();
        for i in 0..3 {
            exec.scratch_state.insert("i".into(), json!(i));
            exec.record_visit("a", &limits).unwrap();
        }
        exec.scratch_state.insert("i".into(), json!(99));
        let err = exec.record_visit("a", &limits).unwrap_err();
        assert!(matches!(err, EngineError::GraphDepthExceeded { limit: 3, .. }));
        assert_eq!(exec.visits("a"), 3);
    }

    #[test]
    fn test_total_steps() {
        let limits = limits(100, 4, 10);
        let mut exec = execution();
        for node in ["a", "b", "c", "d"] {
            exec.record_visit(node, &limits).unwrap();
        }
        let err = exec.record_visit("e", &limits).unwrap_err();
        assert!(matches!(err, EngineError::GraphDepthExceeded { limit: 4, .. }));
    }

    #[test]
    fn test_stalled_revisits_are_cycles() {
        let limits = limits(100, 100, 1);
        let mut exec = execution();
        exec.record_visit("a", &limits).unwrap();
        // one stalled pass is tolerated
        exec.record_visit("a", &limits).unwrap();
        let err = exec.record_visit("a", &limits).unwrap_err();
        assert!(matches!(err, EngineError::GraphCycleDetected { passes: 2, .. }));
    }

    #[test]
    fn test_progress_resets_stall_count() {
        let limits = limits(100, 100, 1);
        let mut exec = execution();
        exec.record_visit("a", &limits).unwrap();
        exec.record_visit("a", &limits).unwrap();
        exec.scratch_state.insert("progress".into(), json!(true));
        exec.record_visit("a", &limits).unwrap();
        exec.record_visit("a", &limits).unwrap();
        assert_eq!(exec.stalled_passes["a"], 1);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let mut scratch = Scratch::new();
        scratch.insert("k".into(), json!("v"));
        let first = fingerprint(&scratch);
        assert_eq!(first, fingerprint(&scratch.clone()));
        scratch.insert("k".into(), json!("w"));
        assert_ne!(first, fingerprint(&scratch));
    }
}
