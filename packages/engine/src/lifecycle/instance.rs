// packages/engine/src/lifecycle/instance.rs
//! Instance records and spawn configuration

use super::state::InstanceState;
use crate::bridges::provisioning::EnvironmentHandle;
use crate::ledger::{ResourceBudget, ResourceLimits};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{ExecutionId, GraphId, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label keys accepted in [`SpawnConfig::labels`]
///
/// Anything else belongs in `extensions`.
pub const RECOGNIZED_LABELS: &[&str] = &["owner", "team", "purpose", "environment", "cost_center"];

/// Trust level of the workload, which selects the isolation tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Standard,
    Untrusted,
    Confidential,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::Standard => "standard",
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Confidential => "confidential",
        }
    }

    pub fn all() -> Vec<TrustLevel> {
        vec![
            TrustLevel::Trusted,
            TrustLevel::Standard,
            TrustLevel::Untrusted,
            TrustLevel::Confidential,
        ]
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spawn request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Reuse an id, e.g. to recover an instance from its pending checkpoint
    pub instance_id: Option<InstanceId>,

    pub trust_level: TrustLevel,

    pub limits: ResourceLimits,

    /// Namespace the instance is admitted into; defaults to the configured one
    pub namespace: Option<String>,

    /// Higher priority instances are drained last on scale-down
    pub priority: i32,

    /// External session this instance serves, referenced by id only
    pub session_id: Option<String>,

    /// Graph to start as soon as the instance is running
    pub graph: Option<GraphId>,

    /// Pre-provisioned environment, set by warm-pool activation
    pub environment: Option<EnvironmentHandle>,

    /// Recognized labels, see [`RECOGNIZED_LABELS`]
    pub labels: BTreeMap<String, String>,

    /// Opaque data carried along untouched
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self::new(TrustLevel::Standard)
    }
}

impl SpawnConfig {
    pub fn new(trust_level: TrustLevel) -> Self {
        Self {
            instance_id: None,
            trust_level,
            limits: ResourceLimits::for_trust(trust_level),
            namespace: None,
            priority: 0,
            session_id: None,
            graph: None,
            environment: None,
            labels: BTreeMap::new(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_instance_id(mut self, id: InstanceId) -> Self {
        self.instance_id = Some(id);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_tokens_per_window(mut self, tokens: u64) -> Self {
        self.limits.tokens_per_window = tokens;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_graph(mut self, graph: GraphId) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentHandle) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Structural checks that do not depend on namespace ceilings
    pub fn validate(&self) -> Result<()> {
        if let Some(label) = self
            .labels
            .keys()
            .find(|key| !RECOGNIZED_LABELS.contains(&key.as_str()))
        {
            return Err(EngineError::SpawnRejected(format!(
                "unrecognized label '{}', use extensions for custom data",
                label
            )));
        }

        if let (Some(env), Some(id)) = (&self.environment, &self.instance_id) {
            if &env.instance_id != id {
                return Err(EngineError::SpawnRejected(format!(
                    "environment {} was provisioned for {}, not {}",
                    env.id, env.instance_id, id
                )));
            }
        }

        Ok(())
    }
}

/// Snapshot of one managed instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub trust_level: TrustLevel,
    pub namespace: String,
    pub priority: i32,
    pub session_id: Option<String>,
    pub budget: ResourceBudget,
    pub current_graph_execution_id: Option<ExecutionId>,
    pub environment: Option<EnvironmentHandle>,
    pub labels: BTreeMap<String, String>,
    pub extensions: BTreeMap<String, serde_json::Value>,
    pub restart_attempts: u32,
    /// Whether new work is accepted; cleared while draining
    pub admitting: bool,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<String>,
    pub failure_reason: Option<String>,
}

impl Instance {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time since the last step activity
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::provisioning::IsolationTier;

    #[test]
    fn test_spawn_config_defaults_follow_trust() {
        let config = SpawnConfig::new(TrustLevel::Untrusted);
        assert_eq!(config.limits, ResourceLimits::strict());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_label_is_rejected() {
        let config = SpawnConfig::default().with_label("colour", "blue");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::SpawnRejected(_)));

        let ok = SpawnConfig::default()
            .with_label("owner", "search-team")
            .with_extension("colour", serde_json::json!("blue"));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_environment_must_match_instance() {
        let env = EnvironmentHandle {
            id: "env_1".to_string(),
            instance_id: InstanceId::new("inst_a"),
            tier: IsolationTier::Container,
            provisioned_at: Utc::now(),
        };
        let config = SpawnConfig::default()
            .with_instance_id(InstanceId::new("inst_b"))
            .with_environment(env);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_spawn_config_from_yaml() {
        let yaml = r#"
trust_level: confidential
priority: 3
labels:
  owner: research
extensions:
  model_hint: large
"#;
        let config: SpawnConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.trust_level, TrustLevel::Confidential);
        assert_eq!(config.priority, 3);
        assert_eq!(config.labels["owner"], "research");
        assert_eq!(config.extensions["model_hint"], serde_json::json!("large"));
    }
}
