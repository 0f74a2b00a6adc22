// packages/engine/src/lib.rs
//! AgentCore Execution Engine Library
//!
//! This library runs long-lived AI agent instances: it moves them through
//! their lifecycle, executes their workflow graphs, meters their resource
//! consumption and persists their state so they survive restarts.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **lifecycle**: Instance state machine, spawn/suspend/resume/drain, restarts
//! - **graph**: Workflow graph definitions and the step-wise execution engine
//! - **ledger**: Sliding-window resource budgets and namespace ceilings
//! - **checkpoint**: Compressed snapshots over pluggable durable stores
//! - **fleet**: Warm pool and bulk scale-up/scale-down
//! - **bridges**: Provisioning, inference and knowledge collaborator contracts
//! - **observability**: Tracing, metrics and sequenced lifecycle events
//! - **agent_core**: Wiring of all of the above into one running engine
//! - **utils**: Configuration, errors, identifiers and clocks

// Public module exports
pub mod agent_core;
pub mod bridges;
pub mod checkpoint;
pub mod fleet;
pub mod graph;
pub mod ledger;
pub mod lifecycle;
pub mod observability;
pub mod testing;
pub mod utils;

// Re-export commonly used types
pub use agent_core::{AgentCore, AgentCoreBuilder};
pub use checkpoint::{Checkpoint, CheckpointAdapter, CheckpointKind};
pub use fleet::{FleetCoordinator, ScaleDirection, ScaleReport, WarmPool};
pub use graph::{Execution, ExecutionStatus, Graph, GraphEngine, NodeDefinition};
pub use ledger::{ResourceBudget, ResourceLedger, ResourceLimits};
pub use lifecycle::{Instance, InstanceState, LifecycleController, SpawnConfig, TrustLevel};
pub use observability::{EventKind, EventRecorder, EventSink, LifecycleEvent};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
    }
}
