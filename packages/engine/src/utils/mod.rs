// packages/engine/src/utils/mod.rs
//! Shared utilities: errors, configuration, identifiers and time

pub mod clock;
pub mod config;
pub mod errors;
pub mod ids;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use errors::{EngineError, Result};
pub use ids::{CheckpointId, ExecutionId, GraphId, InstanceId, PoolEntryId};
