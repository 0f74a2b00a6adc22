// packages/engine/src/fleet/mod.rs
//! Fleet coordination
//!
//! - **Warm pool**: pre-provisioned environments waiting for activation
//! - **Coordinator**: scale up/down through the lifecycle controller, with
//!   graceful drains and per-instance conflict detection

pub mod coordinator;
pub mod warm_pool;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use coordinator::{FleetCoordinator, ScaleReport};
pub use warm_pool::{PoolEntry, PoolStats, WarmPool};

/// Direction of a fleet scale operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl ScaleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
        }
    }
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
