// packages/engine/src/ledger/mod.rs
//! Resource ledger
//!
//! Tracks token, CPU and memory budgets per instance:
//!
//! - **Limits**: requested resource limits and namespace admission
//! - **Budget**: the per-instance token window and usage samples
//! - **Ledger**: concurrent accounting with a per-instance lock
//!
//! The ledger records consumption; it never decides what to do about an
//! overrun. Reservations that exceed the allocation are accepted and flagged,
//! and the caller applies the configured [`ExhaustionAction`].

pub mod budget;
pub mod ledger;
pub mod limits;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use budget::ResourceBudget;
pub use ledger::{Reservation, ResourceLedger, UsageReport, UsageSample};
pub use limits::{ResourceLimiter, ResourceLimits};

/// Action taken when an instance exhausts its token budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionAction {
    /// Log and emit a warning, keep executing
    Warn,
    /// Delay each step, keep executing
    Throttle,
    /// Checkpoint and suspend the instance
    Suspend,
    /// Terminate the instance
    Terminate,
}

impl ExhaustionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustionAction::Warn => "warn",
            ExhaustionAction::Throttle => "throttle",
            ExhaustionAction::Suspend => "suspend",
            ExhaustionAction::Terminate => "terminate",
        }
    }

    /// Whether execution stops under this action
    pub fn halts(&self) -> bool {
        matches!(self, ExhaustionAction::Suspend | ExhaustionAction::Terminate)
    }
}

impl fmt::Display for ExhaustionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How overage is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Record the full consumption, even above the allocation
    Soft,
    /// Clamp recorded consumption at the allocation
    Hard,
}
