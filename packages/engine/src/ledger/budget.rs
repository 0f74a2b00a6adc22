// packages/engine/src/ledger/budget.rs
//! Per-instance resource budget

use super::limits::ResourceLimits;
use super::EnforcementMode;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Token window plus cumulative CPU and memory usage for one instance
///
/// Window resets are lazy: the budget is only reset when an operation touches
/// it after `window_reset_at`. A reset zeroes consumption and advances
/// `window_reset_at` by exactly one window, so an instance that sat idle for
/// several windows catches up one window per touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub allocated_tokens_per_window: u64,
    pub consumed_tokens: u64,
    pub window_reset_at: DateTime<Utc>,
    pub cpu_limit_seconds: Option<f64>,
    pub memory_limit_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_used_seconds: f64,
    #[serde(default)]
    pub memory_peak_bytes: u64,
}

impl ResourceBudget {
    pub fn new(limits: &ResourceLimits, now: DateTime<Utc>, window: ChronoDuration) -> Self {
        Self {
            allocated_tokens_per_window: limits.tokens_per_window,
            consumed_tokens: 0,
            window_reset_at: now + window,
            cpu_limit_seconds: limits.cpu_seconds,
            memory_limit_bytes: limits.memory_bytes,
            cpu_used_seconds: 0.0,
            memory_peak_bytes: 0,
        }
    }

    pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset_at
    }

    /// Apply at most one pending window reset. Returns true when one happened.
    pub fn apply_window_reset(&mut self, now: DateTime<Utc>, window: ChronoDuration) -> bool {
        if !self.reset_due(now) {
            return false;
        }
        self.consumed_tokens = 0;
        self.window_reset_at = self.window_reset_at + window;
        true
    }

    /// Copy of this budget as it would look after the next touch
    pub fn projected(&self, now: DateTime<Utc>, window: ChronoDuration) -> Self {
        let mut view = self.clone();
        view.apply_window_reset(now, window);
        view
    }

    /// Tokens left in the current window, floored at zero
    pub fn remaining(&self) -> u64 {
        self.allocated_tokens_per_window
            .saturating_sub(self.consumed_tokens)
    }

    pub fn is_exceeded(&self) -> bool {
        self.consumed_tokens > self.allocated_tokens_per_window
    }

    /// Consumption as a fraction of the allocation
    pub fn utilization(&self) -> f64 {
        if self.allocated_tokens_per_window == 0 {
            return 1.0;
        }
        self.consumed_tokens as f64 / self.allocated_tokens_per_window as f64
    }

    /// Record consumed tokens. Returns the overage beyond the allocation.
    pub fn consume(&mut self, tokens: u64, mode: EnforcementMode) -> u64 {
        let total = self.consumed_tokens.saturating_add(tokens);
        let overage = total.saturating_sub(self.allocated_tokens_per_window);
        self.consumed_tokens = match mode {
            EnforcementMode::Soft => total,
            EnforcementMode::Hard => total.min(self.allocated_tokens_per_window),
        };
        overage
    }

    pub fn cpu_exceeded(&self) -> bool {
        self.cpu_limit_seconds
            .map(|limit| self.cpu_used_seconds > limit)
            .unwrap_or(false)
    }

    pub fn memory_exceeded(&self) -> bool {
        self.memory_limit_bytes
            .map(|limit| self.memory_peak_bytes > limit)
            .unwrap_or(false)
    }
}
