// packages/engine/src/ledger/ledger.rs
//! Concurrent resource accounting
//!
//! Budgets live in a [`DashMap`] keyed by instance. Each budget sits behind
//! its own mutex so concurrent reservations against one instance serialize
//! while different instances proceed independently.

use super::budget::ResourceBudget;
use super::limits::ResourceLimits;
use crate::utils::clock::{to_chrono, Clock};
use crate::utils::config::LedgerConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::InstanceId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a token reservation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub instance_id: InstanceId,
    pub tokens: u64,
    pub consumed: u64,
    pub allocated: u64,
    pub remaining: u64,

    /// Consumption now exceeds the allocation
    pub exceeded: bool,

    /// Tokens beyond the allocation after this reservation
    pub overage: u64,

    /// This reservation pushed utilization past the warning ratio
    pub crossed_warning: bool,

    /// A window reset was applied before recording
    pub window_reset: bool,

    pub window_reset_at: DateTime<Utc>,
}

/// Cumulative usage reported by an execution environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub cpu_seconds_total: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub cpu_used_seconds: f64,
    pub memory_peak_bytes: u64,
    pub cpu_exceeded: bool,
    pub memory_exceeded: bool,
}

impl UsageReport {
    pub fn exceeded(&self) -> bool {
        self.cpu_exceeded || self.memory_exceeded
    }
}

/// Token and resource ledger shared by every instance in a namespace
#[derive(Debug)]
pub struct ResourceLedger {
    budgets: DashMap<InstanceId, Arc<Mutex<ResourceBudget>>>,
    config: LedgerConfig,
    window: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl ResourceLedger {
    pub fn new(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        let window = to_chrono(config.window());
        Self {
            budgets: DashMap::new(),
            config,
            window,
            clock,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Open a fresh budget for an instance, replacing any previous one
    pub fn open(&self, instance_id: &InstanceId, limits: &ResourceLimits) -> ResourceBudget {
        let budget = ResourceBudget::new(limits, self.clock.now(), self.window);
        self.budgets
            .insert(instance_id.clone(), Arc::new(Mutex::new(budget.clone())));

        debug!(
            "Opened budget for {}: {} tokens per window",
            instance_id, limits.tokens_per_window
        );
        budget
    }

    /// Reinstate a budget captured in a checkpoint
    ///
    /// The saved `window_reset_at` is kept; if it already lies in the past the
    /// usual lazy reset applies on the next touch.
    pub fn restore(&self, instance_id: &InstanceId, budget: ResourceBudget) {
        debug!(
            "Restored budget for {}: {}/{} tokens consumed",
            instance_id, budget.consumed_tokens, budget.allocated_tokens_per_window
        );
        self.budgets
            .insert(instance_id.clone(), Arc::new(Mutex::new(budget)));
    }

    /// Remove an instance's budget, returning its final state
    pub fn close(&self, instance_id: &InstanceId) -> Option<ResourceBudget> {
        self.budgets
            .remove(instance_id)
            .map(|(_, entry)| entry.lock().clone())
    }

    pub fn contains(&self, instance_id: &InstanceId) -> bool {
        self.budgets.contains_key(instance_id)
    }

    pub fn instance_count(&self) -> usize {
        self.budgets.len()
    }

    fn entry(&self, instance_id: &InstanceId) -> Result<Arc<Mutex<ResourceBudget>>> {
        self.budgets
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))
    }

    /// Record token consumption against an instance's window
    ///
    /// Never rejects for exhaustion: the reservation is recorded (clamped in
    /// hard mode) and flagged so the caller can apply its exhaustion action.
    pub fn reserve(&self, instance_id: &InstanceId, tokens: u64) -> Result<Reservation> {
        let entry = self.entry(instance_id)?;
        let now = self.clock.now();

        let mut budget = entry.lock();
        let window_reset = budget.apply_window_reset(now, self.window);
        let before = budget.utilization();
        let overage = budget.consume(tokens, self.config.enforcement);
        let after = budget.utilization();

        let reservation = Reservation {
            instance_id: instance_id.clone(),
            tokens,
            consumed: budget.consumed_tokens,
            allocated: budget.allocated_tokens_per_window,
            remaining: budget.remaining(),
            exceeded: overage > 0,
            overage,
            crossed_warning: before < self.config.warn_ratio && after >= self.config.warn_ratio,
            window_reset,
            window_reset_at: budget.window_reset_at,
        };
        drop(budget);

        metrics::counter!("agentcore_tokens_reserved_total").increment(tokens);
        if reservation.exceeded {
            metrics::counter!("agentcore_budget_exceeded_total").increment(1);
            warn!(
                "Instance {} exceeded token budget: {}/{} (+{} over)",
                instance_id, reservation.consumed, reservation.allocated, overage
            );
        }

        Ok(reservation)
    }

    /// Tokens left in the current window, never negative
    ///
    /// Read-only: a pending window reset is reflected in the answer but not
    /// applied.
    pub fn check_budget(&self, instance_id: &InstanceId) -> Result<u64> {
        let entry = self.entry(instance_id)?;
        let now = self.clock.now();
        let budget = entry.lock();
        if budget.reset_due(now) {
            return Ok(budget.allocated_tokens_per_window);
        }
        Ok(budget.remaining())
    }

    /// Fold a cumulative usage sample into the budget
    ///
    /// Touches the budget like `reserve`, so a due window reset is applied.
    pub fn record_usage(&self, instance_id: &InstanceId, sample: UsageSample) -> Result<UsageReport> {
        let entry = self.entry(instance_id)?;
        let now = self.clock.now();
        let mut budget = entry.lock();
        budget.apply_window_reset(now, self.window);

        budget.cpu_used_seconds = budget.cpu_used_seconds.max(sample.cpu_seconds_total);
        budget.memory_peak_bytes = budget.memory_peak_bytes.max(sample.memory_bytes);

        Ok(UsageReport {
            cpu_used_seconds: budget.cpu_used_seconds,
            memory_peak_bytes: budget.memory_peak_bytes,
            cpu_exceeded: budget.cpu_exceeded(),
            memory_exceeded: budget.memory_exceeded(),
        })
    }

    /// Current budget, with any pending reset projected
    pub fn snapshot(&self, instance_id: &InstanceId) -> Result<ResourceBudget> {
        let entry = self.entry(instance_id)?;
        let now = self.clock.now();
        let budget = entry.lock();
        Ok(budget.projected(now, self.window))
    }
}
