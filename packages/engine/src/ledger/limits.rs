// packages/engine/src/ledger/limits.rs
//! Resource limits and namespace admission
//!
//! Provides:
//! - CPU budget (cumulative CPU seconds)
//! - Memory ceiling (peak bytes)
//! - Token allocation per budget window

use crate::lifecycle::instance::TrustLevel;
use crate::utils::config::NamespaceCeilings;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const MIB: u64 = 1024 * 1024;

/// Resource limits requested for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Cumulative CPU seconds the instance may use
    pub cpu_seconds: Option<f64>,

    /// Peak memory in bytes
    pub memory_bytes: Option<u64>,

    /// Tokens granted per budget window
    pub tokens_per_window: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: Some(3_600.0),
            memory_bytes: Some(512 * MIB),
            tokens_per_window: 100_000,
        }
    }
}

impl ResourceLimits {
    /// Tight limits for untrusted workloads
    pub fn strict() -> Self {
        Self {
            cpu_seconds: Some(600.0),
            memory_bytes: Some(256 * MIB),
            tokens_per_window: 20_000,
        }
    }

    /// Generous limits for trusted workloads
    pub fn relaxed() -> Self {
        Self {
            cpu_seconds: Some(14_400.0),
            memory_bytes: Some(2_048 * MIB),
            tokens_per_window: 500_000,
        }
    }

    /// Preset matching a trust level
    pub fn for_trust(level: TrustLevel) -> Self {
        match level {
            TrustLevel::Trusted => Self::relaxed(),
            TrustLevel::Standard | TrustLevel::Confidential => Self::default(),
            TrustLevel::Untrusted => Self::strict(),
        }
    }

    pub fn with_tokens_per_window(mut self, tokens: u64) -> Self {
        self.tokens_per_window = tokens;
        self
    }

    /// Check the limits are sane on their own
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.tokens_per_window == 0 {
            return Err("Token allocation cannot be 0".to_string());
        }

        if let Some(cpu) = self.cpu_seconds {
            if !cpu.is_finite() || cpu <= 0.0 {
                return Err("CPU budget must be a positive number of seconds".to_string());
            }
        }

        if let Some(memory) = self.memory_bytes {
            if memory < 64 * MIB {
                return Err("Memory limit cannot be less than 64MB".to_string());
            }
        }

        Ok(())
    }

    /// Check the limits fit within namespace ceilings
    pub fn validate_against(&self, ceilings: &NamespaceCeilings) -> std::result::Result<(), String> {
        self.validate()?;

        if self.tokens_per_window > ceilings.max_tokens_per_window {
            return Err(format!(
                "Token allocation {} exceeds namespace ceiling {}",
                self.tokens_per_window, ceilings.max_tokens_per_window
            ));
        }

        // An unbounded request is only admissible when the namespace itself
        // would accept the ceiling value.
        let cpu = self.cpu_seconds.unwrap_or(f64::INFINITY);
        if cpu > ceilings.max_cpu_seconds {
            return Err(format!(
                "CPU budget {}s exceeds namespace ceiling {}s",
                cpu, ceilings.max_cpu_seconds
            ));
        }

        let memory = self.memory_bytes.unwrap_or(u64::MAX);
        if memory > ceilings.max_memory_bytes {
            return Err(format!(
                "Memory limit {} bytes exceeds namespace ceiling {} bytes",
                memory, ceilings.max_memory_bytes
            ));
        }

        Ok(())
    }
}

/// Admission checks for spawn requests within one namespace
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    ceilings: NamespaceCeilings,
}

impl ResourceLimiter {
    pub fn new(ceilings: NamespaceCeilings) -> Self {
        Self { ceilings }
    }

    pub fn ceilings(&self) -> &NamespaceCeilings {
        &self.ceilings
    }

    /// Validate trust level and limits for a spawn request
    pub fn admit(&self, trust_level: TrustLevel, limits: &ResourceLimits) -> Result<()> {
        if !self.ceilings.allowed_trust_levels.contains(&trust_level) {
            return Err(EngineError::SpawnRejected(format!(
                "trust level {} is not allowed in namespace '{}'",
                trust_level, self.ceilings.name
            )));
        }

        limits
            .validate_against(&self.ceilings)
            .map_err(EngineError::SpawnRejected)?;

        debug!(trust = %trust_level, tokens = limits.tokens_per_window, "spawn limits admitted");
        Ok(())
    }

    /// Whether another live instance fits under the namespace ceiling
    pub fn has_capacity(&self, live_instances: usize) -> bool {
        live_instances < self.ceilings.max_instances
    }
}

impl Default for ResourceLimiter {
    fn default() -> Self {
        Self::new(NamespaceCeilings::default())
    }
}
