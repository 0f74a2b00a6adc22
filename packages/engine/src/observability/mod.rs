// packages/engine/src/observability/mod.rs
//! Logging, metrics and audit events
//!
//! - **Tracing**: `tracing-subscriber` fmt output filtered by `RUST_LOG`, falling
//!   back to the configured level
//! - **Metrics**: `metrics` facade backed by a Prometheus recorder
//! - **Audit events**: sequenced lifecycle events published in batches to an
//!   [`EventSink`]

pub mod event_queue;
pub mod events;
pub mod recorder;

pub use event_queue::{EventQueue, QueueStats};
pub use events::{EventKind, EventSink, LifecycleEvent, MemoryEventSink, TracingEventSink};
pub use recorder::{EventRecorder, RecorderConfig, RecorderStats};

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static TRACING: OnceCell<()> = OnceCell::new();
static METRICS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global tracing subscriber
///
/// Later calls return immediately.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    TRACING
        .get_or_try_init(|| {
            let filter = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.level))
                .map_err(|e| EngineError::ConfigError(format!("invalid log filter: {}", e)))?;

            let registry = tracing_subscriber::registry().with(filter);
            let installed = if config.json {
                registry
                    .with(fmt::layer().json().with_target(true))
                    .try_init()
            } else {
                registry.with(fmt::layer().with_target(true)).try_init()
            };

            // Another subscriber may already be installed by the host process
            if let Err(e) = installed {
                tracing::debug!("Tracing subscriber already installed: {}", e);
            }
            Ok(())
        })
        .map(|_| ())
}

/// Install the Prometheus metrics recorder and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    METRICS
        .get_or_try_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| EngineError::ConfigError(format!("metrics recorder: {}", e)))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_noop() {
        let config = LoggingConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }

    #[test]
    fn test_init_metrics_returns_same_handle() {
        let first = init_metrics().unwrap();
        metrics::counter!("agentcore_test_total").increment(1);
        let second = init_metrics().unwrap();
        assert!(second.render().contains("agentcore_test_total"));
        drop(first);
    }
}
