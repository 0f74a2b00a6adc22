// packages/engine/src/agent_core.rs
//! Engine composition
//!
//! [`AgentCore`] wires the ledger, checkpoint adapter, graph engine,
//! lifecycle controller, fleet coordinator and event recorder together from
//! the collaborators a host supplies:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use agentcore_engine::{AgentCore, EngineConfig};
//! # use agentcore_engine::testing::ScriptedInference;
//! # async fn run() -> agentcore_engine::Result<()> {
//! let core = AgentCore::builder(EngineConfig::load()?)
//!     .inference(Arc::new(ScriptedInference::new()))
//!     .build()
//!     .await?;
//!
//! core.fleet().scale_up(2, "warm start").await?;
//! core.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::bridges::{InferenceBridge, KnowledgeBridge, LocalProvisioner, Provisioner};
use crate::checkpoint::{
    CheckpointAdapter, DurableCheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore, SqliteStoreConfig,
};
use crate::fleet::FleetCoordinator;
use crate::graph::GraphEngine;
use crate::ledger::ResourceLedger;
use crate::lifecycle::{ControllerDeps, LifecycleController};
use crate::observability::{EventRecorder, EventSink, RecorderConfig, TracingEventSink};
use crate::utils::clock::{Clock, SystemClock};
use crate::utils::config::{CheckpointBackend, EngineConfig};
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use tracing::info;

/// A running engine
#[derive(Debug)]
pub struct AgentCore {
    config: EngineConfig,
    ledger: Arc<ResourceLedger>,
    checkpoints: Arc<CheckpointAdapter>,
    controller: Arc<LifecycleController>,
    fleet: Arc<FleetCoordinator>,
    recorder: Arc<EventRecorder>,
}

impl AgentCore {
    pub fn builder(config: EngineConfig) -> AgentCoreBuilder {
        AgentCoreBuilder {
            config,
            inference: None,
            knowledge: None,
            provisioner: None,
            checkpoint_store: None,
            event_sink: None,
            clock: None,
            recorder_config: RecorderConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointAdapter> {
        &self.checkpoints
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn fleet(&self) -> &Arc<FleetCoordinator> {
        &self.fleet
    }

    pub fn recorder(&self) -> &Arc<EventRecorder> {
        &self.recorder
    }

    /// Stop background work, cancel in-flight runs and flush pending events
    pub async fn shutdown(&self) {
        info!("Shutting down agent core");
        self.fleet.shutdown().await;
        self.controller.shutdown().await;
        self.recorder.shutdown().await;
    }
}

/// Builder for [`AgentCore`]
///
/// Only the inference bridge is required. Everything else falls back to a
/// local default: [`LocalProvisioner`], the store named by
/// `checkpoint.backend`, and a sink that logs through `tracing`.
pub struct AgentCoreBuilder {
    config: EngineConfig,
    inference: Option<Arc<dyn InferenceBridge>>,
    knowledge: Option<Arc<dyn KnowledgeBridge>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    checkpoint_store: Option<Arc<dyn DurableCheckpointStore>>,
    event_sink: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    recorder_config: RecorderConfig,
}

impl AgentCoreBuilder {
    pub fn inference(mut self, inference: Arc<dyn InferenceBridge>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn knowledge(mut self, knowledge: Arc<dyn KnowledgeBridge>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Use this store instead of the configured backend
    pub fn checkpoint_store(mut self, store: Arc<dyn DurableCheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn recorder_config(mut self, config: RecorderConfig) -> Self {
        self.recorder_config = config;
        self
    }

    /// Validate the configuration, wire every component and start the
    /// background tasks
    pub async fn build(self) -> Result<AgentCore> {
        let config = self.config;
        config.validate()?;
        let inference = self
            .inference
            .ok_or_else(|| EngineError::ConfigError("an inference bridge is required".into()))?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let provisioner = self.provisioner.unwrap_or_else(|| {
            Arc::new(LocalProvisioner::new(
                config.namespace.max_instances + config.fleet.warm_pool_capacity,
            ))
        });
        let store: Arc<dyn DurableCheckpointStore> = match self.checkpoint_store {
            Some(store) => store,
            None => match &config.checkpoint.backend {
                CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
                CheckpointBackend::Sqlite { base_dir } => {
                    Arc::new(SqliteCheckpointStore::open(SqliteStoreConfig::new(base_dir.clone())).await?)
                }
            },
        };
        let sink = self.event_sink.unwrap_or_else(|| Arc::new(TracingEventSink));

        let ledger = Arc::new(ResourceLedger::new(config.ledger.clone(), clock.clone()));
        let checkpoints = Arc::new(CheckpointAdapter::new(store, config.checkpoint.clone(), clock.clone()));
        let mut engine = GraphEngine::new(config.graph.clone(), ledger.clone(), inference);
        if let Some(knowledge) = self.knowledge {
            engine = engine.with_knowledge(knowledge);
        }
        let recorder = Arc::new(EventRecorder::new(self.recorder_config, sink, clock.clone()));

        let controller = LifecycleController::new(
            config.lifecycle.clone(),
            config.namespace.clone(),
            ControllerDeps {
                ledger: ledger.clone(),
                checkpoints: checkpoints.clone(),
                engine,
                provisioner: provisioner.clone(),
                recorder: recorder.clone(),
                clock: clock.clone(),
            },
        );
        let fleet = FleetCoordinator::new(config.fleet.clone(), controller.clone(), provisioner, clock);

        recorder.start();
        controller.start();
        fleet.start();
        info!(
            "Agent core started (namespace {}, warm pool target {})",
            config.namespace.name, config.fleet.warm_pool_target
        );

        Ok(AgentCore {
            config,
            ledger,
            checkpoints,
            controller,
            fleet,
            recorder,
        })
    }
}
