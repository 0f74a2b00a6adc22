// packages/engine/src/fleet/coordinator.rs
//! Fleet coordinator
//!
//! Scales the fleet by driving the lifecycle controller in bulk. Scale-up
//! activates warm entries before spawning cold; scale-down drains the idlest,
//! lowest-priority instances first. An instance is the target of at most one
//! scale-driven operation at a time.

use super::warm_pool::{PoolEntry, PoolStats, WarmPool};
use super::ScaleDirection;
use crate::bridges::provisioning::Provisioner;
use crate::lifecycle::{DrainReport, Instance, InstanceState, LifecycleController, SpawnConfig, TaskRegistry};
use crate::observability::EventKind;
use crate::utils::clock::Clock;
use crate::utils::config::FleetConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::InstanceId;
use dashmap::DashSet;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a completed scale operation
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleReport {
    pub direction: ScaleDirection,
    pub reason: String,
    /// Instances started or terminated, in completion order
    pub affected: Vec<InstanceId>,
    pub warm_activations: usize,
    pub cold_spawns: usize,
    /// Drains that hit their timeout and cancelled in-flight work
    pub forced_drains: usize,
}

impl ScaleReport {
    fn new(direction: ScaleDirection, reason: &str) -> Self {
        Self {
            direction,
            reason: reason.to_string(),
            affected: Vec::new(),
            warm_activations: 0,
            cold_spawns: 0,
            forced_drains: 0,
        }
    }
}

/// Marks an instance as the target of a scale operation until dropped
struct InFlight<'a> {
    set: &'a DashSet<InstanceId>,
    id: InstanceId,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a DashSet<InstanceId>, id: &InstanceId) -> Result<Self> {
        if !set.insert(id.clone()) {
            return Err(EngineError::ScaleConflict(id.clone()));
        }
        Ok(Self { set, id: id.clone() })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Drives fleet-wide capacity changes
#[derive(Debug)]
pub struct FleetCoordinator {
    config: FleetConfig,
    controller: Arc<LifecycleController>,
    pool: Arc<WarmPool>,
    in_flight: DashSet<InstanceId>,
    tasks: TaskRegistry,
}

impl FleetCoordinator {
    pub fn new(
        config: FleetConfig,
        controller: Arc<LifecycleController>,
        provisioner: Arc<dyn Provisioner>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let pool = Arc::new(WarmPool::new(&config, provisioner, clock));
        Arc::new(Self {
            config,
            controller,
            pool,
            in_flight: DashSet::new(),
            tasks: TaskRegistry::new(),
        })
    }

    /// Start the periodic warm pool replenisher
    ///
    /// The first pass runs immediately.
    pub fn start(&self) {
        let pool = Arc::clone(&self.pool);
        let interval = self.config.replenish_interval();
        info!(
            "Starting warm pool replenisher (target {}, every {:?})",
            self.config.warm_pool_target, interval
        );
        self.tasks.spawn_global("warm_pool_replenish", move |token| async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if pool.needs_replenish() {
                            pool.replenish().await;
                        }
                    }
                }
            }
        });
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WarmPool> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Live, non-terminal instances
    pub fn fleet_size(&self) -> usize {
        self.controller.live_count()
    }

    /// Pop a warm entry, waiting at most `wait`
    ///
    /// Returns `None` when the pool stays empty; the caller falls back to a
    /// cold spawn. A successful acquisition schedules replenishment.
    pub async fn acquire_warm(&self, wait: Duration) -> Option<PoolEntry> {
        let entry = self.pool.acquire(wait).await;
        if entry.is_some() {
            self.schedule_replenish();
        }
        entry
    }

    fn schedule_replenish(&self) {
        if self.tasks.is_shut_down() {
            return;
        }
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            pool.replenish().await;
        });
    }

    /// Hand a warm entry to the lifecycle controller
    pub async fn activate(&self, entry: PoolEntry, config: SpawnConfig) -> Result<Instance> {
        debug!(instance_id = %entry.instance_id, "Activating warm entry {}", entry.id);
        let config = SpawnConfig {
            trust_level: self.pool.trust_level(),
            ..config
        }
        .with_instance_id(entry.instance_id)
        .with_environment(entry.environment);
        self.controller.spawn(config).await
    }

    /// Add `count` instances, warm entries first
    pub async fn scale_up(&self, count: usize, reason: &str) -> Result<ScaleReport> {
        let mut report = ScaleReport::new(ScaleDirection::Up, reason);
        info!("Scaling up by {} ({})", count, reason);

        for _ in 0..count {
            let spawned = match self.acquire_warm(Duration::ZERO).await {
                Some(entry) => {
                    let template = SpawnConfig::new(self.pool.trust_level()).with_limits(self.pool.limits().clone());
                    self.activate(entry, template).await.map(|instance| (instance, true))
                }
                None => self
                    .controller
                    .spawn(SpawnConfig::new(self.config.default_trust_level))
                    .await
                    .map(|instance| (instance, false)),
            };

            match spawned {
                Ok((instance, warm)) => {
                    if warm {
                        report.warm_activations += 1;
                    } else {
                        report.cold_spawns += 1;
                    }
                    self.record_scaled(&instance.id, ScaleDirection::Up, reason);
                    report.affected.push(instance.id);
                }
                Err(e) => {
                    warn!("Scale-up stopped after {} of {}: {}", report.affected.len(), count, e);
                    return Err(EngineError::ScaleIncomplete {
                        completed: report.affected.len(),
                        requested: count,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Scaled up by {} ({} warm, {} cold)",
            report.affected.len(),
            report.warm_activations,
            report.cold_spawns
        );
        Ok(report)
    }

    /// Drain and terminate `count` instances
    ///
    /// Candidates are instances without an active execution first, then the
    /// lowest priority, then the longest idle.
    pub async fn scale_down(&self, count: usize, reason: &str) -> Result<ScaleReport> {
        let mut report = ScaleReport::new(ScaleDirection::Down, reason);
        let candidates = self.drain_candidates(count);
        info!(
            "Scaling down by {} ({}), {} candidates",
            count,
            reason,
            candidates.len()
        );

        let timeout = self.config.drain_timeout();
        let drains = candidates
            .iter()
            .map(|id| self.graceful_drain(id, timeout));
        let results = join_all(drains).await;

        let mut failure = None;
        for (id, result) in candidates.into_iter().zip(results) {
            match result {
                Ok(drain) => {
                    if drain.forced {
                        report.forced_drains += 1;
                    }
                    self.record_scaled(&id, ScaleDirection::Down, reason);
                    report.affected.push(id);
                }
                Err(e) => {
                    warn!(instance_id = %id, "Scale-down drain failed: {}", e);
                    if failure.is_none() {
                        failure = Some(e.to_string());
                    }
                }
            }
        }

        if report.affected.len() < count {
            let reason = failure.unwrap_or_else(|| "not enough instances to drain".to_string());
            return Err(EngineError::ScaleIncomplete {
                completed: report.affected.len(),
                requested: count,
                reason,
            });
        }

        info!(
            "Scaled down by {} ({} forced)",
            report.affected.len(),
            report.forced_drains
        );
        Ok(report)
    }

    fn drain_candidates(&self, count: usize) -> Vec<InstanceId> {
        let mut candidates: Vec<(bool, Instance)> = self
            .controller
            .list()
            .into_iter()
            .filter(|i| matches!(i.state, InstanceState::Running | InstanceState::Suspended))
            .filter(|i| !self.in_flight.contains(&i.id))
            .map(|i| (self.controller.is_executing(&i.id), i))
            .collect();

        candidates.sort_by(|(busy_a, a), (busy_b, b)| {
            busy_a
                .cmp(busy_b)
                .then(a.priority.cmp(&b.priority))
                .then(a.last_activity_at.cmp(&b.last_activity_at))
        });
        candidates.into_iter().take(count).map(|(_, i)| i.id).collect()
    }

    /// Drain one instance and terminate it
    ///
    /// Fails with `ScaleConflict` while another scale-driven operation
    /// targets the same instance.
    pub async fn graceful_drain(&self, instance_id: &InstanceId, timeout: Duration) -> Result<DrainReport> {
        let _claim = InFlight::claim(&self.in_flight, instance_id)?;
        self.controller.drain(instance_id, timeout).await
    }

    fn record_scaled(&self, instance_id: &InstanceId, direction: ScaleDirection, reason: &str) {
        self.controller.recorder().record(
            instance_id,
            EventKind::FleetScaled {
                direction,
                reason: reason.to_string(),
            },
        );
        metrics::counter!("agentcore_fleet_scaled_total", "direction" => direction.as_str()).increment(1);
    }

    /// Stop the replenisher and release every pooled environment
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
        let released = self.pool.release_all().await;
        info!("Fleet coordinator stopped, released {} warm environments", released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::provisioning::LocalProvisioner;
    use crate::checkpoint::{CheckpointAdapter, MemoryCheckpointStore};
    use crate::graph::{Graph, GraphEngine, NodeDefinition};
    use crate::ledger::ResourceLedger;
    use crate::lifecycle::{ControllerDeps, TrustLevel};
    use crate::observability::{EventRecorder, MemoryEventSink, RecorderConfig};
    use crate::testing::ScriptedInference;
    use crate::utils::clock::ManualClock;
    use crate::utils::config::{CheckpointConfig, GraphConfig, LedgerConfig, LifecycleConfig, NamespaceCeilings};

    struct Fixture {
        fleet: Arc<FleetCoordinator>,
        controller: Arc<LifecycleController>,
        provisioner: Arc<LocalProvisioner>,
        sink: Arc<MemoryEventSink>,
    }

    fn fixture(config: FleetConfig, inference: ScriptedInference) -> Fixture {
        fixture_on(config, inference, 32)
    }

    fn fixture_on(config: FleetConfig, inference: ScriptedInference, environments: usize) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let provisioner = Arc::new(LocalProvisioner::new(environments));
        let sink = Arc::new(MemoryEventSink::new());
        let ledger = Arc::new(ResourceLedger::new(LedgerConfig::default(), clock.clone()));
        let checkpoints = Arc::new(CheckpointAdapter::new(
            Arc::new(MemoryCheckpointStore::new()),
            CheckpointConfig::default(),
            clock.clone(),
        ));
        let engine = GraphEngine::new(GraphConfig::default(), ledger.clone(), Arc::new(inference));
        let recorder = Arc::new(EventRecorder::new(RecorderConfig::default(), sink.clone(), clock.clone()));
        let lifecycle = LifecycleConfig {
            stop_grace_ms: 100,
            drain_poll_interval_ms: 10,
            ..LifecycleConfig::default()
        };

        let controller = LifecycleController::new(
            lifecycle,
            NamespaceCeilings::default(),
            ControllerDeps {
                ledger,
                checkpoints,
                engine,
                provisioner: provisioner.clone(),
                recorder,
                clock: clock.clone(),
            },
        );
        let fleet = FleetCoordinator::new(config, controller.clone(), provisioner.clone(), clock);
        Fixture {
            fleet,
            controller,
            provisioner,
            sink,
        }
    }

    fn fleet_config(target: usize) -> FleetConfig {
        FleetConfig {
            warm_pool_target: target,
            warm_pool_capacity: 8,
            drain_timeout_secs: 30,
            ..FleetConfig::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_warm_on_empty_pool_returns_none() {
        let fx = fixture(fleet_config(0), ScriptedInference::new());
        assert!(fx.fleet.acquire_warm(Duration::ZERO).await.is_none());
        assert_eq!(fx.fleet.pool_stats().misses, 1);
    }

    #[tokio::test]
    async fn test_scale_up_prefers_warm_entries() {
        let fx = fixture(fleet_config(2), ScriptedInference::new());
        fx.fleet.pool().replenish().await;
        assert_eq!(fx.fleet.pool_stats().available, 2);

        let report = fx.fleet.scale_up(3, "load").await.unwrap();
        // replenishment may refill the pool before the last activation
        assert!(report.warm_activations >= 2);
        assert_eq!(report.warm_activations + report.cold_spawns, 3);
        assert_eq!(report.affected.len(), 3);
        assert_eq!(fx.fleet.fleet_size(), 3);

        for id in &report.affected {
            assert_eq!(fx.controller.state(id).unwrap(), InstanceState::Running);
        }
        fx.controller.recorder().flush().await;
        for id in &report.affected {
            assert_eq!(fx.sink.names_for(id).last(), Some(&"fleet_scaled"));
        }
    }

    #[tokio::test]
    async fn test_activation_keeps_reserved_id_and_environment() {
        let fx = fixture(fleet_config(1), ScriptedInference::new());
        fx.fleet.pool().replenish().await;
        let entry = fx.fleet.acquire_warm(Duration::ZERO).await.unwrap();
        let environment = entry.environment.clone();
        let reserved = entry.instance_id.clone();

        let instance = fx
            .fleet
            .activate(entry, SpawnConfig::new(TrustLevel::Standard))
            .await
            .unwrap();
        assert_eq!(instance.id, reserved);
        assert_eq!(instance.environment, Some(environment));
        assert!(fx.provisioner.is_active(instance.environment.as_ref().unwrap()));
    }

    #[tokio::test]
    async fn test_rejected_activation_releases_environment() {
        let fx = fixture(fleet_config(1), ScriptedInference::new());
        fx.fleet.pool().replenish().await;
        let entry = fx.fleet.acquire_warm(Duration::ZERO).await.unwrap();
        let environment = entry.environment.clone();

        let err = fx
            .fleet
            .activate(entry, SpawnConfig::new(TrustLevel::Standard).with_label("color", "red"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SpawnRejected(_)));
        assert!(!fx.provisioner.is_active(&environment));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_prefers_idle_then_low_priority() {
        let inference = ScriptedInference::new().delay_for("work", Duration::from_secs(600));
        let fx = fixture(fleet_config(0), inference);
        let graph = Graph::builder("graph_busy", "work")
            .node("work", NodeDefinition::agent("busy").then("done"))
            .node("done", NodeDefinition::end())
            .build()
            .unwrap();
        let graph_id = fx.controller.register_graph(graph).unwrap();

        let busy = fx
            .controller
            .spawn(SpawnConfig::new(TrustLevel::Standard).with_priority(-10).with_graph(graph_id))
            .await
            .unwrap()
            .id;
        let low = fx
            .controller
            .spawn(SpawnConfig::new(TrustLevel::Standard).with_priority(1))
            .await
            .unwrap()
            .id;
        let high = fx
            .controller
            .spawn(SpawnConfig::new(TrustLevel::Standard).with_priority(9))
            .await
            .unwrap()
            .id;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = fx.fleet.scale_down(2, "cost").await.unwrap();
        assert_eq!(report.affected, vec![low.clone(), high.clone()]);
        assert_eq!(report.forced_drains, 0);
        assert_eq!(fx.controller.state(&busy).unwrap(), InstanceState::Running);
        assert_eq!(fx.fleet.fleet_size(), 1);
    }

    #[tokio::test]
    async fn test_scale_down_beyond_fleet_is_incomplete() {
        let fx = fixture(fleet_config(0), ScriptedInference::new());
        fx.fleet.scale_up(2, "seed").await.unwrap();

        let err = fx.fleet.scale_down(3, "cost").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ScaleIncomplete {
                completed: 2,
                requested: 3,
                ..
            }
        ));
        assert_eq!(fx.fleet.fleet_size(), 0);
    }

    #[tokio::test]
    async fn test_scale_up_reports_partial_failure() {
        let fx = fixture_on(fleet_config(0), ScriptedInference::new(), 2);

        let err = fx.fleet.scale_up(4, "burst").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ScaleIncomplete {
                completed: 2,
                requested: 4,
                ..
            }
        ));
        assert_eq!(fx.fleet.fleet_size(), 2);
        assert_eq!(fx.provisioner.active_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_drains_of_one_instance_conflict() {
        let inference = ScriptedInference::new().delay_for("work", Duration::from_secs(600));
        let fx = fixture(fleet_config(0), inference);
        let graph = Graph::builder("graph_slow", "work")
            .node("work", NodeDefinition::agent("slow").then("done"))
            .node("done", NodeDefinition::end())
            .build()
            .unwrap();
        let graph_id = fx.controller.register_graph(graph).unwrap();
        let id = fx
            .controller
            .spawn(SpawnConfig::new(TrustLevel::Standard).with_graph(graph_id))
            .await
            .unwrap()
            .id;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.controller.is_executing(&id));

        let (first, second) = tokio::join!(
            fx.fleet.graceful_drain(&id, Duration::from_secs(5)),
            fx.fleet.graceful_drain(&id, Duration::from_secs(5)),
        );
        let first = first.unwrap();
        assert!(first.forced);
        assert!(matches!(second, Err(EngineError::ScaleConflict(ref conflicted)) if conflicted == &id));
        assert_eq!(fx.controller.state(&id).unwrap(), InstanceState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replenisher_tops_up_after_acquire() {
        let fx = fixture(
            FleetConfig {
                replenish_interval_ms: 1_000,
                ..fleet_config(2)
            },
            ScriptedInference::new(),
        );
        fx.fleet.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.fleet.pool_stats().available, 2);

        fx.fleet.acquire_warm(Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.fleet.pool_stats().available, 2);

        fx.fleet.shutdown().await;
        assert_eq!(fx.fleet.pool_stats().available, 0);
        // the acquired entry was never activated and stays with its holder
        assert_eq!(fx.provisioner.active_count(), 1);
    }
}
