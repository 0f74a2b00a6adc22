// packages/engine/src/lifecycle/controller.rs
//! Lifecycle controller
//!
//! Owns the authoritative state of every live instance. Each instance has two
//! guards:
//!
//! - a **transition permit** (async semaphore with one permit) that serializes
//!   lifecycle operations on the instance, including their collaborator calls
//! - a **record lock** (`parking_lot::Mutex`) protecting the in-memory record,
//!   only ever held for short synchronous sections and never across an await
//!
//! Graph executions run on their own tasks. When a run ends, its result is
//! recorded under the record lock first ("settled"), and only then does the
//! run task take the transition permit for any follow-up (suspend on budget
//! exhaustion, restart after a failure, ...). Operations that stop a run while
//! holding the permit therefore wait for "settled", never for the follow-up.

use super::instance::{Instance, SpawnConfig, TrustLevel};
use super::scheduler::TaskRegistry;
use super::state::{InstanceState, StateMachine, Transition};
use crate::bridges::provisioning::{EnvironmentHandle, EnvironmentRequest, Provisioner};
use crate::checkpoint::{Checkpoint, CheckpointAdapter, CheckpointKind};
use crate::graph::{
    BudgetDecision, Execution, ExecutionHooks, ExecutionOutcome, ExecutionStatus, Graph,
    GraphEngine, RunControl, RunReport,
};
use crate::ledger::{
    ExhaustionAction, Reservation, ResourceBudget, ResourceLedger, ResourceLimiter, ResourceLimits,
};
use crate::observability::{EventKind, EventRecorder};
use crate::utils::clock::{to_chrono, Clock};
use crate::utils::config::{LifecycleConfig, NamespaceCeilings};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{CheckpointId, ExecutionId, GraphId, InstanceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

/// Result of the most recent execution run of an instance
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    pub graph_id: GraphId,
    pub status: ExecutionStatus,
    /// `None` when the run ended with an error
    pub outcome: Option<ExecutionOutcome>,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    pub steps: u32,
    pub checkpoints: Vec<CheckpointId>,
    pub deferred_warnings: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

/// Outcome of a graceful drain
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub instance_id: InstanceId,
    /// The in-flight execution did not stop within the drain timeout
    pub forced: bool,
    pub checkpoint_id: Option<CheckpointId>,
    pub elapsed: Duration,
}

/// Collaborators the controller drives
#[derive(Debug, Clone)]
pub struct ControllerDeps {
    pub ledger: Arc<ResourceLedger>,
    pub checkpoints: Arc<CheckpointAdapter>,
    pub engine: GraphEngine,
    pub provisioner: Arc<dyn Provisioner>,
    pub recorder: Arc<EventRecorder>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct ActiveRun {
    execution_id: ExecutionId,
    control: RunControl,
    settled: watch::Receiver<bool>,
}

#[derive(Debug)]
struct InstanceRecord {
    instance: Instance,
    machine: StateMachine,
    limits: ResourceLimits,
    /// Last committed state of the current (or last) execution
    execution: Option<Execution>,
    graph: Option<Arc<Graph>>,
    run: Option<ActiveRun>,
    run_finished: Option<watch::Receiver<bool>>,
    last_report: Option<ExecutionReport>,
    /// `total_steps` covered by the newest checkpoint
    checkpointed_steps: u32,
}

#[derive(Debug)]
struct ManagedInstance {
    id: InstanceId,
    permit: Arc<Semaphore>,
    record: Mutex<InstanceRecord>,
}

impl ManagedInstance {
    fn state(&self) -> InstanceState {
        self.record.lock().instance.state
    }

    fn has_active_run(&self) -> bool {
        self.record.lock().run.is_some()
    }
}

#[derive(Debug, Clone)]
struct RetiredInstance {
    instance: Instance,
    history: Vec<Transition>,
}

#[derive(Debug)]
enum FollowUp {
    Suspend { reason: String, checkpoint: bool },
    Terminate { reason: String },
    Fail { reason: String },
    Restart { reason: String },
}

/// Owns instance state machines and drives their collaborators
#[derive(Debug)]
pub struct LifecycleController {
    config: LifecycleConfig,
    fail_on_graph_error: bool,
    limiter: ResourceLimiter,
    ledger: Arc<ResourceLedger>,
    checkpoints: Arc<CheckpointAdapter>,
    engine: GraphEngine,
    provisioner: Arc<dyn Provisioner>,
    recorder: Arc<EventRecorder>,
    clock: Arc<dyn Clock>,
    instances: DashMap<InstanceId, Arc<ManagedInstance>>,
    retired: DashMap<InstanceId, RetiredInstance>,
    graphs: DashMap<GraphId, Arc<Graph>>,
    tasks: TaskRegistry,
    this: Weak<LifecycleController>,
}

impl LifecycleController {
    pub fn new(config: LifecycleConfig, ceilings: NamespaceCeilings, deps: ControllerDeps) -> Arc<Self> {
        let fail_on_graph_error = deps.engine.config().fail_instance_on_graph_error;
        Arc::new_cyclic(|this| Self {
            config,
            fail_on_graph_error,
            limiter: ResourceLimiter::new(ceilings),
            ledger: deps.ledger,
            checkpoints: deps.checkpoints,
            engine: deps.engine,
            provisioner: deps.provisioner,
            recorder: deps.recorder,
            clock: deps.clock,
            instances: DashMap::new(),
            retired: DashMap::new(),
            graphs: DashMap::new(),
            tasks: TaskRegistry::new(),
            this: this.clone(),
        })
    }

    /// Start the idle-suspend sweep
    pub fn start(&self) {
        let weak = self.this.clone();
        let interval = self.config.idle_sweep_interval();
        self.tasks.spawn_global("idle_sweep", move |token| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(controller) = weak.upgrade() else { break };
                        let suspended = controller.sweep_idle().await;
                        if !suspended.is_empty() {
                            info!("Idle sweep suspended {} instances", suspended.len());
                        }
                    }
                }
            }
        });
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn checkpoint_adapter(&self) -> &Arc<CheckpointAdapter> {
        &self.checkpoints
    }

    pub fn recorder(&self) -> &Arc<EventRecorder> {
        &self.recorder
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    // ------------------------------------------------------------------
    // Graphs
    // ------------------------------------------------------------------

    /// Make a graph available to executions
    pub fn register_graph(&self, graph: Graph) -> Result<GraphId> {
        graph.validate()?;
        let id = graph.id.clone();
        debug!("Registered graph {} ({} nodes)", id, graph.nodes.len());
        self.graphs.insert(id.clone(), Arc::new(graph));
        Ok(id)
    }

    pub fn graph(&self, graph_id: &GraphId) -> Result<Arc<Graph>> {
        self.graphs
            .get(graph_id)
            .map(|g| Arc::clone(g.value()))
            .ok_or_else(|| EngineError::InvalidGraph(format!("graph {} is not registered", graph_id)))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, instance_id: &InstanceId) -> Result<Instance> {
        if let Some(managed) = self.live(instance_id) {
            return Ok(self.snapshot(&managed));
        }
        self.retired
            .get(instance_id)
            .map(|r| r.instance.clone())
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))
    }

    /// Live instances, oldest first
    pub fn list(&self) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .live_instances()
            .iter()
            .map(|managed| self.snapshot(managed))
            .collect();
        instances.sort_by_key(|i| i.created_at);
        instances
    }

    pub fn state(&self, instance_id: &InstanceId) -> Result<InstanceState> {
        if let Some(managed) = self.live(instance_id) {
            return Ok(managed.state());
        }
        self.retired
            .get(instance_id)
            .map(|r| r.instance.state)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))
    }

    /// Applied transitions, oldest first
    pub fn history(&self, instance_id: &InstanceId) -> Result<Vec<Transition>> {
        if let Some(managed) = self.live(instance_id) {
            return Ok(managed.record.lock().machine.history().cloned().collect());
        }
        self.retired
            .get(instance_id)
            .map(|r| r.history.clone())
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))
    }

    /// Number of live, non-terminal instances
    pub fn live_count(&self) -> usize {
        self.live_instances()
            .iter()
            .filter(|m| !m.state().is_terminal())
            .count()
    }

    pub fn is_executing(&self, instance_id: &InstanceId) -> bool {
        self.live(instance_id)
            .map(|m| m.has_active_run())
            .unwrap_or(false)
    }

    pub fn execution_state(&self, instance_id: &InstanceId) -> Result<Option<Execution>> {
        let managed = self
            .live(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))?;
        let execution = managed.record.lock().execution.clone();
        Ok(execution)
    }

    pub fn execution_report(&self, instance_id: &InstanceId) -> Result<Option<ExecutionReport>> {
        let managed = self
            .live(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))?;
        let report = managed.record.lock().last_report.clone();
        Ok(report)
    }

    /// Wait until the latest run and its follow-up have finished
    pub async fn wait_for_execution(
        &self,
        instance_id: &InstanceId,
        limit: Duration,
    ) -> Result<Option<ExecutionReport>> {
        let managed = self
            .live(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))?;
        let finished = managed.record.lock().run_finished.clone();

        if let Some(mut finished) = finished {
            timeout(limit, async move {
                let _ = finished.wait_for(|done| *done).await;
            })
            .await
            .map_err(|_| EngineError::Timeout {
                operation: "execution_wait",
                after: limit,
            })?;
        }

        let report = managed.record.lock().last_report.clone();
        Ok(report)
    }

    pub fn checkpoints(&self, instance_id: &InstanceId) -> Vec<Checkpoint> {
        self.checkpoints.list(instance_id)
    }

    // ------------------------------------------------------------------
    // Spawn
    // ------------------------------------------------------------------

    /// Admit, provision and start a new instance
    ///
    /// A pending recovery descriptor for the requested id makes the instance
    /// restore from its checkpoint instead of starting cold. A pre-provisioned
    /// environment in `config` is owned by the controller from this call on,
    /// and is released if the spawn fails.
    pub async fn spawn(&self, config: SpawnConfig) -> Result<Instance> {
        let (managed, permit, start_graph) = match self.admit(&config) {
            Ok(admitted) => admitted,
            Err(e) => {
                if let Some(handle) = &config.environment {
                    self.release_handle(&handle.instance_id, handle).await;
                }
                return Err(e);
            }
        };

        let result = self.spawn_locked(&managed, &config, start_graph).await;
        if let Err(e) = &result {
            if managed.state() == InstanceState::Pending {
                self.abandon_spawn(&managed).await;
            }
            warn!(instance_id = %managed.id, "Spawn failed: {}", e);
        }
        drop(permit);
        result
    }

    /// Admission checks, then register a `pending` placeholder
    fn admit(
        &self,
        config: &SpawnConfig,
    ) -> Result<(Arc<ManagedInstance>, OwnedSemaphorePermit, Option<Arc<Graph>>)> {
        config.validate()?;
        if let Some(namespace) = &config.namespace {
            if namespace != &self.limiter.ceilings().name {
                return Err(EngineError::SpawnRejected(format!(
                    "namespace '{}' is not served here",
                    namespace
                )));
            }
        }
        self.limiter.admit(config.trust_level, &config.limits)?;

        if !self.limiter.has_capacity(self.live_count()) {
            return Err(EngineError::ResourceExhausted(format!(
                "namespace '{}' is at its limit of {} instances",
                self.limiter.ceilings().name,
                self.limiter.ceilings().max_instances
            )));
        }

        let start_graph = config.graph.as_ref().map(|id| self.graph(id)).transpose()?;

        let id = config
            .instance_id
            .clone()
            .or_else(|| config.environment.as_ref().map(|env| env.instance_id.clone()))
            .unwrap_or_else(InstanceId::generate);

        let managed = Arc::new(self.new_managed(id.clone(), config));
        let permit = Arc::clone(&managed.permit)
            .try_acquire_owned()
            .map_err(|_| EngineError::SpawnRejected(format!("instance {} is busy", id)))?;

        match self.instances.entry(id.clone()) {
            Entry::Occupied(_) => Err(EngineError::SpawnRejected(format!(
                "instance {} is already live",
                id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&managed));
                Ok((managed, permit, start_graph))
            }
        }
    }

    fn new_managed(&self, id: InstanceId, config: &SpawnConfig) -> ManagedInstance {
        let now = self.clock.now();
        let window = to_chrono(self.ledger.config().window());
        let instance = Instance {
            id: id.clone(),
            state: InstanceState::Pending,
            trust_level: config.trust_level,
            namespace: self.limiter.ceilings().name.clone(),
            priority: config.priority,
            session_id: config.session_id.clone(),
            budget: ResourceBudget::new(&config.limits, now, window),
            current_graph_execution_id: None,
            environment: config.environment.clone(),
            labels: config.labels.clone(),
            extensions: config.extensions.clone(),
            restart_attempts: 0,
            admitting: true,
            last_activity_at: now,
            created_at: now,
            updated_at: now,
            terminated_at: None,
            termination_reason: None,
            failure_reason: None,
        };

        ManagedInstance {
            id,
            permit: Arc::new(Semaphore::new(1)),
            record: Mutex::new(InstanceRecord {
                instance,
                machine: StateMachine::new(),
                limits: config.limits.clone(),
                execution: None,
                graph: None,
                run: None,
                run_finished: None,
                last_report: None,
                checkpointed_steps: 0,
            }),
        }
    }

    async fn spawn_locked(
        &self,
        managed: &Arc<ManagedInstance>,
        config: &SpawnConfig,
        start_graph: Option<Arc<Graph>>,
    ) -> Result<Instance> {
        let id = &managed.id;

        let mut restored = None;
        if let Some(descriptor) = self.checkpoints.pending_recovery(id).await? {
            match self.checkpoints.load(&descriptor.checkpoint).await {
                Ok(snapshot) => restored = Some((descriptor.checkpoint, snapshot)),
                Err(e @ (EngineError::CheckpointCorrupted(_) | EngineError::CheckpointNotFound(_))) => {
                    let reason = format!(
                        "recovery from checkpoint {} failed: {}",
                        descriptor.checkpoint.id, e
                    );
                    self.fail_locked(managed, &reason).await;
                    return Err(EngineError::RestoreFailed(reason));
                }
                Err(e) => return Err(e),
            }
        }

        let warm = config.environment.is_some();
        let environment = match &config.environment {
            Some(handle) => handle.clone(),
            None => {
                self.provision(id, config.trust_level, &config.limits, &config.labels)
                    .await?
            }
        };

        let restored_from = restored.as_ref().map(|(checkpoint, _)| checkpoint.id.clone());
        let (budget, execution) = match restored {
            Some((_, snapshot)) => (snapshot.budget, snapshot.execution.map(interrupted)),
            None => (None, None),
        };
        let budget = match budget {
            Some(budget) => {
                self.ledger.restore(id, budget.clone());
                budget
            }
            None => self.ledger.open(id, &config.limits),
        };
        let graph = execution
            .as_ref()
            .and_then(|e| self.graphs.get(&e.graph_id).map(|g| Arc::clone(g.value())));

        {
            let mut record = managed.record.lock();
            record.instance.environment = Some(environment);
            record.instance.budget = budget;
            record.instance.current_graph_execution_id = execution
                .as_ref()
                .filter(|e| !e.is_finished())
                .map(|e| e.id.clone());
            record.checkpointed_steps = execution.as_ref().map(|e| e.total_steps).unwrap_or(0);
            record.execution = execution;
            record.graph = graph;
        }

        self.transition_locked(managed, InstanceState::Running, "spawned")?;
        self.retired.remove(id);

        self.recorder.record(
            id,
            EventKind::Spawned {
                trust_level: config.trust_level,
                restored_from: restored_from.clone(),
                warm,
            },
        );
        if let Some(checkpoint_id) = restored_from {
            info!(instance_id = %id, "Recovered from checkpoint {}", checkpoint_id);
            self.recorder
                .record(id, EventKind::CheckpointRestored { checkpoint_id });
        }
        metrics::counter!("agentcore_instances_spawned_total").increment(1);

        self.schedule_instance_tasks(id);

        if !self.continue_execution(managed)? {
            if let Some(graph) = start_graph {
                let execution = Execution::new(graph.id.clone(), id.clone(), graph.entry_node.clone());
                self.launch_run(managed, graph, execution)?;
            }
        }

        info!(instance_id = %id, trust = %config.trust_level, warm, "Instance spawned");
        Ok(self.snapshot(managed))
    }

    /// Undo a spawn that never reached `running`
    async fn abandon_spawn(&self, managed: &Arc<ManagedInstance>) {
        self.release_environment(managed).await;
        self.ledger.close(&managed.id);
        self.tasks.cancel_instance(&managed.id);
        self.instances
            .remove_if(&managed.id, |_, current| Arc::ptr_eq(current, managed));
        managed.permit.close();
    }

    /// Request an environment, retrying transient failures with backoff
    async fn provision(
        &self,
        instance_id: &InstanceId,
        trust_level: TrustLevel,
        limits: &ResourceLimits,
        labels: &BTreeMap<String, String>,
    ) -> Result<EnvironmentHandle> {
        let request = EnvironmentRequest {
            instance_id: instance_id.clone(),
            limits: limits.clone(),
            labels: labels.clone(),
        };
        let policy = &self.config.spawn_retry;
        let deadline = self.config.spawn_timeout();
        let attempts = policy.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            let result = match timeout(
                deadline,
                self.provisioner.request_environment(trust_level, &request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(EngineError::SpawnTimeout(deadline)),
            };

            let err = match result {
                Ok(handle) => {
                    debug!(
                        instance_id = %instance_id,
                        tier = %handle.tier,
                        "Environment {} confirmed",
                        handle.id
                    );
                    return Ok(handle);
                }
                Err(EngineError::Unavailable(reason)) => {
                    return Err(EngineError::ResourceExhausted(reason))
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= attempts {
                error!(
                    instance_id = %instance_id,
                    "Provisioning failed after {} attempts: {}",
                    attempt, err
                );
                return Err(err);
            }

            let delay = policy.delay_for(attempt - 1);
            warn!(
                instance_id = %instance_id,
                attempt,
                "Provisioning failed ({}), retrying in {:?}",
                err,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    // ------------------------------------------------------------------
    // Terminate, drain, fail
    // ------------------------------------------------------------------

    /// Terminate an instance
    ///
    /// `force = false` drains first (see [`LifecycleController::drain`]).
    /// Terminating an instance that is already terminal returns its state.
    pub async fn terminate(
        &self,
        instance_id: &InstanceId,
        reason: impl Into<String>,
        force: bool,
    ) -> Result<InstanceState> {
        let reason = reason.into();
        if let Some(state) = self.retired_state(instance_id) {
            return Ok(state);
        }

        if !force {
            let timeout = self.config.default_drain_timeout();
            return match self.drain_with_reason(instance_id, timeout, &reason).await {
                Ok(_) => Ok(InstanceState::Terminated),
                Err(e) => self.retired_state(instance_id).ok_or(e),
            };
        }

        let (managed, _permit) = match self.lock(instance_id, Some(InstanceState::Terminated)).await {
            Ok(locked) => locked,
            Err(e) => return self.retired_state(instance_id).ok_or(e),
        };
        let state = managed.state();
        if state.is_terminal() {
            return Ok(state);
        }
        self.terminate_locked(&managed, &reason, true, true).await
    }

    /// Gracefully drain an instance and terminate it
    ///
    /// The instance stops admitting work and its execution is asked to stop
    /// at the next node boundary. If it is still running after `limit` the
    /// in-flight step is cancelled and the drain reports `forced`. A pre-drain
    /// checkpoint is always taken; if it fails the drain is aborted.
    pub async fn drain(&self, instance_id: &InstanceId, limit: Duration) -> Result<DrainReport> {
        self.drain_with_reason(instance_id, limit, "drained").await
    }

    async fn drain_with_reason(
        &self,
        instance_id: &InstanceId,
        limit: Duration,
        reason: &str,
    ) -> Result<DrainReport> {
        let started = Instant::now();
        let (managed, _permit) = self.lock(instance_id, Some(InstanceState::Terminated)).await?;
        let state = managed.state();
        if state.is_terminal() {
            return Err(EngineError::InvalidTransition {
                instance_id: instance_id.clone(),
                from: state,
                to: InstanceState::Terminated,
            });
        }

        {
            let mut record = managed.record.lock();
            record.instance.admitting = false;
            if let Some(run) = &record.run {
                run.control.request_stop();
            }
        }
        info!(instance_id = %instance_id, "Draining (timeout {:?})", limit);

        let poll = self.config.drain_poll_interval();
        let mut forced = false;
        while managed.has_active_run() {
            let elapsed = started.elapsed();
            if elapsed >= limit {
                forced = true;
                break;
            }
            tokio::time::sleep(poll.min(limit - elapsed)).await;
        }

        if forced {
            warn!(instance_id = %instance_id, "Drain timed out after {:?}, cancelling in-flight work", limit);
            if let Some(settled) = self.abort_run(&managed) {
                wait_settled(settled, self.config.stop_grace()).await;
            }
        }

        let checkpoint = match self
            .save_checkpoint(&managed, None, CheckpointKind::PreDrain, "pre-drain")
            .await
        {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                managed.record.lock().instance.admitting = true;
                error!(instance_id = %instance_id, "Pre-drain checkpoint failed, drain aborted: {}", e);
                return Err(e);
            }
        };

        if managed.state() == InstanceState::Running {
            self.transition_locked(&managed, InstanceState::Suspended, "draining")?;
            self.recorder.record(
                instance_id,
                EventKind::Suspended {
                    reason: "draining".to_string(),
                    checkpoint_id: Some(checkpoint.id.clone()),
                },
            );
        }
        self.terminate_locked(&managed, reason, forced, false).await?;

        let report = DrainReport {
            instance_id: instance_id.clone(),
            forced,
            checkpoint_id: Some(checkpoint.id),
            elapsed: started.elapsed(),
        };
        info!(
            instance_id = %instance_id,
            forced = report.forced,
            "Drain finished in {:?}",
            report.elapsed
        );
        Ok(report)
    }

    async fn terminate_locked(
        &self,
        managed: &Arc<ManagedInstance>,
        reason: &str,
        forced: bool,
        drain_skipped: bool,
    ) -> Result<InstanceState> {
        self.abort_run(managed);
        self.tasks.cancel_instance(&managed.id);
        self.transition_locked(managed, InstanceState::Terminated, reason)?;
        managed.record.lock().instance.termination_reason = Some(reason.to_string());

        self.release_environment(managed).await;
        if let Some(budget) = self.ledger.close(&managed.id) {
            managed.record.lock().instance.budget = budget;
        }
        if let Err(e) = self.checkpoints.clear_recovery(&managed.id).await {
            warn!(instance_id = %managed.id, "Could not clear recovery marker: {}", e);
        }

        self.recorder.record(
            &managed.id,
            EventKind::Terminated {
                reason: reason.to_string(),
                forced,
                drain_skipped,
            },
        );
        metrics::counter!("agentcore_instances_terminated_total").increment(1);
        self.retire(managed);
        Ok(InstanceState::Terminated)
    }

    /// Move an instance to `failed` and release everything it holds
    ///
    /// The recovery marker is kept so a later spawn with the same id can try
    /// again from the last checkpoint.
    async fn fail_locked(&self, managed: &Arc<ManagedInstance>, reason: &str) {
        self.abort_run(managed);
        self.tasks.cancel_instance(&managed.id);
        if let Err(e) = self.transition_locked(managed, InstanceState::Failed, reason) {
            warn!(instance_id = %managed.id, "Cannot mark instance failed: {}", e);
            return;
        }
        managed.record.lock().instance.failure_reason = Some(reason.to_string());

        self.release_environment(managed).await;
        if let Some(budget) = self.ledger.close(&managed.id) {
            managed.record.lock().instance.budget = budget;
        }

        self.recorder.record(
            &managed.id,
            EventKind::Failed {
                reason: reason.to_string(),
            },
        );
        metrics::counter!("agentcore_instances_failed_total").increment(1);
        error!(instance_id = %managed.id, "Instance failed: {}", reason);
        self.retire(managed);
    }

    fn retire(&self, managed: &Arc<ManagedInstance>) {
        let retired = {
            let record = managed.record.lock();
            RetiredInstance {
                instance: record.instance.clone(),
                history: record.machine.history().cloned().collect(),
            }
        };
        self.retired.insert(managed.id.clone(), retired);
        self.instances
            .remove_if(&managed.id, |_, current| Arc::ptr_eq(current, managed));
        managed.permit.close();
        debug!(instance_id = %managed.id, "Instance retired");
    }

    async fn release_environment(&self, managed: &ManagedInstance) {
        let handle = managed.record.lock().instance.environment.take();
        if let Some(handle) = handle {
            self.release_handle(&managed.id, &handle).await;
        }
    }

    async fn release_handle(&self, instance_id: &InstanceId, handle: &EnvironmentHandle) {
        let deadline = self.config.release_timeout();
        match timeout(deadline, self.provisioner.release_environment(handle)).await {
            Ok(Ok(())) => debug!(instance_id = %instance_id, "Released environment {}", handle.id),
            Ok(Err(e)) => warn!(instance_id = %instance_id, "Releasing environment {} failed: {}", handle.id, e),
            Err(_) => warn!(
                instance_id = %instance_id,
                "Releasing environment {} timed out after {:?}",
                handle.id,
                deadline
            ),
        }
    }

    // ------------------------------------------------------------------
    // Suspend and resume
    // ------------------------------------------------------------------

    /// Suspend a running instance
    pub async fn suspend(&self, instance_id: &InstanceId, with_checkpoint: bool) -> Result<Instance> {
        let (managed, _permit) = self.lock(instance_id, Some(InstanceState::Suspended)).await?;
        self.suspend_locked(&managed, with_checkpoint, "suspend requested")
            .await?;
        Ok(self.snapshot(&managed))
    }

    async fn suspend_locked(
        &self,
        managed: &Arc<ManagedInstance>,
        with_checkpoint: bool,
        reason: &str,
    ) -> Result<Option<CheckpointId>> {
        let state = managed.state();
        if state != InstanceState::Running {
            return Err(EngineError::InvalidTransition {
                instance_id: managed.id.clone(),
                from: state,
                to: InstanceState::Suspended,
            });
        }

        let stopped = self.stop_run(managed).await;

        let checkpoint_id = if with_checkpoint {
            match self
                .save_checkpoint(managed, None, CheckpointKind::PreSuspend, reason)
                .await
            {
                Ok(checkpoint) => Some(checkpoint.id),
                Err(e) => {
                    if stopped {
                        self.continue_execution(managed)?;
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.transition_locked(managed, InstanceState::Suspended, reason)?;
        self.recorder.record(
            &managed.id,
            EventKind::Suspended {
                reason: reason.to_string(),
                checkpoint_id: checkpoint_id.clone(),
            },
        );
        Ok(checkpoint_id)
    }

    /// Resume a suspended instance from a checkpoint
    ///
    /// Without an explicit id the newest checkpoint is used. A payload that
    /// cannot be decoded fails the instance.
    pub async fn resume(
        &self,
        instance_id: &InstanceId,
        checkpoint_id: Option<&CheckpointId>,
    ) -> Result<Instance> {
        let (managed, _permit) = self.lock(instance_id, Some(InstanceState::Running)).await?;
        let state = managed.state();
        if state != InstanceState::Suspended {
            return Err(EngineError::InvalidTransition {
                instance_id: instance_id.clone(),
                from: state,
                to: InstanceState::Running,
            });
        }

        let checkpoint = match checkpoint_id {
            Some(checkpoint_id) => self.checkpoints.find(instance_id, checkpoint_id)?,
            None => self.checkpoints.latest(instance_id).ok_or_else(|| {
                EngineError::CheckpointNotFound(format!("no checkpoint recorded for {}", instance_id))
            })?,
        };

        let snapshot = match self.checkpoints.load(&checkpoint).await {
            Ok(snapshot) => snapshot,
            Err(EngineError::CheckpointCorrupted(detail)) => {
                let reason = format!("checkpoint {} could not be restored: {}", checkpoint.id, detail);
                self.fail_locked(&managed, &reason).await;
                return Err(EngineError::RestoreFailed(reason));
            }
            Err(e) => return Err(e),
        };

        let execution = snapshot.execution.map(interrupted);
        let graph = execution
            .as_ref()
            .and_then(|e| self.graphs.get(&e.graph_id).map(|g| Arc::clone(g.value())));
        {
            let now = self.clock.now();
            let mut record = managed.record.lock();
            record.instance.current_graph_execution_id = execution
                .as_ref()
                .filter(|e| !e.is_finished())
                .map(|e| e.id.clone());
            record.checkpointed_steps = execution.as_ref().map(|e| e.total_steps).unwrap_or(0);
            if graph.is_some() {
                record.graph = graph;
            }
            record.execution = execution;
            record.instance.admitting = true;
            record.instance.last_activity_at = now;
        }

        self.transition_locked(&managed, InstanceState::Running, "resumed")?;
        self.recorder.record(
            instance_id,
            EventKind::CheckpointRestored {
                checkpoint_id: checkpoint.id.clone(),
            },
        );
        self.recorder.record(
            instance_id,
            EventKind::Resumed {
                checkpoint_id: Some(checkpoint.id.clone()),
            },
        );

        self.continue_execution(&managed)?;
        Ok(self.snapshot(&managed))
    }

    /// Take a manual checkpoint of the last committed state
    pub async fn checkpoint(&self, instance_id: &InstanceId, label: impl Into<String>) -> Result<Checkpoint> {
        let (managed, _permit) = self.lock(instance_id, None).await?;
        let state = managed.state();
        if state.is_terminal() {
            return Err(EngineError::CheckpointFailed(format!(
                "instance {} is {}",
                instance_id, state
            )));
        }
        self.save_checkpoint(&managed, None, CheckpointKind::Manual, &label.into())
            .await
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Start a fresh execution of a registered graph
    pub async fn start_execution(&self, instance_id: &InstanceId, graph_id: &GraphId) -> Result<ExecutionId> {
        let graph = self.graph(graph_id)?;
        let (managed, _permit) = self.lock(instance_id, None).await?;

        {
            let record = managed.record.lock();
            if record.instance.state != InstanceState::Running {
                return Err(EngineError::InvalidTransition {
                    instance_id: instance_id.clone(),
                    from: record.instance.state,
                    to: InstanceState::Running,
                });
            }
            if !record.instance.admitting {
                return Err(EngineError::Unavailable(format!(
                    "instance {} is not admitting work",
                    instance_id
                )));
            }
            if record.run.is_some() {
                return Err(EngineError::Unavailable(format!(
                    "instance {} already has an active execution",
                    instance_id
                )));
            }
        }

        let execution = Execution::new(graph.id.clone(), instance_id.clone(), graph.entry_node.clone());
        self.launch_run(&managed, graph, execution)
    }

    /// Relaunch the recorded execution if it is unfinished and not running
    fn continue_execution(&self, managed: &Arc<ManagedInstance>) -> Result<bool> {
        let resumable = {
            let record = managed.record.lock();
            match (&record.run, &record.graph, &record.execution) {
                (None, Some(graph), Some(execution)) if !execution.is_finished() => {
                    Some((Arc::clone(graph), execution.clone()))
                }
                _ => None,
            }
        };

        match resumable {
            Some((graph, execution)) => {
                self.launch_run(managed, graph, execution)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn launch_run(
        &self,
        managed: &Arc<ManagedInstance>,
        graph: Arc<Graph>,
        execution: Execution,
    ) -> Result<ExecutionId> {
        let controller = self
            .this
            .upgrade()
            .ok_or_else(|| EngineError::Unavailable("lifecycle controller is shutting down".into()))?;

        let control = RunControl::new();
        let (settled_tx, settled_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        let execution_id = execution.id.clone();

        {
            let mut record = managed.record.lock();
            record.instance.current_graph_execution_id = Some(execution_id.clone());
            record.instance.last_activity_at = self.clock.now();
            record.checkpointed_steps = execution.total_steps;
            record.execution = Some(execution.clone());
            record.graph = Some(Arc::clone(&graph));
            record.run = Some(ActiveRun {
                execution_id: execution_id.clone(),
                control: control.clone(),
                settled: settled_rx,
            });
            record.run_finished = Some(finished_rx);
        }

        debug!(
            instance_id = %managed.id,
            execution_id = %execution_id,
            "Launching graph {} at node '{}'",
            graph.id,
            execution.current_node
        );

        let instance_id = managed.id.clone();
        let run_id = execution_id.clone();
        tokio::spawn(async move {
            let hooks: Arc<dyn ExecutionHooks> = controller.clone();
            let result = controller.engine.run(graph, execution, hooks, control).await;
            let follow_up = controller.settle_run(&instance_id, &run_id, result);
            let _ = settled_tx.send(true);
            if let Some(follow_up) = follow_up {
                controller.apply_follow_up(&instance_id, &run_id, follow_up).await;
            }
            let _ = finished_tx.send(true);
        });

        Ok(execution_id)
    }

    /// Record a finished run and decide what the instance should do next
    fn settle_run(
        &self,
        instance_id: &InstanceId,
        execution_id: &ExecutionId,
        result: Result<RunReport>,
    ) -> Option<FollowUp> {
        let managed = self.live(instance_id)?;
        let now = self.clock.now();
        let mut record = managed.record.lock();

        let current = record
            .run
            .as_ref()
            .map(|run| &run.execution_id == execution_id)
            .unwrap_or(false);
        if !current {
            debug!(instance_id = %instance_id, "Ignoring result of superseded run {}", execution_id);
            return None;
        }
        record.run = None;
        record.instance.updated_at = now;

        let (report, follow_up) = match result {
            Ok(run) => {
                let report = ExecutionReport {
                    execution_id: run.execution.id.clone(),
                    graph_id: run.execution.graph_id.clone(),
                    status: run.execution.status,
                    outcome: Some(run.outcome.clone()),
                    error: None,
                    error_kind: None,
                    steps: run.execution.total_steps,
                    checkpoints: run.checkpoints,
                    deferred_warnings: run.deferred_warnings,
                    finished_at: now,
                };
                for warning in &report.deferred_warnings {
                    warn!(instance_id = %instance_id, "{}", warning);
                }
                if matches!(run.outcome, ExecutionOutcome::Completed { .. }) {
                    record.instance.restart_attempts = 0;
                    record.instance.current_graph_execution_id = None;
                }
                record.execution = Some(run.execution);
                (report, None)
            }
            Err(e) => {
                let execution = record.execution.as_ref().filter(|x| &x.id == execution_id);
                let status = execution.map(|x| x.status).unwrap_or(ExecutionStatus::Failed);
                let report = ExecutionReport {
                    execution_id: execution_id.clone(),
                    graph_id: execution
                        .map(|x| x.graph_id.clone())
                        .or_else(|| record.graph.as_ref().map(|g| g.id.clone()))
                        .unwrap_or_else(|| GraphId::new("unknown")),
                    status,
                    outcome: None,
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind()),
                    steps: execution.map(|x| x.total_steps).unwrap_or(0),
                    checkpoints: Vec::new(),
                    deferred_warnings: Vec::new(),
                    finished_at: now,
                };
                if status == ExecutionStatus::Failed {
                    record.instance.current_graph_execution_id = None;
                }

                let follow_up = match e {
                    EngineError::Cancelled => None,
                    EngineError::BudgetExhausted { action, .. } => match action {
                        ExhaustionAction::Suspend => Some(FollowUp::Suspend {
                            reason: "token budget exhausted".to_string(),
                            checkpoint: true,
                        }),
                        ExhaustionAction::Terminate => Some(FollowUp::Terminate {
                            reason: "token budget exhausted".to_string(),
                        }),
                        ExhaustionAction::Warn | ExhaustionAction::Throttle => None,
                    },
                    e if e.is_graph_fatal() => {
                        let reason = format!("graph execution failed: {}", e);
                        if self.fail_on_graph_error {
                            Some(FollowUp::Fail { reason })
                        } else {
                            Some(FollowUp::Suspend {
                                reason,
                                checkpoint: false,
                            })
                        }
                    }
                    e => Some(FollowUp::Restart {
                        reason: format!("execution failed: {}", e),
                    }),
                };
                warn!(
                    instance_id = %instance_id,
                    execution_id = %execution_id,
                    "Execution ended with {}",
                    report.error.as_deref().unwrap_or_default()
                );
                (report, follow_up)
            }
        };

        record.last_report = Some(report);
        follow_up
    }

    async fn apply_follow_up(&self, instance_id: &InstanceId, execution_id: &ExecutionId, follow_up: FollowUp) {
        let Ok((managed, _permit)) = self.lock(instance_id, None).await else {
            return;
        };

        let still_relevant = {
            let record = managed.record.lock();
            record.instance.state == InstanceState::Running
                && record.run.is_none()
                && record
                    .last_report
                    .as_ref()
                    .map(|r| &r.execution_id == execution_id)
                    .unwrap_or(false)
        };
        if !still_relevant {
            debug!(instance_id = %instance_id, "Skipping stale follow-up {:?}", follow_up);
            return;
        }

        let result = match follow_up {
            FollowUp::Suspend { reason, checkpoint } => self
                .suspend_locked(&managed, checkpoint, &reason)
                .await
                .map(|_| ()),
            FollowUp::Terminate { reason } => self
                .terminate_locked(&managed, &reason, true, true)
                .await
                .map(|_| ()),
            FollowUp::Fail { reason } => {
                self.fail_locked(&managed, &reason).await;
                Ok(())
            }
            FollowUp::Restart { reason } => self.restart_locked(&managed, &reason).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(instance_id = %instance_id, "Follow-up after execution failed: {}", e);
        }
    }

    /// Ask the active run to stop at the next boundary and wait for it
    ///
    /// Returns whether a run was stopped. A run that ignores the stop request
    /// past the grace period is aborted.
    async fn stop_run(&self, managed: &ManagedInstance) -> bool {
        let settled = {
            let record = managed.record.lock();
            record.run.as_ref().map(|run| {
                run.control.request_stop();
                run.settled.clone()
            })
        };
        let Some(settled) = settled else {
            return false;
        };

        let grace = self.config.stop_grace();
        if !wait_settled(settled, grace).await {
            warn!(instance_id = %managed.id, "Execution did not stop within {:?}, aborting", grace);
            if let Some(settled) = self.abort_run(managed) {
                wait_settled(settled, grace).await;
            }
        }
        true
    }

    /// Cancel the in-flight step of the active run, if any
    fn abort_run(&self, managed: &ManagedInstance) -> Option<watch::Receiver<bool>> {
        let record = managed.record.lock();
        record.run.as_ref().map(|run| {
            run.control.abort();
            run.settled.clone()
        })
    }

    // ------------------------------------------------------------------
    // Failures and restarts
    // ------------------------------------------------------------------

    /// Signal an unexpected failure of an instance
    ///
    /// A running instance goes through the restart policy; any other live
    /// instance is failed.
    pub async fn report_failure(&self, instance_id: &InstanceId, reason: impl Into<String>) -> Result<InstanceState> {
        let reason = reason.into();
        let (managed, _permit) = self.lock(instance_id, Some(InstanceState::Failed)).await?;
        match managed.state() {
            InstanceState::Running => self.restart_locked(&managed, &reason).await,
            state if state.is_terminal() => Err(EngineError::InvalidTransition {
                instance_id: instance_id.clone(),
                from: state,
                to: InstanceState::Failed,
            }),
            _ => {
                self.fail_locked(&managed, &reason).await;
                Ok(InstanceState::Failed)
            }
        }
    }

    async fn restart_locked(&self, managed: &Arc<ManagedInstance>, reason: &str) -> Result<InstanceState> {
        let policy = &self.config.restart;
        let (attempt, trust_level, limits, labels, current_execution) = {
            let mut record = managed.record.lock();
            record.instance.restart_attempts += 1;
            (
                record.instance.restart_attempts,
                record.instance.trust_level,
                record.limits.clone(),
                record.instance.labels.clone(),
                record.execution.as_ref().map(|e| e.id.clone()),
            )
        };

        if attempt > policy.max_attempts {
            let reason = format!("{} (gave up after {} restarts)", reason, policy.max_attempts);
            self.fail_locked(managed, &reason).await;
            return Ok(InstanceState::Failed);
        }

        warn!(instance_id = %managed.id, attempt, "Restarting after failure: {}", reason);
        if let Some(settled) = self.abort_run(managed) {
            wait_settled(settled, self.config.stop_grace()).await;
        }
        self.release_environment(managed).await;
        tokio::time::sleep(policy.delay_for(attempt - 1)).await;

        let environment = match self.provision(&managed.id, trust_level, &limits, &labels).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_locked(managed, &format!("re-provisioning failed: {}", e))
                    .await;
                return Ok(InstanceState::Failed);
            }
        };

        // Prefer the newest durable state of the same execution
        let mut recovered = None;
        if let Some(checkpoint) = self.checkpoints.latest(&managed.id) {
            if checkpoint.execution_id.is_some() && checkpoint.execution_id == current_execution {
                match self.checkpoints.load(&checkpoint).await {
                    Ok(snapshot) => recovered = snapshot.execution.map(interrupted),
                    Err(e) => warn!(
                        instance_id = %managed.id,
                        "Checkpoint {} unusable for restart, using committed state: {}",
                        checkpoint.id,
                        e
                    ),
                }
            }
        }

        {
            let now = self.clock.now();
            let mut record = managed.record.lock();
            record.instance.environment = Some(environment);
            record.instance.last_activity_at = now;
            if let Some(execution) = recovered {
                record.checkpointed_steps = execution.total_steps;
                record.execution = Some(execution);
            }
            // the failed step is retried from its last committed boundary
            let resumable = match record.execution.as_mut() {
                Some(execution) if execution.status != ExecutionStatus::Completed => {
                    execution.status = ExecutionStatus::Interrupted;
                    Some(execution.id.clone())
                }
                _ => None,
            };
            record.instance.current_graph_execution_id = resumable;
        }

        self.recorder.record(&managed.id, EventKind::Restarted { attempt });
        metrics::counter!("agentcore_instance_restarts_total").increment(1);
        self.continue_execution(managed)?;
        Ok(InstanceState::Running)
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// Probe the environment of a running instance
    ///
    /// An unhealthy environment feeds the restart policy.
    pub async fn heartbeat(&self, instance_id: &InstanceId) -> Result<bool> {
        let managed = self
            .live(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.clone()))?;
        let (state, environment) = {
            let record = managed.record.lock();
            (record.instance.state, record.instance.environment.clone())
        };
        let (InstanceState::Running, Some(environment)) = (state, environment) else {
            return Ok(true);
        };

        let deadline = self.config.spawn_timeout();
        let healthy = match timeout(deadline, self.provisioner.probe(&environment)).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                warn!(instance_id = %instance_id, "Heartbeat probe failed: {}", e);
                false
            }
            Err(_) => false,
        };
        trace!(instance_id = %instance_id, healthy, "Heartbeat");

        if !healthy {
            self.report_failure(instance_id, "environment heartbeat failed")
                .await?;
        }
        Ok(healthy)
    }

    /// Checkpoint a running instance if its execution advanced since the last one
    pub async fn auto_checkpoint(&self, instance_id: &InstanceId) -> Result<Option<Checkpoint>> {
        let (managed, _permit) = self.lock(instance_id, None).await?;
        let due = {
            let record = managed.record.lock();
            record.instance.state == InstanceState::Running
                && record
                    .execution
                    .as_ref()
                    .map(|e| e.total_steps > record.checkpointed_steps)
                    .unwrap_or(false)
        };
        if !due {
            return Ok(None);
        }
        self.save_checkpoint(&managed, None, CheckpointKind::Auto, "periodic")
            .await
            .map(Some)
    }

    /// Suspend running instances without step activity past the idle threshold
    pub async fn sweep_idle(&self) -> Vec<InstanceId> {
        let threshold = to_chrono(self.config.idle_threshold());
        let mut suspended = Vec::new();

        for managed in self.live_instances() {
            if !self.is_idle(&managed, threshold) {
                continue;
            }
            let Ok(permit) = Arc::clone(&managed.permit).acquire_owned().await else {
                continue;
            };
            if self.is_idle(&managed, threshold) {
                match self.suspend_locked(&managed, true, "idle").await {
                    Ok(_) => suspended.push(managed.id.clone()),
                    Err(e) => warn!(instance_id = %managed.id, "Idle suspend failed: {}", e),
                }
            }
            drop(permit);
        }
        suspended
    }

    fn is_idle(&self, managed: &ManagedInstance, threshold: chrono::Duration) -> bool {
        let now = self.clock.now();
        let record = managed.record.lock();
        record.instance.state == InstanceState::Running
            && record.run.is_none()
            && record.instance.idle_for(now) > threshold
    }

    fn schedule_instance_tasks(&self, instance_id: &InstanceId) {
        let heartbeat = self.config.heartbeat_interval();
        let weak = self.this.clone();
        let id = instance_id.clone();
        self.tasks.spawn_for(instance_id, "heartbeat", move |token| async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(controller) = weak.upgrade() else { break };
                        if let Err(e) = controller.heartbeat(&id).await {
                            debug!(instance_id = %id, "Heartbeat skipped: {}", e);
                        }
                    }
                }
            }
        });

        if let Some(interval) = self.config.auto_checkpoint_interval() {
            let weak = self.this.clone();
            let id = instance_id.clone();
            self.tasks.spawn_for(instance_id, "auto_checkpoint", move |token| async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(controller) = weak.upgrade() else { break };
                            // failures are retried on the next tick
                            if let Err(e) = controller.auto_checkpoint(&id).await {
                                warn!(instance_id = %id, "Periodic checkpoint failed: {}", e);
                            }
                        }
                    }
                }
            });
        }
    }

    /// Cancel every scheduled task and abort in-flight executions
    pub async fn shutdown(&self) {
        info!("Shutting down lifecycle controller");
        for managed in self.live_instances() {
            self.abort_run(&managed);
        }
        self.tasks.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn live(&self, instance_id: &InstanceId) -> Option<Arc<ManagedInstance>> {
        self.instances.get(instance_id).map(|m| Arc::clone(m.value()))
    }

    fn live_instances(&self) -> Vec<Arc<ManagedInstance>> {
        self.instances.iter().map(|m| Arc::clone(m.value())).collect()
    }

    fn retired_state(&self, instance_id: &InstanceId) -> Option<InstanceState> {
        self.retired.get(instance_id).map(|r| r.instance.state)
    }

    /// Error for an operation on an instance that is no longer live
    fn gone(&self, instance_id: &InstanceId, to: Option<InstanceState>) -> EngineError {
        match (self.retired_state(instance_id), to) {
            (Some(from), Some(to)) => EngineError::InvalidTransition {
                instance_id: instance_id.clone(),
                from,
                to,
            },
            _ => EngineError::InstanceNotFound(instance_id.clone()),
        }
    }

    /// Take the transition permit of a live instance
    async fn lock(
        &self,
        instance_id: &InstanceId,
        to: Option<InstanceState>,
    ) -> Result<(Arc<ManagedInstance>, OwnedSemaphorePermit)> {
        let managed = self.live(instance_id).ok_or_else(|| self.gone(instance_id, to))?;
        let permit = Arc::clone(&managed.permit)
            .acquire_owned()
            .await
            .map_err(|_| self.gone(instance_id, to))?;
        Ok((managed, permit))
    }

    fn transition_locked(
        &self,
        managed: &ManagedInstance,
        to: InstanceState,
        reason: &str,
    ) -> Result<Transition> {
        let now = self.clock.now();
        let mut record = managed.record.lock();
        let transition = record.machine.transition(&managed.id, to, reason, now)?;

        record.instance.state = to;
        record.instance.updated_at = now;
        if to.is_terminal() {
            record.instance.current_graph_execution_id = None;
            record.instance.admitting = false;
        }
        if to == InstanceState::Terminated {
            record.instance.terminated_at = Some(now);
        }

        info!(
            instance_id = %managed.id,
            from = %transition.from,
            to = %transition.to,
            "State transition: {}",
            reason
        );
        Ok(transition)
    }

    /// Persist a checkpoint; `execution` defaults to the last committed state
    async fn save_checkpoint(
        &self,
        managed: &ManagedInstance,
        execution: Option<&Execution>,
        kind: CheckpointKind,
        label: &str,
    ) -> Result<Checkpoint> {
        let execution = match execution {
            Some(execution) => Some(execution.clone()),
            None => managed.record.lock().execution.clone(),
        };
        let budget = self.ledger.snapshot(&managed.id).ok();

        let checkpoint = self
            .checkpoints
            .save(&managed.id, execution.as_ref(), budget.as_ref(), kind, label)
            .await?;

        if let Some(execution) = &execution {
            let mut record = managed.record.lock();
            if execution.total_steps > record.checkpointed_steps {
                record.checkpointed_steps = execution.total_steps;
            }
        }
        self.recorder.record(
            &managed.id,
            EventKind::CheckpointCreated {
                checkpoint_id: checkpoint.id.clone(),
                kind,
                size_bytes: checkpoint.size_bytes,
            },
        );
        Ok(checkpoint)
    }

    fn snapshot(&self, managed: &ManagedInstance) -> Instance {
        let mut instance = managed.record.lock().instance.clone();
        if let Ok(budget) = self.ledger.snapshot(&managed.id) {
            instance.budget = budget;
        }
        instance
    }
}

#[async_trait]
impl ExecutionHooks for LifecycleController {
    async fn step_started(&self, execution: &Execution, node_id: &str) {
        if let Some(managed) = self.live(&execution.instance_id) {
            managed.record.lock().instance.last_activity_at = self.clock.now();
        }
        trace!(instance_id = %execution.instance_id, "Step '{}' started", node_id);
    }

    async fn state_committed(&self, execution: &Execution) {
        let Some(managed) = self.live(&execution.instance_id) else {
            return;
        };
        let now = self.clock.now();
        let mut record = managed.record.lock();
        let current = record
            .run
            .as_ref()
            .map(|run| run.execution_id == execution.id)
            .unwrap_or(false);
        if current {
            record.execution = Some(execution.clone());
            record.instance.updated_at = now;
        }
    }

    async fn tokens_reserved(&self, execution: &Execution, reservation: &Reservation) {
        let id = &execution.instance_id;
        if let Some(managed) = self.live(id) {
            managed.record.lock().instance.last_activity_at = self.clock.now();
        }
        if reservation.crossed_warning {
            self.recorder.record(
                id,
                EventKind::ResourceWarning {
                    consumed: reservation.consumed,
                    allocated: reservation.allocated,
                },
            );
        }
        if reservation.exceeded {
            self.recorder.record(
                id,
                EventKind::ResourceExceeded {
                    consumed: reservation.consumed,
                    allocated: reservation.allocated,
                    action: self.config.exhaustion_action,
                },
            );
        }
    }

    async fn budget_exhausted(&self, execution: &Execution, node_id: &str) -> BudgetDecision {
        let action = self.config.exhaustion_action;
        match action {
            ExhaustionAction::Warn => {
                warn!(
                    instance_id = %execution.instance_id,
                    "Token budget exhausted, continuing with node '{}'",
                    node_id
                );
                BudgetDecision::Continue
            }
            ExhaustionAction::Throttle => BudgetDecision::Throttle(self.config.throttle_delay()),
            ExhaustionAction::Suspend | ExhaustionAction::Terminate => {
                info!(
                    instance_id = %execution.instance_id,
                    action = %action,
                    "Token budget exhausted before node '{}'",
                    node_id
                );
                BudgetDecision::Halt(action)
            }
        }
    }

    async fn checkpoint(&self, execution: &Execution) -> Result<CheckpointId> {
        let managed = self
            .live(&execution.instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound(execution.instance_id.clone()))?;
        self.save_checkpoint(&managed, Some(execution), CheckpointKind::Auto, "node-completion")
            .await
            .map(|checkpoint| checkpoint.id)
    }
}

/// Executions restored from a checkpoint are resumable, never mid-step
fn interrupted(mut execution: Execution) -> Execution {
    if execution.status == ExecutionStatus::Running {
        execution.status = ExecutionStatus::Interrupted;
    }
    execution
}

/// Wait for a run to settle; false if `limit` passed first
async fn wait_settled(mut settled: watch::Receiver<bool>, limit: Duration) -> bool {
    timeout(limit, async move {
        let _ = settled.wait_for(|done| *done).await;
    })
    .await
    .is_ok()
}
