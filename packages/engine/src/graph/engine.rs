// packages/engine/src/graph/engine.rs
//! Graph step loop
//!
//! For each node the engine:
//!
//! 1. checks the instance's remaining token budget and asks the lifecycle
//!    layer what to do when it is exhausted
//! 2. records the visit (depth and cycle bounds)
//! 3. runs the node under its deadline, racing the abort signal
//! 4. commits the advanced state and takes the completion checkpoint, if any
//!
//! Stopping is cooperative: a stop request ends the run before the next node.
//! An abort cancels the in-flight node and any outstanding parallel branches.

use super::definition::{AgentNode, CheckpointMode, ConditionalNode, Graph, NodeDefinition, NodeKind, ParallelNode};
use super::execution::{Execution, ExecutionStatus, Scratch};
use crate::bridges::inference::{collect_stream, ChatMessage, InferenceBridge, InferenceRequest};
use crate::bridges::knowledge::KnowledgeBridge;
use crate::ledger::{ExhaustionAction, Reservation, ResourceLedger};
use crate::utils::config::GraphConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::CheckpointId;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do when a step would start with no tokens left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Continue,
    Throttle(Duration),
    Halt(ExhaustionAction),
}

/// Callbacks from the engine into the lifecycle layer
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    async fn step_started(&self, _execution: &Execution, _node_id: &str) {}

    /// The execution advanced to a new node boundary
    async fn state_committed(&self, _execution: &Execution) {}

    async fn tokens_reserved(&self, _execution: &Execution, _reservation: &Reservation) {}

    async fn budget_exhausted(&self, execution: &Execution, node_id: &str) -> BudgetDecision;

    async fn checkpoint(&self, execution: &Execution) -> Result<CheckpointId>;
}

/// Stop and abort signals for one run
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    stop: CancellationToken,
    abort: CancellationToken,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish the current node, then stop
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Cancel the in-flight node immediately
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Reached an end node or a node without edges
    Completed { result: Option<Value> },
    /// Stopped at a node boundary on request
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution: Execution,
    pub outcome: ExecutionOutcome,
    pub checkpoints: Vec<CheckpointId>,
    /// Asynchronous checkpoint failures; they never fail a step
    pub deferred_warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Root,
    Branch,
}

enum DriveEnd {
    Completed(Option<Value>),
    Interrupted,
}

enum StepResult {
    Advance(String),
    Finish(Option<Value>),
}

#[derive(Default)]
struct CheckpointSink {
    pending: Vec<JoinHandle<Result<CheckpointId>>>,
    taken: Vec<CheckpointId>,
}

/// Executes graphs for instances
#[derive(Debug, Clone)]
pub struct GraphEngine {
    config: GraphConfig,
    ledger: Arc<ResourceLedger>,
    inference: Arc<dyn InferenceBridge>,
    knowledge: Option<Arc<dyn KnowledgeBridge>>,
}

impl GraphEngine {
    pub fn new(
        config: GraphConfig,
        ledger: Arc<ResourceLedger>,
        inference: Arc<dyn InferenceBridge>,
    ) -> Self {
        Self {
            config,
            ledger,
            inference,
            knowledge: None,
        }
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeBridge>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Run an execution from its current node until it completes, stops or fails
    pub async fn run(
        &self,
        graph: Arc<Graph>,
        mut execution: Execution,
        hooks: Arc<dyn ExecutionHooks>,
        control: RunControl,
    ) -> Result<RunReport> {
        if execution.graph_id != graph.id {
            return Err(EngineError::InvalidGraph(format!(
                "execution {} belongs to {}, not {}",
                execution.id, execution.graph_id, graph.id
            )));
        }

        debug!(
            instance_id = %execution.instance_id,
            execution_id = %execution.id,
            "Running graph {} from node '{}'",
            graph.id,
            execution.current_node
        );
        execution.status = ExecutionStatus::Running;

        let mut sink = CheckpointSink::default();
        let result = self
            .drive(&graph, &mut execution, &hooks, &control, Mode::Root, Some(&mut sink))
            .await;
        let deferred_warnings = settle(&mut sink).await;

        match result {
            Ok(end) => {
                let outcome = match end {
                    DriveEnd::Completed(result) => {
                        execution.status = ExecutionStatus::Completed;
                        info!(
                            instance_id = %execution.instance_id,
                            execution_id = %execution.id,
                            "Execution completed after {} steps",
                            execution.total_steps
                        );
                        ExecutionOutcome::Completed { result }
                    }
                    DriveEnd::Interrupted => {
                        execution.status = ExecutionStatus::Interrupted;
                        debug!(
                            instance_id = %execution.instance_id,
                            "Execution stopped before node '{}'",
                            execution.current_node
                        );
                        ExecutionOutcome::Interrupted
                    }
                };
                hooks.state_committed(&execution).await;
                Ok(RunReport {
                    execution,
                    outcome,
                    checkpoints: sink.taken,
                    deferred_warnings,
                })
            }
            Err(e) => {
                execution.status = match e {
                    EngineError::BudgetExhausted { .. } | EngineError::Cancelled => {
                        ExecutionStatus::Interrupted
                    }
                    _ => ExecutionStatus::Failed,
                };
                for warning in &deferred_warnings {
                    warn!(instance_id = %execution.instance_id, "{}", warning);
                }
                hooks.state_committed(&execution).await;
                Err(e)
            }
        }
    }

    fn drive<'a>(
        &'a self,
        graph: &'a Graph,
        execution: &'a mut Execution,
        hooks: &'a Arc<dyn ExecutionHooks>,
        control: &'a RunControl,
        mode: Mode,
        mut sink: Option<&'a mut CheckpointSink>,
    ) -> BoxFuture<'a, Result<DriveEnd>> {
        async move {
            loop {
                if control.aborted() {
                    return Err(EngineError::Cancelled);
                }
                if mode == Mode::Root && control.stop_requested() {
                    return Ok(DriveEnd::Interrupted);
                }

                let node_id = execution.current_node.clone();
                let node = graph.node(&node_id)?;

                self.enforce_budget(execution, &node_id, hooks, control).await?;
                execution.record_visit(&node_id, &self.config)?;
                hooks.step_started(execution, &node_id).await;

                let work = self.execute_node(graph, &node_id, node, execution, hooks, control);
                let step = match self.node_deadline(node) {
                    Some(deadline) => {
                        let step = tokio::select! {
                            biased;
                            _ = control.abort.cancelled() => return Err(EngineError::Cancelled),
                            step = timeout(deadline, work) => step,
                        };
                        step.map_err(|_| EngineError::Timeout {
                            operation: "graph_node",
                            after: deadline,
                        })??
                    }
                    None => tokio::select! {
                        biased;
                        _ = control.abort.cancelled() => return Err(EngineError::Cancelled),
                        step = work => step?,
                    },
                };

                metrics::counter!("agentcore_graph_steps_total", "node_type" => node.kind.type_name())
                    .increment(1);

                let finished = match step {
                    StepResult::Advance(next) => {
                        execution.current_node = next;
                        None
                    }
                    StepResult::Finish(result) => Some(result),
                };

                if let Some(sink) = sink.as_deref_mut() {
                    hooks.state_committed(execution).await;
                    self.completion_checkpoint(graph, node, execution, hooks, control, sink)
                        .await?;
                }

                if let Some(result) = finished {
                    return Ok(DriveEnd::Completed(result));
                }
            }
        }
        .boxed()
    }

    /// Deadline for one node step
    ///
    /// Parallel nodes are bounded per branch, so only an explicit node
    /// timeout applies to them.
    fn node_deadline(&self, node: &NodeDefinition) -> Option<Duration> {
        match (&node.kind, node.timeout()) {
            (_, Some(limit)) => Some(limit),
            (NodeKind::Parallel(_), None) => None,
            (_, None) => Some(self.config.node_timeout()),
        }
    }

    async fn enforce_budget(
        &self,
        execution: &Execution,
        node_id: &str,
        hooks: &Arc<dyn ExecutionHooks>,
        control: &RunControl,
    ) -> Result<()> {
        if self.ledger.check_budget(&execution.instance_id)? > 0 {
            return Ok(());
        }

        match hooks.budget_exhausted(execution, node_id).await {
            BudgetDecision::Continue => Ok(()),
            BudgetDecision::Throttle(delay) => {
                debug!(instance_id = %execution.instance_id, "Throttling node '{}' by {:?}", node_id, delay);
                tokio::select! {
                    biased;
                    _ = control.abort.cancelled() => Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(()),
                }
            }
            BudgetDecision::Halt(action) => Err(EngineError::BudgetExhausted {
                instance_id: execution.instance_id.clone(),
                action,
            }),
        }
    }

    async fn execute_node(
        &self,
        graph: &Graph,
        node_id: &str,
        node: &NodeDefinition,
        execution: &mut Execution,
        hooks: &Arc<dyn ExecutionHooks>,
        control: &RunControl,
    ) -> Result<StepResult> {
        match &node.kind {
            NodeKind::Agent(agent) => {
                self.run_agent(node_id, agent, execution, hooks).await?;
                Ok(next_edge(node))
            }
            NodeKind::Conditional(conditional) => {
                select_target(node_id, conditional, &execution.scratch_state).map(StepResult::Advance)
            }
            NodeKind::Parallel(parallel) => {
                self.run_parallel(graph, node_id, parallel, execution, hooks, control)
                    .await?;
                Ok(next_edge(node))
            }
            NodeKind::End(end) => Ok(StepResult::Finish(
                end.result_key
                    .as_ref()
                    .and_then(|key| execution.scratch_state.get(key).cloned()),
            )),
        }
    }

    async fn run_agent(
        &self,
        node_id: &str,
        agent: &AgentNode,
        execution: &mut Execution,
        hooks: &Arc<dyn ExecutionHooks>,
    ) -> Result<()> {
        let scratch = &execution.scratch_state;
        let mut messages = Vec::new();
        if let Some(system) = &agent.system {
            messages.push(ChatMessage::system(render(system, scratch)));
        }

        let mut knowledge_entry = None;
        if let Some(template) = &agent.knowledge_query {
            let knowledge = self.knowledge.as_ref().ok_or_else(|| EngineError::NodeFailed {
                node: node_id.to_string(),
                reason: "node queries knowledge but no knowledge bridge is configured".to_string(),
            })?;
            let answer = knowledge.query(&render(template, scratch)).await?;
            messages.push(ChatMessage::system(format!(
                "Relevant context (confidence {:.2}): {}",
                answer.confidence, answer.answer
            )));
            knowledge_entry = Some(json!({
                "answer": answer.answer,
                "confidence": answer.confidence,
            }));
        }
        messages.push(ChatMessage::user(render(&agent.prompt, scratch)));

        let request = InferenceRequest {
            instance_id: execution.instance_id.clone(),
            node_id: node_id.to_string(),
            messages,
            tools: agent.tools.clone(),
            model: agent.model.clone(),
            max_tokens: agent.max_tokens,
        };
        let outcome = collect_stream(self.inference.invoke(request).await?).await?;

        let reservation = self
            .ledger
            .reserve(&execution.instance_id, outcome.tokens_consumed)?;
        hooks.tokens_reserved(execution, &reservation).await;

        if let Some(entry) = knowledge_entry {
            execution
                .scratch_state
                .insert(format!("{}_knowledge", agent.output_key), entry);
        }
        execution
            .scratch_state
            .insert(agent.output_key.clone(), Value::String(outcome.text));
        Ok(())
    }

    async fn run_parallel(
        &self,
        graph: &Graph,
        node_id: &str,
        parallel: &ParallelNode,
        execution: &mut Execution,
        hooks: &Arc<dyn ExecutionHooks>,
        control: &RunControl,
    ) -> Result<()> {
        let seed = execution.scratch_state.clone();
        let ceiling = self.config.max_parallel_branches.max(1);
        let limit = parallel.max_concurrency.unwrap_or(ceiling).clamp(1, ceiling);
        let branch_timeout = parallel
            .branch_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.branch_timeout());

        let graph_id = execution.graph_id.clone();
        let instance_id = execution.instance_id.clone();
        let runs = parallel.branches.iter().cloned().map(|entry| {
            let mut branch = Execution::new(graph_id.clone(), instance_id.clone(), entry.as_str())
                .with_scratch(seed.clone());
            async move {
                let outcome = timeout(
                    branch_timeout,
                    self.drive(graph, &mut branch, hooks, control, Mode::Branch, None),
                )
                .await;
                (entry, outcome, branch)
            }
        });

        let results: Vec<_> = tokio::select! {
            biased;
            _ = control.abort.cancelled() => return Err(EngineError::Cancelled),
            results = stream::iter(runs).buffer_unordered(limit).collect::<Vec<_>>() => results,
        };

        let mut merged = serde_json::Map::new();
        let mut failures = Vec::new();
        for (entry, outcome, branch) in results {
            let report = match outcome {
                Ok(Ok(_)) => json!({
                    "status": "ok",
                    "output": Value::Object(changed_keys(&seed, &branch.scratch_state)),
                }),
                Ok(Err(e)) => {
                    if matches!(e, EngineError::Cancelled | EngineError::BudgetExhausted { .. }) {
                        return Err(e);
                    }
                    failures.push(format!("{}: {}", entry, e));
                    json!({ "status": "failed", "error": e.to_string() })
                }
                Err(_) => {
                    let reason = format!("timed out after {:?}", branch_timeout);
                    failures.push(format!("{}: {}", entry, reason));
                    json!({ "status": "failed", "error": reason })
                }
            };
            merged.insert(entry, report);
        }

        if !failures.is_empty() {
            if parallel.all_or_nothing {
                return Err(EngineError::NodeFailed {
                    node: node_id.to_string(),
                    reason: format!("branch failures: {}", failures.join("; ")),
                });
            }
            warn!(
                instance_id = %execution.instance_id,
                "Parallel node '{}' finished with {} failed branch(es)",
                node_id,
                failures.len()
            );
        }

        execution
            .scratch_state
            .insert(parallel.output_key.clone(), Value::Object(merged));
        Ok(())
    }

    async fn completion_checkpoint(
        &self,
        graph: &Graph,
        node: &NodeDefinition,
        execution: &Execution,
        hooks: &Arc<dyn ExecutionHooks>,
        control: &RunControl,
        sink: &mut CheckpointSink,
    ) -> Result<()> {
        match graph.checkpoint_mode(node) {
            None => Ok(()),
            Some(CheckpointMode::Sync) => {
                let id = tokio::select! {
                    biased;
                    _ = control.abort.cancelled() => return Err(EngineError::Cancelled),
                    id = hooks.checkpoint(execution) => id?,
                };
                sink.taken.push(id);
                Ok(())
            }
            Some(CheckpointMode::Async) => {
                let hooks = Arc::clone(hooks);
                let snapshot = execution.clone();
                let abort = control.abort.clone();
                sink.pending.push(tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => Err(EngineError::Cancelled),
                        id = hooks.checkpoint(&snapshot) => id,
                    }
                }));
                Ok(())
            }
        }
    }
}

/// Wait for outstanding asynchronous checkpoints and collect their failures
async fn settle(sink: &mut CheckpointSink) -> Vec<String> {
    let mut warnings = Vec::new();
    for handle in sink.pending.drain(..) {
        match handle.await {
            Ok(Ok(id)) => sink.taken.push(id),
            Ok(Err(e)) => warnings.push(format!("asynchronous checkpoint failed: {}", e)),
            Err(e) => warnings.push(format!("asynchronous checkpoint task failed: {}", e)),
        }
    }
    warnings
}

fn next_edge(node: &NodeDefinition) -> StepResult {
    match node.edges.first() {
        Some(next) => StepResult::Advance(next.clone()),
        None => StepResult::Finish(None),
    }
}

fn select_target(node_id: &str, conditional: &ConditionalNode, scratch: &Scratch) -> Result<String> {
    conditional
        .rules
        .iter()
        .find(|rule| rule.when.evaluate(scratch))
        .map(|rule| rule.target.clone())
        .or_else(|| conditional.default.clone())
        .ok_or_else(|| EngineError::NodeFailed {
            node: node_id.to_string(),
            reason: "no rule matched and no default target is set".to_string(),
        })
}

/// Keys a branch added or changed relative to the scratch it started from
fn changed_keys(seed: &Scratch, scratch: &Scratch) -> serde_json::Map<String, Value> {
    scratch
        .iter()
        .filter(|(key, value)| seed.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Replace `{{key}}` placeholders with scratch values
///
/// Strings are inserted verbatim, other values as JSON. Unknown keys render
/// as empty text.
pub fn render(template: &str, scratch: &Scratch) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match scratch.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {}
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::definition::ConditionalRule;
    use crate::graph::predicate::Predicate;
    use crate::ledger::ResourceLimits;
    use crate::testing::{ScriptedInference, StaticKnowledge};
    use crate::utils::clock::SystemClock;
    use crate::utils::config::LedgerConfig;
    use crate::utils::ids::InstanceId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct TestHooks {
        decision: Mutex<Option<BudgetDecision>>,
        fail_checkpoints: bool,
        checkpointed_nodes: Mutex<Vec<String>>,
        committed: Mutex<Vec<String>>,
        reservations: Mutex<Vec<Reservation>>,
        stop_on: Option<(String, RunControl)>,
    }

    #[async_trait]
    impl ExecutionHooks for TestHooks {
        async fn step_started(&self, _execution: &Execution, node_id: &str) {
            if let Some((node, control)) = &self.stop_on {
                if node == node_id {
                    control.request_stop();
                }
            }
        }

        async fn state_committed(&self, execution: &Execution) {
            self.committed.lock().push(execution.current_node.clone());
        }

        async fn tokens_reserved(&self, _execution: &Execution, reservation: &Reservation) {
            self.reservations.lock().push(reservation.clone());
        }

        async fn budget_exhausted(&self, _execution: &Execution, _node_id: &str) -> BudgetDecision {
            self.decision.lock().unwrap_or(BudgetDecision::Continue)
        }

        async fn checkpoint(&self, execution: &Execution) -> Result<CheckpointId> {
            if self.fail_checkpoints {
                return Err(EngineError::CheckpointFailed("store offline".into()));
            }
            self.checkpointed_nodes.lock().push(execution.current_node.clone());
            Ok(CheckpointId::generate())
        }
    }

    struct Fixture {
        engine: GraphEngine,
        ledger: Arc<ResourceLedger>,
        instance_id: InstanceId,
    }

    fn fixture(inference: ScriptedInference, tokens: u64, config: GraphConfig) -> Fixture {
        let ledger = Arc::new(ResourceLedger::new(LedgerConfig::default(), Arc::new(SystemClock)));
        let instance_id = InstanceId::generate();
        ledger.open(&instance_id, &ResourceLimits::default().with_tokens_per_window(tokens));
        let engine = GraphEngine::new(config, ledger.clone(), Arc::new(inference));
        Fixture {
            engine,
            ledger,
            instance_id,
        }
    }

    fn start(graph: &Graph, fixture: &Fixture) -> Execution {
        Execution::new(graph.id.clone(), fixture.instance_id.clone(), graph.entry_node.clone())
    }

    fn linear_graph() -> Graph {
        Graph::builder("graph_linear", "draft")
            .node("draft", NodeDefinition::agent("Write about {{topic}}").output("draft").then("polish"))
            .node("polish", NodeDefinition::agent("Polish: {{draft}}").output("final").then("done"))
            .node("done", NodeDefinition::end().output("final"))
            .build()
            .unwrap()
    }

    fn loop_graph() -> Graph {
        // draft -> check -> draft ... forever
        let check = NodeDefinition::conditional(
            vec![ConditionalRule {
                when: Predicate::Missing { key: "approved".into() },
                target: "draft".into(),
            }],
            Some("done"),
        );
        Graph::builder("graph_loop", "draft")
            .node("draft", NodeDefinition::agent("again").then("check"))
            .node("check", check)
            .node("done", NodeDefinition::end())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_linear_graph_completes() {
        let inference = ScriptedInference::new()
            .respond_for("draft", "rough text")
            .respond_for("polish", "final text")
            .with_tokens_per_call(25);
        let fx = fixture(inference, 1_000, GraphConfig::default());
        let graph = Arc::new(linear_graph());
        let mut exec = start(&graph, &fx);
        exec.scratch_state.insert("topic".into(), json!("ledgers"));
        let hooks = Arc::new(TestHooks::default());

        let report = fx
            .engine
            .run(graph, exec, hooks.clone(), RunControl::new())
            .await
            .unwrap();

        assert_eq!(
            report.outcome,
            ExecutionOutcome::Completed { result: Some(json!("final text")) }
        );
        assert_eq!(report.execution.status, ExecutionStatus::Completed);
        assert_eq!(report.execution.scratch_state["draft"], json!("rough text"));
        assert_eq!(fx.ledger.check_budget(&fx.instance_id).unwrap(), 950);
        assert_eq!(hooks.reservations.lock().len(), 2);
        assert_eq!(*hooks.committed.lock(), vec!["polish", "done", "done", "done"]);
    }

    #[tokio::test]
    async fn test_conditional_routing() {
        let route = NodeDefinition::conditional(
            vec![ConditionalRule {
                when: Predicate::Equals { key: "label".into(), value: json!("urgent") },
                target: "escalate".into(),
            }],
            Some("done"),
        );
        let graph = Graph::builder("graph_route", "classify")
            .node("classify", NodeDefinition::agent("classify").output("label").then("route"))
            .node("route", route)
            .node("escalate", NodeDefinition::agent("escalate").output("escalated").then("done"))
            .node("done", NodeDefinition::end())
            .build()
            .unwrap();
        let inference = ScriptedInference::new().respond_for("classify", "urgent");
        let fx = fixture(inference, 1_000, GraphConfig::default());
        let exec = start(&graph, &fx);

        let report = fx
            .engine
            .run(Arc::new(graph), exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap();
        assert_eq!(report.execution.visits("escalate"), 1);
        assert!(report.execution.scratch_state.contains_key("escalated"));
    }

    #[tokio::test]
    async fn test_changing_loop_hits_depth_limit() {
        let config = GraphConfig {
            max_graph_depth: 3,
            ..Default::default()
        };
        let fx = fixture(ScriptedInference::new().numbered("draft"), 1_000_000, config);
        let graph = Arc::new(loop_graph());
        let exec = start(&graph, &fx);

        let err = fx
            .engine
            .run(graph, exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::GraphDepthExceeded { limit: 3, .. }));
    }

    #[tokio::test]
    async fn test_stalled_loop_is_a_cycle() {
        let fx = fixture(ScriptedInference::new().replying("same"), 1_000_000, GraphConfig::default());
        let graph = Arc::new(loop_graph());
        let exec = start(&graph, &fx);

        let err = fx
            .engine
            .run(graph, exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::GraphCycleDetected { .. }));
    }

    #[tokio::test]
    async fn test_budget_halt_stops_before_next_node() {
        let fx = fixture(ScriptedInference::new().with_tokens_per_call(100), 100, GraphConfig::default());
        let graph = Arc::new(linear_graph());
        let exec = start(&graph, &fx);
        let hooks = Arc::new(TestHooks::default());
        *hooks.decision.lock() = Some(BudgetDecision::Halt(ExhaustionAction::Suspend));

        let err = fx
            .engine
            .run(graph, exec, hooks.clone(), RunControl::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::BudgetExhausted { action: ExhaustionAction::Suspend, .. }
        ));
        // the first node ran, the second never started
        assert_eq!(hooks.reservations.lock().len(), 1);
        assert_eq!(hooks.committed.lock().last().map(String::as_str), Some("polish"));
    }

    #[tokio::test]
    async fn test_budget_warn_continues() {
        let fx = fixture(ScriptedInference::new().with_tokens_per_call(100), 100, GraphConfig::default());
        let graph = Arc::new(linear_graph());
        let exec = start(&graph, &fx);

        let report = fx
            .engine
            .run(graph, exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));
        assert!(fx.ledger.snapshot(&fx.instance_id).unwrap().is_exceeded());
    }

    #[tokio::test]
    async fn test_stop_request_interrupts_at_boundary() {
        let fx = fixture(ScriptedInference::new(), 1_000, GraphConfig::default());
        let graph = Arc::new(linear_graph());
        let exec = start(&graph, &fx);
        let control = RunControl::new();
        let hooks = Arc::new(TestHooks {
            stop_on: Some(("draft".to_string(), control.clone())),
            ..Default::default()
        });

        let report = fx.engine.run(graph, exec, hooks, control).await.unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Interrupted);
        assert_eq!(report.execution.current_node, "polish");
        assert_eq!(report.execution.status, ExecutionStatus::Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_in_flight_node() {
        let inference = ScriptedInference::new().with_delay(Duration::from_secs(60));
        let fx = fixture(inference, 1_000, GraphConfig::default());
        let graph = Arc::new(linear_graph());
        let exec = start(&graph, &fx);
        let control = RunControl::new();

        let engine = fx.engine.clone();
        let run_control = control.clone();
        let handle = tokio::spawn(async move {
            engine
                .run(graph, exec, Arc::new(TestHooks::default()), run_control)
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        control.abort();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(fx.ledger.check_budget(&fx.instance_id).unwrap(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_timeout() {
        let inference = ScriptedInference::new().delay_for("polish", Duration::from_secs(30));
        let fx = fixture(inference, 1_000, GraphConfig::default());
        let graph = Graph::builder("graph_slow", "polish")
            .node("polish", NodeDefinition::agent("slow").with_timeout_ms(1_000))
            .build()
            .unwrap();
        let exec = start(&graph, &fx);

        let err = fx
            .engine
            .run(Arc::new(graph), exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { operation: "graph_node", .. }));
    }

    fn fan_out(all_or_nothing: bool) -> Graph {
        let mut fan = NodeDefinition::parallel(&["fast", "slow"])
            .with_branch_timeout_ms(1_000)
            .output("research")
            .then("done");
        if all_or_nothing {
            fan = fan.all_or_nothing();
        }
        Graph::builder("graph_fan", "fan")
            .node("fan", fan)
            .node("fast", NodeDefinition::agent("fast").output("fast_notes"))
            .node("slow", NodeDefinition::agent("slow").output("slow_notes"))
            .node("done", NodeDefinition::end())
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_branch_timeout_fails_only_that_branch() {
        let inference = ScriptedInference::new()
            .respond_for("fast", "quick facts")
            .delay_for("slow", Duration::from_secs(10));
        let fx = fixture(inference, 1_000, GraphConfig::default());
        let graph = Arc::new(fan_out(false));
        let exec = start(&graph, &fx);

        let report = fx
            .engine
            .run(graph, exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap();
        let research = &report.execution.scratch_state["research"];
        assert_eq!(research["fast"]["status"], json!("ok"));
        assert_eq!(research["fast"]["output"]["fast_notes"], json!("quick facts"));
        assert_eq!(research["slow"]["status"], json!("failed"));
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_or_nothing_escalates_branch_failure() {
        let inference = ScriptedInference::new().delay_for("slow", Duration::from_secs(10));
        let fx = fixture(inference, 1_000, GraphConfig::default());
        let graph = Arc::new(fan_out(true));
        let exec = start(&graph, &fx);

        let err = fx
            .engine
            .run(graph, exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NodeFailed { ref node, .. } if node == "fan"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialized_branches_outlast_the_node_timeout() {
        let inference = ScriptedInference::new()
            .delay_for("a", Duration::from_secs(600))
            .delay_for("b", Duration::from_secs(600))
            .delay_for("c", Duration::from_secs(600));
        let fx = fixture(inference, 1_000, GraphConfig::default());
        let fan = NodeDefinition::parallel(&["a", "b", "c"])
            .with_max_concurrency(1)
            .with_branch_timeout_ms(60_000)
            .output("results")
            .then("done");
        let graph = Graph::builder("graph_serial_fan", "fan")
            .node("fan", fan)
            .node("a", NodeDefinition::agent("a"))
            .node("b", NodeDefinition::agent("b"))
            .node("c", NodeDefinition::agent("c"))
            .node("done", NodeDefinition::end())
            .build()
            .unwrap();
        let graph = Arc::new(graph);
        let exec = start(&graph, &fx);

        let report = fx
            .engine
            .run(graph, exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap();
        let results = report.execution.scratch_state["results"].as_object().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|branch| branch["status"] == json!("failed")));
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_timeout_still_bounds_a_parallel_node() {
        let inference = ScriptedInference::new().delay_for("slow", Duration::from_secs(10));
        let fx = fixture(inference, 1_000, GraphConfig::default());
        let fan = NodeDefinition::parallel(&["slow"])
            .with_branch_timeout_ms(60_000)
            .with_timeout_ms(1_000)
            .then("done");
        let graph = Graph::builder("graph_bounded_fan", "fan")
            .node("fan", fan)
            .node("slow", NodeDefinition::agent("slow"))
            .node("done", NodeDefinition::end())
            .build()
            .unwrap();
        let graph = Arc::new(graph);
        let exec = start(&graph, &fx);

        let err = fx
            .engine
            .run(graph, exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { operation: "graph_node", .. }));
    }

    #[tokio::test]
    async fn test_sync_checkpoints_capture_the_next_node() {
        let fx = fixture(ScriptedInference::new(), 1_000, GraphConfig::default());
        let graph = Graph::builder("graph_ckpt", "draft")
            .node("draft", NodeDefinition::agent("d").then("polish").with_checkpoint(CheckpointMode::Sync))
            .node("polish", NodeDefinition::agent("p").then("done"))
            .node("done", NodeDefinition::end())
            .build()
            .unwrap();
        let exec = start(&graph, &fx);
        let hooks = Arc::new(TestHooks::default());

        let report = fx
            .engine
            .run(Arc::new(graph), exec, hooks.clone(), RunControl::new())
            .await
            .unwrap();
        assert_eq!(report.checkpoints.len(), 1);
        assert_eq!(*hooks.checkpointed_nodes.lock(), vec!["polish"]);
    }

    #[tokio::test]
    async fn test_async_checkpoint_failure_is_deferred() {
        let fx = fixture(ScriptedInference::new(), 1_000, GraphConfig::default());
        let graph = Graph::builder("graph_async", "draft")
            .checkpoint_on_completion(CheckpointMode::Async)
            .node("draft", NodeDefinition::agent("d").then("done"))
            .node("done", NodeDefinition::end())
            .build()
            .unwrap();
        let exec = start(&graph, &fx);
        let hooks = Arc::new(TestHooks {
            fail_checkpoints: true,
            ..Default::default()
        });

        let report = fx
            .engine
            .run(Arc::new(graph), exec, hooks, RunControl::new())
            .await
            .unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));
        assert_eq!(report.deferred_warnings.len(), 2);
        assert!(report.checkpoints.is_empty());
    }

    #[tokio::test]
    async fn test_knowledge_is_queried_first() {
        let inference = Arc::new(ScriptedInference::new().replying("answer"));
        let ledger = Arc::new(ResourceLedger::new(LedgerConfig::default(), Arc::new(SystemClock)));
        let instance_id = InstanceId::generate();
        ledger.open(&instance_id, &ResourceLimits::default());
        let engine = GraphEngine::new(GraphConfig::default(), ledger, inference.clone())
            .with_knowledge(Arc::new(StaticKnowledge::new().with_answer("refund", "30 days", 0.9)));

        let graph = Graph::builder("graph_kb", "answer")
            .node(
                "answer",
                NodeDefinition::agent("Customer asks: {{question}}")
                    .with_knowledge_query("policy for {{question}}")
                    .output("reply"),
            )
            .build()
            .unwrap();
        let mut exec = Execution::new(graph.id.clone(), instance_id, "answer");
        exec.scratch_state.insert("question".into(), json!("refund window"));

        let report = engine
            .run(Arc::new(graph), exec, Arc::new(TestHooks::default()), RunControl::new())
            .await
            .unwrap();
        assert_eq!(report.execution.scratch_state["reply_knowledge"]["answer"], json!("30 days"));
        let request = &inference.requests()[0];
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].content, "Customer asks: refund window");
    }

    #[test]
    fn test_render() {
        let mut scratch = Scratch::new();
        scratch.insert("name".into(), json!("Ada"));
        scratch.insert("n".into(), json!(3));
        assert_eq!(render("Hi {{name}}, {{ n }} left{{missing}}", &scratch), "Hi Ada, 3 left");
        assert_eq!(render("open {{ brace", &scratch), "open {{ brace");
    }
}
