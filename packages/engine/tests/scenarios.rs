// packages/engine/tests/scenarios.rs
//! End-to-end scenarios against a fully wired `AgentCore`

use agentcore_engine::checkpoint::{CheckpointKind, MemoryCheckpointStore};
use agentcore_engine::graph::{ConditionalRule, Predicate};
use agentcore_engine::observability::MemoryEventSink;
use agentcore_engine::testing::ScriptedInference;
use agentcore_engine::utils::clock::ManualClock;
use agentcore_engine::{
    AgentCore, EngineConfig, EngineError, ExecutionStatus, Graph, InstanceState, NodeDefinition, SpawnConfig,
    TrustLevel,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    core: AgentCore,
    sink: Arc<MemoryEventSink>,
}

async fn harness(config: EngineConfig, inference: ScriptedInference) -> Harness {
    let sink = Arc::new(MemoryEventSink::new());
    let core = AgentCore::builder(config)
        .inference(Arc::new(inference))
        .checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
        .event_sink(sink.clone())
        .clock(Arc::new(ManualClock::starting_now()))
        .build()
        .await
        .unwrap();
    Harness { core, sink }
}

fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.fleet.warm_pool_target = 0;
    config.lifecycle.drain_poll_interval_ms = 10;
    config.lifecycle.stop_grace_ms = 100;
    config
}

fn two_step_graph() -> Graph {
    Graph::builder("graph_two_step", "research")
        .node("research", NodeDefinition::agent("Research the topic").output("notes").then("write"))
        .node("write", NodeDefinition::agent("Write up: {{notes}}").output("report").then("done"))
        .node("done", NodeDefinition::end())
        .build()
        .unwrap()
}

#[tokio::test]
async fn overage_is_recorded_and_reported() {
    let h = harness(quiet_config(), ScriptedInference::new()).await;
    let id = h
        .core
        .controller()
        .spawn(SpawnConfig::new(TrustLevel::Standard).with_tokens_per_window(1_000))
        .await
        .unwrap()
        .id;

    let first = h.core.ledger().reserve(&id, 800).unwrap();
    assert!(!first.exceeded);
    assert_eq!(first.remaining, 200);

    let second = h.core.ledger().reserve(&id, 700).unwrap();
    assert!(second.exceeded);
    assert_eq!(second.consumed, 1_500);
    assert_eq!(second.overage, 500);
    assert_eq!(h.core.ledger().check_budget(&id).unwrap(), 0);

    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn resume_continues_from_the_suspended_node() {
    let inference = ScriptedInference::new()
        .replying("notes")
        .delay_for("write", Duration::from_secs(30));
    let h = harness(quiet_config(), inference).await;
    let controller = h.core.controller();
    let graph_id = controller.register_graph(two_step_graph()).unwrap();
    let id = controller
        .spawn(SpawnConfig::new(TrustLevel::Standard).with_graph(graph_id))
        .await
        .unwrap()
        .id;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let before = controller.execution_state(&id).unwrap().unwrap();
    assert_eq!(before.current_node, "write");

    controller.suspend(&id, true).await.unwrap();
    assert_eq!(controller.state(&id).unwrap(), InstanceState::Suspended);

    controller.resume(&id, None).await.unwrap();
    let after = controller.execution_state(&id).unwrap().unwrap();
    assert_eq!(after.current_node, before.current_node);
    assert_eq!(after.id, before.id);
    assert!(after.scratch_state.contains_key("notes"));

    let report = controller
        .wait_for_execution(&id, Duration::from_secs(120))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn drain_of_busy_instance_is_forced_after_timeout() {
    let inference = ScriptedInference::new().delay_for("research", Duration::from_secs(3_600));
    let h = harness(quiet_config(), inference).await;
    let controller = h.core.controller();
    let graph_id = controller.register_graph(two_step_graph()).unwrap();
    let id = controller
        .spawn(SpawnConfig::new(TrustLevel::Standard).with_graph(graph_id))
        .await
        .unwrap()
        .id;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.is_executing(&id));

    let report = h
        .core
        .fleet()
        .graceful_drain(&id, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(report.forced);
    assert!(report.elapsed >= Duration::from_secs(30));
    assert_eq!(controller.state(&id).unwrap(), InstanceState::Terminated);

    let checkpoint = controller.checkpoints(&id).pop().unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::PreDrain);
    assert_eq!(Some(checkpoint.id), report.checkpoint_id);
    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scale_down_terminates_exactly_the_requested_count() {
    let h = harness(quiet_config(), ScriptedInference::new()).await;
    let fleet = h.core.fleet();
    let controller = h.core.controller();

    let up = fleet.scale_up(5, "seed").await.unwrap();
    assert_eq!(up.cold_spawns, 5);
    assert_eq!(fleet.fleet_size(), 5);

    let down = fleet.scale_down(3, "cost").await.unwrap();
    assert_eq!(down.affected.len(), 3);
    assert_eq!(down.forced_drains, 0);

    let mut drained = down.affected.clone();
    drained.sort();
    drained.dedup();
    assert_eq!(drained.len(), 3);

    for id in &up.affected {
        let state = controller.state(id).unwrap();
        if down.affected.contains(id) {
            assert_eq!(state, InstanceState::Terminated);
            let path: Vec<InstanceState> = controller.history(id).unwrap().iter().map(|t| t.to).collect();
            assert_eq!(
                path,
                vec![InstanceState::Running, InstanceState::Suspended, InstanceState::Terminated]
            );
        } else {
            assert_eq!(state, InstanceState::Running);
        }
    }
    assert_eq!(fleet.fleet_size(), 2);

    h.core.recorder().flush().await;
    for id in &down.affected {
        let names = h.sink.names_for(id);
        assert!(names.contains(&"suspended"));
        assert!(names.contains(&"terminated"));
        assert_eq!(names.last(), Some(&"fleet_scaled"));
    }
    h.core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn acquire_warm_on_empty_pool_returns_immediately() {
    let h = harness(quiet_config(), ScriptedInference::new()).await;
    let started = tokio::time::Instant::now();

    assert!(h.core.fleet().acquire_warm(Duration::ZERO).await.is_none());
    assert_eq!(started.elapsed(), Duration::ZERO);
    h.core.shutdown().await;
}

#[tokio::test]
async fn runaway_loop_fails_with_depth_exceeded() {
    let mut config = quiet_config();
    config.graph.max_graph_depth = 4;
    let h = harness(config, ScriptedInference::new().numbered("attempt")).await;
    let controller = h.core.controller();

    let check = NodeDefinition::conditional(
        vec![ConditionalRule {
            when: Predicate::Missing { key: "approved".into() },
            target: "attempt".into(),
        }],
        Some("done"),
    );
    let graph = Graph::builder("graph_runaway", "attempt")
        .node("attempt", NodeDefinition::agent("Try again").output("draft").then("check"))
        .node("check", check)
        .node("done", NodeDefinition::end())
        .build()
        .unwrap();
    let graph_id = controller.register_graph(graph).unwrap();
    let id = controller
        .spawn(SpawnConfig::new(TrustLevel::Standard).with_graph(graph_id))
        .await
        .unwrap()
        .id;

    let report = controller
        .wait_for_execution(&id, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.error_kind, Some("graph_depth_exceeded"));
    assert!(report.steps <= 2 * 4 + 1);
    assert_eq!(controller.state(&id).unwrap(), InstanceState::Suspended);
    h.core.shutdown().await;
}

#[tokio::test]
async fn operations_on_unknown_instances_are_typed_errors() {
    let h = harness(quiet_config(), ScriptedInference::new()).await;
    let ghost = agentcore_engine::utils::ids::InstanceId::new("inst_missing");

    assert!(matches!(
        h.core.controller().suspend(&ghost, false).await,
        Err(EngineError::InstanceNotFound(_))
    ));
    assert!(matches!(
        h.core.ledger().check_budget(&ghost),
        Err(EngineError::InstanceNotFound(_))
    ));
    h.core.shutdown().await;
}

mod checkpoint_round_trip {
    use agentcore_engine::checkpoint::{CheckpointAdapter, CheckpointKind, MemoryCheckpointStore};
    use agentcore_engine::graph::{Execution, ExecutionStatus, Scratch};
    use agentcore_engine::ledger::{ResourceBudget, ResourceLimits};
    use agentcore_engine::utils::clock::ManualClock;
    use agentcore_engine::utils::config::CheckpointConfig;
    use agentcore_engine::utils::ids::{GraphId, InstanceId};
    use agentcore_engine::TrustLevel;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn scratch_entry() -> impl Strategy<Value = (String, serde_json::Value)> {
        let value = prop_oneof![
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z ]{0,24}".prop_map(|s| json!(s)),
            any::<bool>().prop_map(|b| json!(b)),
            proptest::collection::vec("[a-z]{1,6}", 0..4).prop_map(|v| json!(v)),
        ];
        ("[a-z_]{1,10}", value)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn saved_state_loads_back_unchanged(
            node in "[a-z]{1,12}",
            steps in 0u32..500,
            consumed in 0u64..5_000,
            entries in proptest::collection::vec(scratch_entry(), 0..8),
            interrupted in any::<bool>(),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async move {
                let clock = Arc::new(ManualClock::starting_now());
                let adapter = CheckpointAdapter::new(
                    Arc::new(MemoryCheckpointStore::new()),
                    CheckpointConfig::default(),
                    clock.clone(),
                );
                let instance_id = InstanceId::generate();

                let mut execution = Execution::new(GraphId::new("graph_prop"), instance_id.clone(), node)
                    .with_scratch(entries.into_iter().collect::<Scratch>());
                execution.total_steps = steps;
                if interrupted {
                    execution.status = ExecutionStatus::Interrupted;
                }
                let limits = ResourceLimits::for_trust(TrustLevel::Standard);
                let mut budget = ResourceBudget::new(&limits, execution.started_at, chrono::Duration::hours(1));
                budget.consumed_tokens = consumed;

                let checkpoint = adapter
                    .save(&instance_id, Some(&execution), Some(&budget), CheckpointKind::Manual, "prop")
                    .await
                    .unwrap();
                let snapshot = adapter.load(&checkpoint).await.unwrap();

                assert_eq!(snapshot.instance_id, instance_id);
                assert_eq!(snapshot.execution, Some(execution));
                assert_eq!(snapshot.budget, Some(budget));
            });
        }
    }
}
