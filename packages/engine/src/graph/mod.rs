// packages/engine/src/graph/mod.rs
//! Graph execution engine
//!
//! Runs one [`Execution`] of a [`Graph`] for an instance:
//!
//! - **Definition**: immutable graphs of agent, conditional, parallel and end nodes
//! - **Predicate**: conditions evaluated against the scratch state
//! - **Execution**: per-run state with depth and cycle accounting
//! - **Engine**: the step loop, budget checks and completion checkpoints

pub mod definition;
pub mod engine;
pub mod execution;
pub mod predicate;

pub use definition::{
    AgentNode, CheckpointMode, ConditionalNode, ConditionalRule, EndNode, Graph, GraphBuilder,
    NodeDefinition, NodeKind, ParallelNode,
};
pub use engine::{BudgetDecision, ExecutionHooks, ExecutionOutcome, GraphEngine, RunControl, RunReport};
pub use execution::{Execution, ExecutionStatus, Scratch};
pub use predicate::Predicate;
