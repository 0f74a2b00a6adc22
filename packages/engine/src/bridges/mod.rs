// packages/engine/src/bridges/mod.rs
//! Collaborator contracts
//!
//! The core reaches provisioning, inference and knowledge retrieval only
//! through these traits. Transports live outside the crate.

pub mod inference;
pub mod knowledge;
pub mod provisioning;

pub use inference::{
    collect_stream, ChatMessage, InferenceBridge, InferenceChunk, InferenceOutcome,
    InferenceRequest, InferenceStream, Role, ToolSpec,
};
pub use knowledge::{KnowledgeAnswer, KnowledgeBridge};
pub use provisioning::{
    EnvironmentHandle, EnvironmentRequest, IsolationTier, LocalProvisioner, Provisioner,
};
