// packages/engine/src/bridges/knowledge.rs
//! Knowledge bridge contract

use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeAnswer {
    pub answer: String,
    /// 0.0 to 1.0
    pub confidence: f64,
}

/// Document and knowledge retrieval, used only by nodes that ask for it
#[async_trait]
pub trait KnowledgeBridge: Send + Sync + Debug {
    async fn query(&self, text: &str) -> Result<KnowledgeAnswer>;
}
