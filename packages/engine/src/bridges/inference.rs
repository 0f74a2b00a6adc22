// packages/engine/src/bridges/inference.rs
//! Inference bridge contract
//!
//! Only `agent` graph nodes call inference. The bridge streams text deltas
//! and finishes with the number of tokens the call consumed.

use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::InstanceId;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Tool made available to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub instance_id: InstanceId,
    pub node_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// One element of a streamed result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InferenceChunk {
    Delta { text: String },
    Done { tokens_consumed: u64 },
}

pub type InferenceStream = BoxStream<'static, Result<InferenceChunk>>;

#[async_trait]
pub trait InferenceBridge: Send + Sync + Debug {
    async fn invoke(&self, request: InferenceRequest) -> Result<InferenceStream>;
}

/// Fully collected inference result
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutcome {
    pub text: String,
    pub tokens_consumed: u64,
}

/// Drain a stream into text and token usage
///
/// A stream that ends without a `Done` chunk is an error: usage would be
/// unaccounted otherwise.
pub async fn collect_stream(mut stream: InferenceStream) -> Result<InferenceOutcome> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            InferenceChunk::Delta { text: delta } => text.push_str(&delta),
            InferenceChunk::Done { tokens_consumed } => {
                return Ok(InferenceOutcome {
                    text,
                    tokens_consumed,
                })
            }
        }
    }
    Err(EngineError::Unavailable(
        "inference stream ended without completion".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_collect_stream() {
        let chunks = vec![
            Ok(InferenceChunk::Delta { text: "hello ".into() }),
            Ok(InferenceChunk::Delta { text: "world".into() }),
            Ok(InferenceChunk::Done { tokens_consumed: 12 }),
        ];
        let outcome = collect_stream(stream::iter(chunks).boxed()).await.unwrap();
        assert_eq!(outcome.text, "hello world");
        assert_eq!(outcome.tokens_consumed, 12);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let chunks = vec![Ok(InferenceChunk::Delta { text: "partial".into() })];
        let err = collect_stream(stream::iter(chunks).boxed()).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
