// packages/engine/src/testing.rs
//! Deterministic collaborator doubles
//!
//! Used by the crate's own tests and benches, and handy for embedding the
//! core without a model provider.

use crate::bridges::inference::{InferenceBridge, InferenceChunk, InferenceRequest, InferenceStream};
use crate::bridges::knowledge::{KnowledgeAnswer, KnowledgeBridge};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Fallback {
    Fixed(String),
    Numbered(String),
}

#[derive(Debug)]
struct Script {
    per_node: HashMap<String, String>,
    node_delay: HashMap<String, Duration>,
    queue: VecDeque<String>,
    fallback: Fallback,
    tokens_per_call: u64,
    delay: Option<Duration>,
    pending_failures: u32,
    requests: Vec<InferenceRequest>,
}

/// Inference bridge that replays scripted responses
///
/// Response selection, in order: a fixed response for the requesting node,
/// the next queued response, then the fallback (a fixed text, or a numbered
/// text that changes on every call).
#[derive(Debug)]
pub struct ScriptedInference {
    script: Mutex<Script>,
    calls: AtomicU64,
}

impl ScriptedInference {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                per_node: HashMap::new(),
                node_delay: HashMap::new(),
                queue: VecDeque::new(),
                fallback: Fallback::Fixed("ok".to_string()),
                tokens_per_call: 10,
                delay: None,
                pending_failures: 0,
                requests: Vec::new(),
            }),
            calls: AtomicU64::new(0),
        }
    }

    /// Always answer `text` when no other rule applies
    pub fn replying(self, text: impl Into<String>) -> Self {
        self.script.lock().fallback = Fallback::Fixed(text.into());
        self
    }

    /// Answer `"<prefix> <n>"` with n counting calls
    pub fn numbered(self, prefix: impl Into<String>) -> Self {
        self.script.lock().fallback = Fallback::Numbered(prefix.into());
        self
    }

    pub fn respond_for(self, node_id: impl Into<String>, text: impl Into<String>) -> Self {
        self.script.lock().per_node.insert(node_id.into(), text.into());
        self
    }

    /// Delay answers for one node only
    pub fn delay_for(self, node_id: impl Into<String>, delay: Duration) -> Self {
        self.script.lock().node_delay.insert(node_id.into(), delay);
        self
    }

    pub fn enqueue(&self, text: impl Into<String>) {
        self.script.lock().queue.push_back(text.into());
    }

    pub fn with_tokens_per_call(self, tokens: u64) -> Self {
        self.script.lock().tokens_per_call = tokens;
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(Some(delay));
        self
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.script.lock().delay = delay;
    }

    /// Fail the next `count` invocations with `Unavailable`
    pub fn fail_next(&self, count: u32) {
        self.script.lock().pending_failures = count;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.script.lock().requests.clone()
    }
}

impl Default for ScriptedInference {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBridge for ScriptedInference {
    async fn invoke(&self, request: InferenceRequest) -> Result<InferenceStream> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let (text, tokens, delay, fail) = {
            let mut script = self.script.lock();
            script.requests.push(request.clone());

            let fail = script.pending_failures > 0;
            if fail {
                script.pending_failures -= 1;
            }

            let text = match script.per_node.get(&request.node_id) {
                Some(text) => text.clone(),
                None => match script.queue.pop_front() {
                    Some(text) => text,
                    None => match &script.fallback {
                        Fallback::Fixed(text) => text.clone(),
                        Fallback::Numbered(prefix) => format!("{} {}", prefix, call),
                    },
                },
            };
            let delay = script
                .node_delay
                .get(&request.node_id)
                .copied()
                .or(script.delay);
            (text, script.tokens_per_call, delay, fail)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(EngineError::Unavailable("scripted inference failure".to_string()));
        }

        let mut chunks: Vec<Result<InferenceChunk>> = text
            .split_inclusive(' ')
            .map(|piece| Ok(InferenceChunk::Delta { text: piece.to_string() }))
            .collect();
        chunks.push(Ok(InferenceChunk::Done {
            tokens_consumed: tokens,
        }));

        Ok(stream::iter(chunks).boxed())
    }
}

/// Knowledge bridge answering from a fixed table
#[derive(Debug, Default)]
pub struct StaticKnowledge {
    answers: HashMap<String, KnowledgeAnswer>,
    fallback: Option<KnowledgeAnswer>,
}

impl StaticKnowledge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries containing `keyword`
    pub fn with_answer(mut self, keyword: impl Into<String>, answer: impl Into<String>, confidence: f64) -> Self {
        self.answers.insert(
            keyword.into(),
            KnowledgeAnswer {
                answer: answer.into(),
                confidence,
            },
        );
        self
    }

    pub fn with_fallback(mut self, answer: impl Into<String>, confidence: f64) -> Self {
        self.fallback = Some(KnowledgeAnswer {
            answer: answer.into(),
            confidence,
        });
        self
    }
}

#[async_trait]
impl KnowledgeBridge for StaticKnowledge {
    async fn query(&self, text: &str) -> Result<KnowledgeAnswer> {
        let mut matches: Vec<(&String, &KnowledgeAnswer)> = self
            .answers
            .iter()
            .filter(|(keyword, _)| text.contains(keyword.as_str()))
            .collect();
        matches.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        matches
            .first()
            .map(|(_, answer)| (*answer).clone())
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| EngineError::Unavailable(format!("no knowledge for '{}'", text)))
    }
}
