// packages/engine/src/graph/definition.rs
//! Graph definitions
//!
//! A graph is immutable once validated. Definitions are usually loaded from
//! YAML:
//!
//! ```yaml
//! id: graph_triage
//! entry_node: classify
//! nodes:
//!   classify:
//!     type: agent
//!     prompt: "Classify: {{ticket}}"
//!     output_key: label
//!     edges: [route]
//!   route:
//!     type: conditional
//!     rules:
//!       - when: { op: equals, key: label, value: urgent }
//!         target: escalate
//!     default: done
//!     edges: [escalate, done]
//!   escalate:
//!     type: agent
//!     prompt: "Escalate {{ticket}}"
//!     edges: [done]
//!   done:
//!     type: end
//! ```

use super::predicate::Predicate;
use crate::bridges::inference::ToolSpec;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::GraphId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How a completion checkpoint is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// Block until the checkpoint is durable
    Sync,
    /// Continue immediately; failures become deferred warnings
    Async,
}

fn default_output_key() -> String {
    "output".to_string()
}

fn default_branches_key() -> String {
    "branches".to_string()
}

/// Single unit of work backed by the inference bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    /// Prompt template; `{{key}}` is replaced from the scratch state
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default = "default_output_key")]
    pub output_key: String,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    /// Query the knowledge bridge first, with this template
    #[serde(default)]
    pub knowledge_query: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub when: Predicate,
    pub target: String,
}

/// Chooses the next edge from the scratch state; first matching rule wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalNode {
    pub rules: Vec<ConditionalRule>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Fans out to independent branches and joins their results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelNode {
    /// Entry node of each branch
    pub branches: Vec<String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Any branch failure fails the whole node
    #[serde(default)]
    pub all_or_nothing: bool,
    #[serde(default)]
    pub branch_timeout_ms: Option<u64>,
    #[serde(default = "default_branches_key")]
    pub output_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndNode {
    /// Scratch key reported as the execution result
    #[serde(default)]
    pub result_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Agent(AgentNode),
    Conditional(ConditionalNode),
    Parallel(ParallelNode),
    End(EndNode),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Agent(_) => "agent",
            NodeKind::Conditional(_) => "conditional",
            NodeKind::Parallel(_) => "parallel",
            NodeKind::End(_) => "end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub edges: Vec<String>,
    /// Overrides the graph-level completion checkpoint
    #[serde(default)]
    pub checkpoint: Option<CheckpointMode>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl NodeDefinition {
    fn with_kind(kind: NodeKind) -> Self {
        Self {
            kind,
            edges: Vec::new(),
            checkpoint: None,
            timeout_ms: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn agent(prompt: impl Into<String>) -> Self {
        Self::with_kind(NodeKind::Agent(AgentNode {
            prompt: prompt.into(),
            system: None,
            output_key: default_output_key(),
            tools: Vec::new(),
            knowledge_query: None,
            model: None,
            max_tokens: None,
        }))
    }

    pub fn conditional(rules: Vec<ConditionalRule>, default: Option<&str>) -> Self {
        let mut edges: Vec<String> = rules.iter().map(|r| r.target.clone()).collect();
        if let Some(default) = default {
            edges.push(default.to_string());
        }
        edges.dedup();
        let mut node = Self::with_kind(NodeKind::Conditional(ConditionalNode {
            rules,
            default: default.map(str::to_string),
        }));
        node.edges = edges;
        node
    }

    pub fn parallel(branches: &[&str]) -> Self {
        Self::with_kind(NodeKind::Parallel(ParallelNode {
            branches: branches.iter().map(|b| b.to_string()).collect(),
            max_concurrency: None,
            all_or_nothing: false,
            branch_timeout_ms: None,
            output_key: default_branches_key(),
        }))
    }

    pub fn end() -> Self {
        Self::with_kind(NodeKind::End(EndNode::default()))
    }

    pub fn then(mut self, target: impl Into<String>) -> Self {
        self.edges.push(target.into());
        self
    }

    /// Set the output key of an agent or parallel node
    pub fn output(mut self, key: impl Into<String>) -> Self {
        match &mut self.kind {
            NodeKind::Agent(agent) => agent.output_key = key.into(),
            NodeKind::Parallel(parallel) => parallel.output_key = key.into(),
            NodeKind::End(end) => end.result_key = Some(key.into()),
            NodeKind::Conditional(_) => {}
        }
        self
    }

    pub fn with_checkpoint(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint = Some(mode);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn all_or_nothing(mut self) -> Self {
        if let NodeKind::Parallel(parallel) = &mut self.kind {
            parallel.all_or_nothing = true;
        }
        self
    }

    pub fn with_branch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let NodeKind::Parallel(parallel) = &mut self.kind {
            parallel.branch_timeout_ms = Some(timeout_ms);
        }
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        if let NodeKind::Parallel(parallel) = &mut self.kind {
            parallel.max_concurrency = Some(limit);
        }
        self
    }

    pub fn with_knowledge_query(mut self, query: impl Into<String>) -> Self {
        if let NodeKind::Agent(agent) = &mut self.kind {
            agent.knowledge_query = Some(query.into());
        }
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Immutable graph definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: GraphId,
    #[serde(default)]
    pub name: String,
    pub entry_node: String,
    pub nodes: BTreeMap<String, NodeDefinition>,
    /// Default completion checkpoint for every node
    #[serde(default)]
    pub checkpoint_on_completion: Option<CheckpointMode>,
}

impl Graph {
    pub fn builder(id: impl Into<GraphId>, entry_node: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            graph: Graph {
                id: id.into(),
                name: String::new(),
                entry_node: entry_node.into(),
                nodes: BTreeMap::new(),
                checkpoint_on_completion: None,
            },
        }
    }

    pub fn from_yaml(source: &str) -> Result<Self> {
        let graph: Graph = serde_yaml::from_str(source)
            .map_err(|e| EngineError::InvalidGraph(format!("YAML parse error: {}", e)))?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_json(source: &str) -> Result<Self> {
        let graph: Graph = serde_json::from_str(source)
            .map_err(|e| EngineError::InvalidGraph(format!("JSON parse error: {}", e)))?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn node(&self, id: &str) -> Result<&NodeDefinition> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::InvalidGraph(format!("node '{}' does not exist", id)))
    }

    /// Completion checkpoint mode for a node, if any
    pub fn checkpoint_mode(&self, node: &NodeDefinition) -> Option<CheckpointMode> {
        node.checkpoint.or(self.checkpoint_on_completion)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EngineError::InvalidGraph(format!("{}: {}", self.id, msg)));

        if !self.nodes.contains_key(&self.entry_node) {
            return invalid(format!("entry node '{}' does not exist", self.entry_node));
        }

        for (id, node) in &self.nodes {
            for edge in &node.edges {
                if !self.nodes.contains_key(edge) {
                    return invalid(format!("node '{}' has an edge to unknown node '{}'", id, edge));
                }
            }

            match &node.kind {
                NodeKind::Agent(_) if node.edges.len() > 1 => {
                    return invalid(format!("agent node '{}' has more than one edge", id));
                }
                NodeKind::Parallel(parallel) => {
                    if node.edges.len() > 1 {
                        return invalid(format!("parallel node '{}' has more than one edge", id));
                    }
                    if parallel.branches.is_empty() {
                        return invalid(format!("parallel node '{}' has no branches", id));
                    }
                    if parallel.max_concurrency == Some(0) {
                        return invalid(format!("parallel node '{}' allows no concurrency", id));
                    }
                    if let Some(branch) = parallel
                        .branches
                        .iter()
                        .find(|b| !self.nodes.contains_key(b.as_str()))
                    {
                        return invalid(format!(
                            "parallel node '{}' has unknown branch '{}'",
                            id, branch
                        ));
                    }
                }
                NodeKind::Conditional(conditional) => {
                    let targets = conditional
                        .rules
                        .iter()
                        .map(|r| &r.target)
                        .chain(conditional.default.iter());
                    for target in targets {
                        if !node.edges.contains(target) {
                            return invalid(format!(
                                "conditional node '{}' targets '{}' which is not one of its edges",
                                id, target
                            ));
                        }
                    }
                }
                NodeKind::End(_) if !node.edges.is_empty() => {
                    return invalid(format!("end node '{}' has outgoing edges", id));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Programmatic graph construction
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.graph.name = name.into();
        self
    }

    pub fn node(mut self, id: impl Into<String>, node: NodeDefinition) -> Self {
        self.graph.nodes.insert(id.into(), node);
        self
    }

    pub fn checkpoint_on_completion(mut self, mode: CheckpointMode) -> Self {
        self.graph.checkpoint_on_completion = Some(mode);
        self
    }

    pub fn build(self) -> Result<Graph> {
        self.graph.validate()?;
        Ok(self.graph)
    }
}
