//! Node and edge definitions.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::{Context, StepResult};
use crate::graph::error::GraphError;

/// Node variant. Terminal nodes are execution sinks; the other variants
/// differ in what their handlers do, not in how the engine treats them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Observation,
    Tool,
    System,
    Conditional,
    Human,
    Terminal,
}

impl NodeKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::Terminal)
    }
}

/// Execution body of a node.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        context: &mut Context,
    ) -> Result<StepResult, GraphError>;
}

/// Handler that succeeds without touching the context. Common for
/// terminal sinks.
pub struct PassthroughHandler;

#[async_trait]
impl NodeHandler for PassthroughHandler {
    async fn run(
        &self,
        _cancel: &CancellationToken,
        _context: &mut Context,
    ) -> Result<StepResult, GraphError> {
        Ok(StepResult::success(""))
    }
}

/// Adapter for synchronous node bodies. Keeps test and glue nodes from
/// needing their own trait impls.
pub struct SyncHandler<F>(pub F);

#[async_trait]
impl<F> NodeHandler for SyncHandler<F>
where
    F: Fn(&mut Context) -> Result<StepResult, GraphError> + Send + Sync,
{
    async fn run(
        &self,
        _cancel: &CancellationToken,
        context: &mut Context,
    ) -> Result<StepResult, GraphError> {
        (self.0)(context)
    }
}

/// One graph node: stable id, variant tag, execution body.
#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub handler: Arc<dyn NodeHandler>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind, handler: Arc<dyn NodeHandler>) -> Self {
        Self {
            id: id.into(),
            kind,
            handler,
        }
    }

    /// Terminal sink with a no-op body.
    pub fn terminal(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Terminal, Arc::new(PassthroughHandler))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Edge predicate over the producing node's result and the shared context.
pub type EdgePredicate = Arc<dyn Fn(&StepResult, &Context) -> bool + Send + Sync>;

/// Directed edge. Predicate-less edges are unconditional; `is_loop` marks
/// deliberate loop-backs for diagnostics only.
#[derive(Clone)]
pub struct Edge {
    pub to: String,
    pub predicate: Option<EdgePredicate>,
    pub is_loop: bool,
}

impl Edge {
    pub fn matches(&self, result: &StepResult, context: &Context) -> bool {
        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate(result, context))
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("to", &self.to)
            .field("conditional", &self.predicate.is_some())
            .field("is_loop", &self.is_loop)
            .finish()
    }
}
