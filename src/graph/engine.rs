//! Graph executor.
//!
//! One node runs at a time against the shared context. After each node,
//! outgoing edges are evaluated in registration order and the first match
//! is followed. The engine carries no step budget; loops terminate through
//! node-level logic, typically an iteration counter kept in the context.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{Context, StepResult};
use crate::graph::error::GraphError;
use crate::graph::node::{Edge, EdgePredicate, Node};
use crate::telemetry::{EventKind, NullSink, TelemetryEvent, TelemetrySink};

/// Context key the engine reads for telemetry task attribution.
pub const TASK_ID_KEY: &str = "task.id";

/// Node/edge state machine over a shared [`Context`].
#[derive(Clone)]
pub struct WorkflowGraph {
    nodes: HashMap<String, Node>,
    /// Ordered edge lists per source; first matching predicate wins.
    edges: HashMap<String, Vec<Edge>>,
    start: Option<String>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            start: None,
            telemetry: Arc::new(NullSink),
        }
    }
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn set_start(&mut self, id: impl Into<String>) -> Result<(), GraphError> {
        let id = id.into();
        if !self.nodes.contains_key(&id) {
            return Err(GraphError::UnknownNode(id));
        }
        self.start = Some(id);
        Ok(())
    }

    /// Append an edge to `from`'s ordered edge list. Conditional forks must
    /// register mutually exclusive predicates with an unconditional default
    /// last; the engine follows the first match.
    pub fn add_edge(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        predicate: Option<EdgePredicate>,
        is_loop: bool,
    ) -> Result<(), GraphError> {
        let from = from.into();
        let to = to.into();
        if !self.nodes.contains_key(&from) {
            return Err(GraphError::UnknownNode(from));
        }
        if !self.nodes.contains_key(&to) {
            return Err(GraphError::UnknownNode(to));
        }
        self.edges.entry(from).or_default().push(Edge {
            to,
            predicate,
            is_loop,
        });
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Run from the start node until a terminal node or an error.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        context: &mut Context,
    ) -> Result<StepResult, GraphError> {
        let start = self.start.clone().ok_or(GraphError::NoStartNode)?;
        self.execute_from(cancel, &start, context).await
    }

    /// Run from an arbitrary node. Checkpoint resume enters here.
    pub async fn execute_from(
        &self,
        cancel: &CancellationToken,
        node_id: &str,
        context: &mut Context,
    ) -> Result<StepResult, GraphError> {
        if !self.nodes.contains_key(node_id) {
            return Err(GraphError::UnknownNode(node_id.to_string()));
        }

        let task_id: String = context.get_as(TASK_ID_KEY).unwrap_or_default();
        let mut current = node_id.to_string();

        loop {
            if cancel.is_cancelled() {
                return Err(GraphError::Cancelled);
            }

            let node = self
                .nodes
                .get(&current)
                .ok_or_else(|| GraphError::UnknownNode(current.clone()))?;

            debug!(node = %node.id, kind = ?node.kind, phase = %context.phase, "executing node");
            self.emit(EventKind::NodeStart, &task_id, &node.id, context);

            let mut result = match node.handler.run(cancel, context).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(node = %node.id, error = %err, "node failed");
                    self.emit(EventKind::NodeError, &task_id, &node.id, context);
                    return Err(err);
                }
            };
            result.node_id = node.id.clone();
            self.emit(EventKind::NodeFinish, &task_id, &node.id, context);

            if node.kind.is_terminal() {
                return Ok(result);
            }

            let next = self
                .edges
                .get(&current)
                .into_iter()
                .flatten()
                .find(|edge| edge.matches(&result, context));

            match next {
                Some(edge) => {
                    if edge.is_loop {
                        debug!(from = %current, to = %edge.to, "following loop-back edge");
                    }
                    current = edge.to.clone();
                }
                None => {
                    self.emit(EventKind::NodeError, &task_id, &node.id, context);
                    return Err(GraphError::DeadEnd(current));
                }
            }
        }
    }

    fn emit(&self, kind: EventKind, task_id: &str, node_id: &str, context: &Context) {
        self.telemetry.record(
            TelemetryEvent::new(kind, task_id)
                .with_meta("node", node_id)
                .with_meta("phase", context.phase.clone()),
        );
    }
}
