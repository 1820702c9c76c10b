use thiserror::Error;

use crate::error::{AgentError, ModelError};

/// Errors from graph construction, execution, and checkpointing.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph has no start node")]
    NoStartNode,

    #[error("unknown node id: {0}")]
    UnknownNode(String),

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    /// A non-terminal node produced a result no outgoing edge accepted.
    #[error("no edge matched at node {0}")]
    DeadEnd(String),

    #[error("node {node} failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("graph execution cancelled")]
    Cancelled,
}

impl GraphError {
    pub fn node_failed(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeFailed {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    /// Construction-time errors, surfaced before any node runs.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            GraphError::NoStartNode | GraphError::UnknownNode(_) | GraphError::DuplicateNode(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(GraphError: Send, Sync);

    #[test]
    fn test_build_error_classification() {
        assert!(GraphError::NoStartNode.is_build_error());
        assert!(GraphError::UnknownNode("x".into()).is_build_error());
        assert!(!GraphError::DeadEnd("x".into()).is_build_error());
        assert!(!GraphError::node_failed("n", "boom").is_build_error());
    }
}
