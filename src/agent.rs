//! Delegate agent contract.
//!
//! The scheduler and graph engine are agnostic to what a delegate does
//! internally. A delegate may answer with a direct model call, a tool
//! call, or by building a workflow graph of its own.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::{Context, StepResult};
use crate::error::AgentError;
use crate::graph::WorkflowGraph;
use crate::llm::GenerateOptions;

/// Metadata key holding an explicit strategy override.
pub const STRATEGY_OVERRIDE_KEY: &str = "task.strategy";

/// One unit of requested work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            instruction: instruction.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Derived task carrying a rewritten instruction, same id and metadata.
    pub fn with_instruction(&self, instruction: impl Into<String>) -> Self {
        Self {
            id: self.id.clone(),
            instruction: instruction.into(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Settings handed to a delegate at registration time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: Option<String>,
    #[serde(default)]
    pub options: GenerateOptions,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl AgentConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Contract every delegate implements.
#[async_trait]
pub trait Agent: Send + Sync {
    /// One-time setup. Called once at registration.
    async fn initialize(&self, _config: &AgentConfig) -> Result<(), AgentError> {
        Ok(())
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        context: &mut Context,
    ) -> Result<StepResult, AgentError>;

    /// Free-form capability tags, used for routing and logging.
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Graph-backed delegates expose their workflow here; direct delegates
    /// return `None`.
    fn build_graph(&self, _task: &Task) -> Option<WorkflowGraph> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Agent);

    struct NoopAgent;

    #[async_trait]
    impl Agent for NoopAgent {
        async fn execute(
            &self,
            _cancel: &CancellationToken,
            task: &Task,
            _context: &mut Context,
        ) -> Result<StepResult, AgentError> {
            Ok(StepResult::success(task.id.clone()))
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["noop".into()]
        }
    }

    #[test]
    fn test_task_instruction_rewrite_keeps_identity() {
        let task = Task::new("fix the bug").with_metadata("task.strategy", "single_agent");
        let rewritten = task.with_instruction("fix the bug\n\nOutstanding issues: ...");

        assert_eq!(rewritten.id, task.id);
        assert_eq!(rewritten.metadata, task.metadata);
        assert_ne!(rewritten.instruction, task.instruction);
    }

    #[tokio::test]
    async fn test_default_trait_methods() {
        let agent = NoopAgent;
        agent.initialize(&AgentConfig::default()).await.unwrap();
        assert!(agent.build_graph(&Task::new("anything")).is_none());
        assert_eq!(agent.capabilities(), vec!["noop".to_string()]);
    }
}
