//! taskweave: multi-agent orchestration runtime.
//!
//! Three subsystems cooperate to run LLM-driven agents against a codebase:
//! - the workflow graph engine: a node/edge state machine with branching,
//!   loops, and checkpoint/resume that every delegate builds on
//! - the coordinator: turns a dependency-annotated plan into ready sets,
//!   fans out concurrent steps, retries failures with injected diagnosis,
//!   and drives a review/fix convergence loop with stalemate detection
//! - the context budget: classifies token pressure and lossily compresses
//!   history while keeping the most recent material verbatim
//!
//! Front-ends, tool implementations, indexers, and model transports are
//! external collaborators consumed through the traits in [`agent`],
//! [`llm`], and [`tool`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskweave::{AgentConfig, AgentRole, Coordinator, CoordinatorConfig, Task};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut coordinator = Coordinator::new(CoordinatorConfig::default());
//! coordinator.register(AgentRole::Executor, Arc::new(my_executor), &AgentConfig::default()).await?;
//!
//! let cancel = CancellationToken::new();
//! let outcome = coordinator.execute(&cancel, &Task::new("fix the flaky test")).await?;
//! ```

pub mod agent;
pub mod budget;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod llm;
pub mod strategy;
pub mod telemetry;
pub mod tool;

// Re-exports for convenience
pub use agent::{Agent, AgentConfig, Task, STRATEGY_OVERRIDE_KEY};
pub use budget::{
    ApproxTokenCounter, BudgetConfig, CompressedContext, CompressionStrategy, ContextBudget,
    ContextManager, Pressure, TokenCounter,
};
pub use context::{Context, ContextSnapshot, Interaction, Role, StepResult, TokenUsage};
pub use coordinator::{
    AgentRole, Coordinator, CoordinatorConfig, Plan, PlanStep, ReviewIssue, ReviewOutcome,
    Severity, TaskOutcome, TaskStrategy,
};
pub use error::{AgentError, CoordinatorError, ModelError, SchedulingError, ToolError};
pub use graph::{
    Checkpoint, CheckpointStore, Edge, EdgePredicate, FileCheckpointStore, GraphError,
    MemoryCheckpointStore, Node, NodeHandler, NodeKind, PassthroughHandler, SyncHandler,
    WorkflowGraph, TASK_ID_KEY,
};
pub use llm::{GenerateOptions, LanguageModel, ModelResponse, ToolInvocation, ToolSpec};
pub use strategy::{AdaptiveStrategy, AggressiveStrategy, ConservativeStrategy, ContextStrategy};
pub use telemetry::{CollectingSink, EventKind, NullSink, TelemetryEvent, TelemetrySink};
pub use tool::{tool_specs, PermissionFootprint, Tool};
