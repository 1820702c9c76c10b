//! Error taxonomy for the orchestration runtime.
//!
//! Four failure families with distinct handling:
//! - configuration errors surface immediately and are never retried
//! - transient step failures are retried with injected diagnosis, then fatal
//! - convergence failures (review ceiling, stalemate) are outcomes, not errors
//! - scheduling failures (bad plan) are reported separately from step
//!   failures so operators can tell "bad plan" from "bad execution"

use thiserror::Error;

/// Errors raised by delegate agents, model calls, and tool calls.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("agent execution error: {0}")]
    Execution(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("agent call cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Transient failures are eligible for the scheduler's retry loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Model(_) | AgentError::Tool(_) | AgentError::Execution(_)
        )
    }
}

/// Errors from the language model transport.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("model call cancelled")]
    Cancelled,
}

impl ModelError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }
}

/// Errors from tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool execution failed: {0}")]
    Execution(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("tool call cancelled")]
    Cancelled,
}

/// Unsatisfiable or non-progressing dependency plans.
///
/// Kept separate from [`CoordinatorError::StepFailed`] so a bad plan is
/// distinguishable from bad execution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("plan is empty")]
    EmptyPlan,

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("no forward progress after {rounds} rounds ({completed}/{total} steps complete)")]
    NoProgress {
        rounds: usize,
        completed: usize,
        total: usize,
    },
}

/// Top-level coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// A required delegate is not registered. Fatal at dispatch, no retry.
    #[error("no agent registered for role {0:?}")]
    MissingAgent(String),

    /// A delegate rejected its configuration at registration time.
    #[error("agent initialization failed for role {role:?}: {source}")]
    InitFailed {
        role: String,
        #[source]
        source: AgentError,
    },

    /// A step exhausted its retry budget.
    #[error("step {step} failed after {attempts} attempts: {source}")]
    StepFailed {
        step: String,
        attempts: usize,
        #[source]
        source: AgentError,
    },

    #[error("scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    #[error("planner returned an unusable plan: {0}")]
    InvalidPlan(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("fan-out task panicked: {0}")]
    Join(String),
}

impl CoordinatorError {
    pub fn step_failed(step: impl Into<String>, attempts: usize, source: AgentError) -> Self {
        Self::StepFailed {
            step: step.into(),
            attempts,
            source,
        }
    }

    /// True for errors that indicate a defective plan rather than a
    /// failed execution attempt.
    pub fn is_plan_error(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Scheduling(_) | CoordinatorError::InvalidPlan(_)
        )
    }
}
