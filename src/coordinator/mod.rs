//! Step scheduler and delegate registry.
//!
//! The coordinator owns the registry of named delegates, the shared
//! [`Context`], and the budget. A task is classified into one of four
//! strategies and routed to the matching loop.

pub mod plan;
pub mod review;
pub mod scheduler;

pub use plan::{Plan, PlanStep};
pub use review::{ReviewIssue, ReviewOutcome, Severity, ISSUES_KEY};
pub use scheduler::{CURRENT_STEP_KEY, PLAN_KEY};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentConfig, Task, STRATEGY_OVERRIDE_KEY};
use crate::budget::{
    ApproxTokenCounter, BudgetConfig, CompressionStrategy, ContextBudget, ContextManager, Pressure,
};
use crate::context::{Context, StepResult};
use crate::error::CoordinatorError;
use crate::graph::TASK_ID_KEY;
use crate::llm::LanguageModel;
use crate::strategy::{AdaptiveStrategy, ContextStrategy};
use crate::telemetry::{NullSink, TelemetrySink};

/// Delegate roles the coordinator dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Executor,
    Reviewer,
    Diagnostician,
    Explorer,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentRole::Planner => "planner",
            AgentRole::Executor => "executor",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Diagnostician => "diagnostician",
            AgentRole::Explorer => "explorer",
        };
        f.write_str(name)
    }
}

/// How a task will be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStrategy {
    PlanExecute,
    ExploreModify,
    ReviewIterate,
    SingleAgent,
}

impl TaskStrategy {
    fn from_override(value: &str) -> Option<Self> {
        match value {
            "plan_execute" => Some(Self::PlanExecute),
            "explore_modify" => Some(Self::ExploreModify),
            "review_iterate" => Some(Self::ReviewIterate),
            "single_agent" => Some(Self::SingleAgent),
            _ => None,
        }
    }

    /// Explicit metadata override first, then instruction keywords.
    pub fn classify(task: &Task) -> Self {
        if let Some(strategy) = task
            .metadata
            .get(STRATEGY_OVERRIDE_KEY)
            .and_then(|v| Self::from_override(v))
        {
            return strategy;
        }

        let instruction = task.instruction.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| instruction.contains(w));

        if has(&["refactor", "architect", "architecture"]) {
            Self::PlanExecute
        } else if has(&["explore", "understand"]) {
            Self::ExploreModify
        } else if has(&["review", "improve"])
            || task
                .metadata
                .get("task.review")
                .is_some_and(|v| v == "true" || v == "1")
        {
            Self::ReviewIterate
        } else {
            Self::SingleAgent
        }
    }
}

/// Retry, review, and fan-out limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Attempts per plan step, including the first.
    pub max_step_attempts: usize,
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    pub max_review_iterations: usize,
    pub min_severity: Severity,
    /// Upper bound on concurrently running steps within one ready set.
    pub max_parallel_steps: usize,
    /// Per-attempt delegate deadline. Outer run deadlines stay the
    /// caller's job.
    #[serde(default, with = "humantime_serde")]
    pub step_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
            max_review_iterations: 4,
            min_severity: Severity::Warning,
            max_parallel_steps: num_cpus::get(),
            step_timeout: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_step_attempts(mut self, attempts: usize) -> Self {
        self.max_step_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_max_review_iterations(mut self, iterations: usize) -> Self {
        self.max_review_iterations = iterations.max(1);
        self
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    pub fn with_max_parallel_steps(mut self, parallel: usize) -> Self {
        self.max_parallel_steps = parallel.max(1);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }
}

/// Terminal state of one coordinated task run.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(StepResult),
    Review(ReviewOutcome),
}

impl TaskOutcome {
    /// The produced result, if the run ended with one.
    pub fn result(&self) -> Option<&StepResult> {
        match self {
            TaskOutcome::Completed(result) => Some(result),
            TaskOutcome::Review(ReviewOutcome::Approved { result, .. }) => Some(result),
            TaskOutcome::Review(_) => None,
        }
    }
}

/// Multi-agent task coordinator.
pub struct Coordinator {
    pub(crate) config: CoordinatorConfig,
    agents: HashMap<AgentRole, Arc<dyn Agent>>,
    pub(crate) context: Context,
    budget: ContextBudget,
    compression: CompressionStrategy,
    context_strategy: Arc<dyn ContextStrategy>,
    manager: ContextManager,
    model: Option<Arc<dyn LanguageModel>>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            agents: HashMap::new(),
            context: Context::new(),
            budget: ContextBudget::new(BudgetConfig::default()),
            compression: CompressionStrategy::default(),
            context_strategy: Arc::new(AdaptiveStrategy::default()),
            manager: ContextManager::new(Arc::new(ApproxTokenCounter::default()))
                .pin_prefix("task."),
            model: None,
            telemetry: Arc::new(NullSink),
        }
    }

    /// Model used for history summarization. Without one, compression
    /// passes are skipped.
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_budget(mut self, budget: ContextBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_compression(mut self, compression: CompressionStrategy) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_context_strategy(mut self, strategy: Arc<dyn ContextStrategy>) -> Self {
        self.context_strategy = strategy;
        self
    }

    pub fn with_context_manager(mut self, manager: ContextManager) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Register a delegate under a role, running its initialization.
    pub async fn register(
        &mut self,
        role: AgentRole,
        agent: Arc<dyn Agent>,
        config: &AgentConfig,
    ) -> Result<(), CoordinatorError> {
        agent
            .initialize(config)
            .await
            .map_err(|source| CoordinatorError::InitFailed {
                role: role.to_string(),
                source,
            })?;
        debug!(role = %role, capabilities = ?agent.capabilities(), "agent registered");
        self.agents.insert(role, agent);
        Ok(())
    }

    pub fn agent(&self, role: AgentRole) -> Option<Arc<dyn Agent>> {
        self.agents.get(&role).cloned()
    }

    pub(crate) fn require(&self, role: AgentRole) -> Result<Arc<dyn Agent>, CoordinatorError> {
        self.agent(role)
            .ok_or_else(|| CoordinatorError::MissingAgent(role.to_string()))
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Classify and run one task to a terminal outcome.
    pub async fn execute(
        &mut self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<TaskOutcome, CoordinatorError> {
        if cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled);
        }

        self.context.set(TASK_ID_KEY, task.id.clone());
        self.context.set("task.instruction", task.instruction.clone());

        let strategy = TaskStrategy::classify(task);
        info!(task_id = %task.id, strategy = ?strategy, "task classified");

        match strategy {
            TaskStrategy::PlanExecute => {
                let result = self.run_plan_execute(cancel, task).await?;
                Ok(TaskOutcome::Completed(result))
            }
            TaskStrategy::ReviewIterate => {
                let outcome = self.run_review_iterate(cancel, task).await?;
                Ok(TaskOutcome::Review(outcome))
            }
            TaskStrategy::ExploreModify => {
                let result = self.run_explore_modify(cancel, task).await?;
                Ok(TaskOutcome::Completed(result))
            }
            TaskStrategy::SingleAgent => {
                let result = self.run_single_agent(cancel, task).await?;
                Ok(TaskOutcome::Completed(result))
            }
        }
    }

    /// Best-effort exploration to prime the shared context, then one
    /// executor pass.
    async fn run_explore_modify(
        &mut self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<StepResult, CoordinatorError> {
        if let Some(explorer) = self.agent(AgentRole::Explorer) {
            self.context.set_phase("explore");
            if let Err(err) = explorer.execute(cancel, task, &mut self.context).await {
                warn!(error = %err, "exploration pass failed, continuing");
            }
        }

        let executor = self.require(AgentRole::Executor)?;
        self.context.set_phase("execute");
        self.maybe_compress(cancel).await;
        executor
            .execute(cancel, task, &mut self.context)
            .await
            .map_err(|e| CoordinatorError::step_failed(task.id.clone(), 1, e))
    }

    /// Direct delegation to the executor, or to any registered agent when
    /// no executor exists.
    async fn run_single_agent(
        &mut self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<StepResult, CoordinatorError> {
        let agent = match self.agent(AgentRole::Executor) {
            Some(agent) => agent,
            None => self
                .agents
                .values()
                .next()
                .cloned()
                .ok_or_else(|| CoordinatorError::MissingAgent(AgentRole::Executor.to_string()))?,
        };

        self.context.set_phase("execute");
        self.maybe_compress(cancel).await;
        agent
            .execute(cancel, task, &mut self.context)
            .await
            .map_err(|e| CoordinatorError::step_failed(task.id.clone(), 1, e))
    }

    /// Re-measure the budget and, under pressure, compress or evict. Never
    /// fatal; a failed pass leaves the context as it was.
    pub(crate) async fn maybe_compress(&mut self, cancel: &CancellationToken) {
        let pressure = self.budget.update_usage(&self.context, &[]);
        if pressure == Pressure::Ok {
            return;
        }

        if self.context_strategy.should_compress(&self.context) {
            match &self.model {
                Some(model) => {
                    self.compression
                        .compress_in_place(cancel, model.as_ref(), &mut self.context)
                        .await;
                }
                None => debug!("context pressure but no summarization model attached"),
            }
        }

        if pressure == Pressure::Critical {
            let target = self.budget.eviction_target();
            let evicted = self.manager.evict_to(&mut self.context, target);
            if !evicted.is_empty() {
                warn!(count = evicted.len(), "evicted context values under critical pressure");
            }
        }

        self.budget.update_usage(&self.context, &[]);
    }
}
