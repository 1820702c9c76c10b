//! Plan execution: ready sets, fan-out, and retry with diagnosis.
//!
//! Ready sets of size one run inline against the shared context. Larger
//! sets fan out onto tasks, each against a context branch, merged back
//! under a lock as branches complete. The first failing branch cancels
//! its siblings and fails the run; branches already merged stay merged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, Task};
use crate::context::{Context, StepResult};
use crate::coordinator::plan::{Plan, PlanStep};
use crate::coordinator::review::parse_issues;
use crate::coordinator::{AgentRole, Coordinator};
use crate::error::{AgentError, CoordinatorError, SchedulingError};
use crate::telemetry::{EventKind, TelemetryEvent, TelemetrySink};

/// Context key naming the step currently executing in this context.
pub const CURRENT_STEP_KEY: &str = "plan.current_step";

/// Result key under which the planner reports its plan.
pub const PLAN_KEY: &str = "plan";

/// Everything one step execution needs, detached from the coordinator so
/// fan-out tasks can own a copy.
#[derive(Clone)]
pub(crate) struct StepRunner {
    executor: Arc<dyn Agent>,
    diagnostician: Option<Arc<dyn Agent>>,
    max_attempts: usize,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    step_timeout: Option<Duration>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl StepRunner {
    fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u32 << (attempt.saturating_sub(1)).min(16) as u32;
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        context: &mut Context,
    ) -> Result<StepResult, AgentError> {
        let call = self.executor.execute(cancel, task, context);
        let outcome = match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Err(AgentError::execution(format!(
                    "step attempt exceeded {:?}",
                    limit
                ))),
            },
            None => call.await,
        };

        // Unsuccessful results and errors take the same retry path.
        match outcome? {
            result if result.success => Ok(result),
            result => Err(AgentError::execution(
                result
                    .error
                    .unwrap_or_else(|| "step reported failure without detail".to_string()),
            )),
        }
    }

    /// Ask the diagnostician what went wrong. Best effort; the raw error
    /// doubles as guidance when no diagnostician is registered or it fails.
    async fn diagnose(
        &self,
        cancel: &CancellationToken,
        step: &PlanStep,
        error: &AgentError,
        context: &mut Context,
    ) -> String {
        let Some(diagnostician) = &self.diagnostician else {
            return error.to_string();
        };

        let probe = Task::new(format!(
            "Step '{}' ({}) failed with error: {}\nDiagnose the failure and state what the \
next attempt should do differently.",
            step.id, step.description, error
        ));
        match diagnostician.execute(cancel, &probe, context).await {
            Ok(result) => result
                .get("diagnosis")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            Err(err) => {
                warn!(step = %step.id, error = %err, "diagnosis failed, using raw error");
                error.to_string()
            }
        }
    }

    /// Run one plan step with bounded retry. Each retry appends the
    /// diagnosis of the previous failure to the instruction.
    pub(crate) async fn run_step(
        &self,
        cancel: &CancellationToken,
        run_task_id: &str,
        step: &PlanStep,
        metadata: HashMap<String, String>,
        context: &mut Context,
    ) -> Result<StepResult, CoordinatorError> {
        context.set(CURRENT_STEP_KEY, step.id.clone());
        let mut task = Task {
            id: step.id.clone(),
            instruction: step.description.clone(),
            metadata,
        };

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled);
            }

            let error = match self.attempt(cancel, &task, context).await {
                Ok(mut result) => {
                    result.node_id = step.id.clone();
                    debug!(step = %step.id, attempt, "step completed");
                    return Ok(result);
                }
                Err(AgentError::Cancelled) => return Err(CoordinatorError::Cancelled),
                Err(error) => error,
            };

            if !error.is_transient() || attempt == self.max_attempts {
                return Err(CoordinatorError::step_failed(
                    step.id.clone(),
                    attempt,
                    error,
                ));
            }

            warn!(step = %step.id, attempt, error = %error, "step failed, retrying");
            self.telemetry.record(
                TelemetryEvent::new(EventKind::Retry, run_task_id)
                    .with_meta("step", step.id.clone())
                    .with_meta("attempt", attempt.to_string()),
            );

            let guidance = self.diagnose(cancel, step, &error, context).await;
            task.instruction = format!(
                "{}\n\nPrevious attempt failed: {}\nGuidance: {}",
                step.description, error, guidance
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
                _ = tokio::time::sleep(self.backoff(attempt)) => {}
            }
        }
        unreachable!("retry loop returns before exhausting attempts")
    }
}

impl Coordinator {
    fn step_runner(&self) -> Result<StepRunner, CoordinatorError> {
        Ok(StepRunner {
            executor: self.require(AgentRole::Executor)?,
            diagnostician: self.agent(AgentRole::Diagnostician),
            max_attempts: self.config.max_step_attempts.max(1),
            retry_base_delay: self.config.retry_base_delay,
            retry_max_delay: self.config.retry_max_delay,
            step_timeout: self.config.step_timeout,
            telemetry: self.telemetry.clone(),
        })
    }

    /// Obtain a plan from the planner, validate it, then drive ready sets
    /// to completion.
    pub(crate) async fn run_plan_execute(
        &mut self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<StepResult, CoordinatorError> {
        let planner = self.require(AgentRole::Planner)?;
        let runner = self.step_runner()?;

        self.context.set_phase("planning");
        let plan_result = planner
            .execute(cancel, task, &mut self.context)
            .await
            .map_err(|e| CoordinatorError::step_failed(task.id.clone(), 1, e))?;

        let plan: Plan = match plan_result.get(PLAN_KEY) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| CoordinatorError::InvalidPlan(format!("unparseable plan: {}", e)))?,
            None => {
                return Err(CoordinatorError::InvalidPlan(
                    "planner result carries no plan".to_string(),
                ))
            }
        };
        // Rejects duplicate ids, unknown dependencies, and cycles before
        // any step runs.
        plan.validate()?;
        info!(task_id = %task.id, steps = plan.len(), "plan validated");

        self.context.set_phase("execute");
        let total = plan.len();
        let mut completed: HashSet<String> = HashSet::new();
        let mut rounds = 0usize;

        while completed.len() < total {
            if cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled);
            }
            rounds += 1;
            // Safety valve; validation should make this unreachable.
            if rounds > total * 2 {
                return Err(SchedulingError::NoProgress {
                    rounds,
                    completed: completed.len(),
                    total,
                }
                .into());
            }

            self.maybe_compress(cancel).await;

            let ready: Vec<PlanStep> = plan
                .ready_set(&completed)
                .into_iter()
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(SchedulingError::NoProgress {
                    rounds,
                    completed: completed.len(),
                    total,
                }
                .into());
            }
            debug!(
                round = rounds,
                ready = ready.len(),
                completed = completed.len(),
                "scheduling round"
            );

            if ready.len() == 1 {
                let step = &ready[0];
                runner
                    .run_step(cancel, &task.id, step, task.metadata.clone(), &mut self.context)
                    .await?;
                completed.insert(step.id.clone());
            } else {
                self.fan_out(cancel, task, &runner, ready, &mut completed)
                    .await?;
            }
        }

        let mut aggregate = StepResult::success(task.id.clone())
            .with_data("steps_completed", completed.len() as u64)
            .with_data("rounds", rounds as u64);

        // Optional post-completion review; failure is logged, never fatal.
        if let Some(reviewer) = self.agent(AgentRole::Reviewer) {
            self.context.set_phase("review");
            match reviewer.execute(cancel, task, &mut self.context).await {
                Ok(review) => match parse_issues(&review) {
                    Ok(issues) => {
                        aggregate = aggregate.with_data("review_issues", issues.len() as u64);
                    }
                    Err(err) => self.report_reviewer_failure(&task.id, &err.to_string()),
                },
                Err(err) => self.report_reviewer_failure(&task.id, &err.to_string()),
            }
        }

        Ok(aggregate)
    }

    /// Execute a ready set of N>1 steps concurrently, each on a context
    /// branch. Merges serialize behind one lock; the first error cancels
    /// the remaining branches.
    async fn fan_out(
        &mut self,
        cancel: &CancellationToken,
        task: &Task,
        runner: &StepRunner,
        ready: Vec<PlanStep>,
        completed: &mut HashSet<String>,
    ) -> Result<(), CoordinatorError> {
        let shared = Arc::new(Mutex::new(std::mem::take(&mut self.context)));
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_steps.max(1)));
        let branch_cancel = cancel.child_token();
        let mut join_set: JoinSet<Result<StepResult, CoordinatorError>> = JoinSet::new();

        for step in ready {
            let runner = runner.clone();
            let shared = shared.clone();
            let semaphore = semaphore.clone();
            let branch_cancel = branch_cancel.clone();
            let task_id = task.id.clone();
            let metadata = task.metadata.clone();

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| CoordinatorError::Cancelled)?;
                let mut branch = shared.lock().await.branch();

                let result = runner
                    .run_step(&branch_cancel, &task_id, &step, metadata, &mut branch)
                    .await?;

                // Merge only after full success; a failing branch never
                // touches the parent.
                shared.lock().await.merge_branch(branch);
                Ok(result)
            });
        }

        let mut failure: Option<CoordinatorError> = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => Err(CoordinatorError::Join(join_err.to_string())),
            };
            match outcome {
                Ok(result) => {
                    completed.insert(result.node_id);
                }
                Err(err) => {
                    // Keep the first failure; cancelled siblings report
                    // Cancelled and are ignored.
                    if failure.is_none() {
                        branch_cancel.cancel();
                        failure = Some(err);
                    }
                }
            }
        }

        self.context = match Arc::try_unwrap(shared) {
            Ok(mutex) => mutex.into_inner(),
            Err(arc) => arc.lock().await.clone(),
        };

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn report_reviewer_failure(&self, task_id: &str, error: &str) {
        warn!(task_id = %task_id, error = %error, "post-completion review failed");
        self.telemetry.record(
            TelemetryEvent::new(EventKind::ReviewerFailed, task_id).with_meta("error", error),
        );
    }
}
