//! Integration tests for the coordinator:
//! - ready-set scheduling, fan-out, and branch merging
//! - plan validation failures surfaced before any step runs
//! - retry with injected diagnosis
//! - review/fix convergence, stalemate, and ceiling outcomes

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use taskweave::coordinator::{ISSUES_KEY, PLAN_KEY};
use taskweave::{
    Agent, AgentConfig, AgentError, AgentRole, CollectingSink, Context, Coordinator,
    CoordinatorConfig, CoordinatorError, EventKind, Plan, PlanStep, ReviewIssue, ReviewOutcome,
    SchedulingError, Severity, StepResult, Task, TaskOutcome, STRATEGY_OVERRIDE_KEY,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct ScriptedPlanner {
    plan: Plan,
}

#[async_trait]
impl Agent for ScriptedPlanner {
    async fn execute(
        &self,
        _cancel: &CancellationToken,
        task: &Task,
        _context: &mut Context,
    ) -> Result<StepResult, AgentError> {
        Ok(StepResult::success(task.id.clone())
            .with_data(PLAN_KEY, serde_json::to_value(&self.plan)?))
    }
}

#[derive(Default)]
struct RecordingExecutor {
    /// Instructions in invocation order.
    instructions: Mutex<Vec<String>>,
    /// Step ids in completion order.
    completions: Mutex<Vec<String>>,
    /// Step ids that fail their first attempt.
    fail_once: Mutex<HashSet<String>>,
    /// Step ids that fail every attempt.
    fail_always: HashSet<String>,
}

#[async_trait]
impl Agent for RecordingExecutor {
    async fn execute(
        &self,
        _cancel: &CancellationToken,
        task: &Task,
        context: &mut Context,
    ) -> Result<StepResult, AgentError> {
        self.instructions
            .lock()
            .unwrap()
            .push(task.instruction.clone());

        if self.fail_always.contains(&task.id) {
            return Err(AgentError::execution("permanently broken"));
        }
        if self.fail_once.lock().unwrap().remove(&task.id) {
            return Err(AgentError::execution("flag file missing"));
        }

        context.set(format!("executed.{}", task.id), true);
        if task.id == "c" {
            let saw_both = context.get_as::<bool>("executed.a").unwrap_or(false)
                && context.get_as::<bool>("executed.b").unwrap_or(false);
            context.set("c.saw_both_merges", saw_both);
        }
        self.completions.lock().unwrap().push(task.id.clone());
        Ok(StepResult::success(task.id.clone()))
    }
}

struct ScriptedDiagnostician {
    calls: AtomicUsize,
}

#[async_trait]
impl Agent for ScriptedDiagnostician {
    async fn execute(
        &self,
        _cancel: &CancellationToken,
        task: &Task,
        _context: &mut Context,
    ) -> Result<StepResult, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StepResult::success(task.id.clone())
            .with_data("diagnosis", "recreate the flag file before retrying"))
    }
}

/// Reviewer that pops a scripted issue list per invocation; an empty
/// deque reviews clean.
struct ScriptedReviewer {
    rounds: Mutex<VecDeque<Vec<ReviewIssue>>>,
}

impl ScriptedReviewer {
    fn new(rounds: Vec<Vec<ReviewIssue>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
        }
    }
}

#[async_trait]
impl Agent for ScriptedReviewer {
    async fn execute(
        &self,
        _cancel: &CancellationToken,
        task: &Task,
        _context: &mut Context,
    ) -> Result<StepResult, AgentError> {
        let issues = self.rounds.lock().unwrap().pop_front().unwrap_or_default();
        Ok(StepResult::success(task.id.clone())
            .with_data(ISSUES_KEY, serde_json::to_value(&issues)?))
    }
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_retry_delays(Duration::from_millis(1), Duration::from_millis(2))
}

async fn coordinator_with_plan(
    plan: Plan,
    executor: Arc<RecordingExecutor>,
    config: CoordinatorConfig,
) -> Coordinator {
    let mut coordinator = Coordinator::new(config);
    coordinator
        .register(
            AgentRole::Planner,
            Arc::new(ScriptedPlanner { plan }),
            &AgentConfig::default(),
        )
        .await
        .unwrap();
    coordinator
        .register(AgentRole::Executor, executor, &AgentConfig::default())
        .await
        .unwrap();
    coordinator
}

fn plan_task() -> Task {
    Task::new("carry out the plan").with_metadata(STRATEGY_OVERRIDE_KEY, "plan_execute")
}

#[tokio::test]
async fn test_independent_steps_all_complete() {
    let plan = Plan::new(vec![
        PlanStep::new("a", "step a"),
        PlanStep::new("b", "step b"),
        PlanStep::new("c2", "step c2"),
    ]);
    let executor = Arc::new(RecordingExecutor::default());
    let mut coordinator = coordinator_with_plan(plan, executor.clone(), fast_config()).await;

    let cancel = CancellationToken::new();
    let outcome = coordinator.execute(&cancel, &plan_task()).await.unwrap();

    let result = outcome.result().unwrap();
    assert_eq!(result.get("steps_completed"), Some(&serde_json::json!(3)));

    let completed: HashSet<String> = executor.completions.lock().unwrap().iter().cloned().collect();
    assert_eq!(
        completed,
        HashSet::from(["a".to_string(), "b".to_string(), "c2".to_string()])
    );
    // Every branch merged back into the shared context.
    for id in ["a", "b", "c2"] {
        assert_eq!(
            coordinator.context().get_as::<bool>(&format!("executed.{}", id)),
            Some(true)
        );
    }
}

#[tokio::test]
async fn test_dependent_step_runs_after_its_dependency() {
    let plan = Plan::new(vec![
        PlanStep::new("a", "produce the interface"),
        PlanStep::new("b", "implement against it").depends_on("a"),
    ]);
    let executor = Arc::new(RecordingExecutor::default());
    let mut coordinator = coordinator_with_plan(plan, executor.clone(), fast_config()).await;

    let cancel = CancellationToken::new();
    coordinator.execute(&cancel, &plan_task()).await.unwrap();

    assert_eq!(
        *executor.completions.lock().unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );
}

#[tokio::test]
async fn test_fan_out_then_join_barrier() {
    init_logging();
    // {a, b} run in parallel, then c observes both merges.
    let plan = Plan::new(vec![
        PlanStep::new("a", "left branch"),
        PlanStep::new("b", "right branch"),
        PlanStep::new("c", "join").depends_on("a").depends_on("b"),
    ]);
    let executor = Arc::new(RecordingExecutor::default());
    let mut coordinator = coordinator_with_plan(plan, executor.clone(), fast_config()).await;

    let cancel = CancellationToken::new();
    let outcome = coordinator.execute(&cancel, &plan_task()).await.unwrap();

    assert_eq!(
        outcome.result().unwrap().get("steps_completed"),
        Some(&serde_json::json!(3))
    );
    assert_eq!(
        coordinator.context().get_as::<bool>("c.saw_both_merges"),
        Some(true)
    );
    assert_eq!(
        executor.completions.lock().unwrap().last(),
        Some(&"c".to_string())
    );
}

#[tokio::test]
async fn test_unknown_dependency_is_scheduling_error_not_a_hang() {
    let plan = Plan::new(vec![PlanStep::new("a", "step a").depends_on("ghost")]);
    let executor = Arc::new(RecordingExecutor::default());
    let mut coordinator = coordinator_with_plan(plan, executor.clone(), fast_config()).await;

    let cancel = CancellationToken::new();
    let err = coordinator.execute(&cancel, &plan_task()).await.unwrap_err();

    assert!(err.is_plan_error());
    assert!(matches!(
        err,
        CoordinatorError::Scheduling(SchedulingError::UnknownDependency { ref step, ref dependency })
            if step == "a" && dependency == "ghost"
    ));
    // Rejected before any step ran.
    assert!(executor.instructions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_step_ids_rejected_before_execution() {
    // Two steps sharing an id must not both run; the plan is defective.
    let plan = Plan::new(vec![
        PlanStep::new("a", "step a"),
        PlanStep::new("a", "step a again"),
    ]);
    let executor = Arc::new(RecordingExecutor::default());
    let mut coordinator = coordinator_with_plan(plan, executor.clone(), fast_config()).await;

    let cancel = CancellationToken::new();
    let err = coordinator.execute(&cancel, &plan_task()).await.unwrap_err();

    assert!(err.is_plan_error());
    assert!(matches!(
        err,
        CoordinatorError::Scheduling(SchedulingError::DuplicateStep(ref id)) if id == "a"
    ));
    assert!(executor.instructions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cyclic_plan_rejected_before_execution() {
    let plan = Plan::new(vec![
        PlanStep::new("a", "").depends_on("b"),
        PlanStep::new("b", "").depends_on("a"),
    ]);
    let executor = Arc::new(RecordingExecutor::default());
    let mut coordinator = coordinator_with_plan(plan, executor.clone(), fast_config()).await;

    let cancel = CancellationToken::new();
    let err = coordinator.execute(&cancel, &plan_task()).await.unwrap_err();

    let CoordinatorError::Scheduling(SchedulingError::CyclicDependency { cycle }) = err else {
        panic!("expected cycle error, got {:?}", err);
    };
    assert_eq!(cycle.first(), cycle.last());
    assert!(executor.instructions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_injects_diagnosis_into_second_attempt() {
    init_logging();
    let plan = Plan::new(vec![PlanStep::new("s1", "wire up the feature flag")]);
    let executor = Arc::new(RecordingExecutor {
        fail_once: Mutex::new(HashSet::from(["s1".to_string()])),
        ..Default::default()
    });
    let diagnostician = Arc::new(ScriptedDiagnostician {
        calls: AtomicUsize::new(0),
    });
    let sink = Arc::new(CollectingSink::new());

    let mut coordinator = Coordinator::new(fast_config().with_max_step_attempts(3))
        .with_telemetry(sink.clone());
    coordinator
        .register(
            AgentRole::Planner,
            Arc::new(ScriptedPlanner { plan }),
            &AgentConfig::default(),
        )
        .await
        .unwrap();
    coordinator
        .register(AgentRole::Executor, executor.clone(), &AgentConfig::default())
        .await
        .unwrap();
    coordinator
        .register(
            AgentRole::Diagnostician,
            diagnostician.clone(),
            &AgentConfig::default(),
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    coordinator.execute(&cancel, &plan_task()).await.unwrap();

    let instructions = executor.instructions.lock().unwrap().clone();
    assert_eq!(instructions.len(), 2, "exactly one failure, one success");
    assert_eq!(instructions[0], "wire up the feature flag");
    assert!(instructions[1].contains("flag file missing"));
    assert!(instructions[1].contains("recreate the flag file before retrying"));

    assert_eq!(diagnostician.calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.count_of(EventKind::Retry), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() {
    let plan = Plan::new(vec![
        PlanStep::new("ok", "fine"),
        PlanStep::new("doomed", "never works"),
    ]);
    let executor = Arc::new(RecordingExecutor {
        fail_always: HashSet::from(["doomed".to_string()]),
        ..Default::default()
    });
    let mut coordinator =
        coordinator_with_plan(plan, executor, fast_config().with_max_step_attempts(2)).await;

    let cancel = CancellationToken::new();
    let err = coordinator.execute(&cancel, &plan_task()).await.unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::StepFailed { ref step, attempts, .. }
            if step == "doomed" && attempts == 2
    ));
    assert!(!err.is_plan_error());
}

fn review_task() -> Task {
    Task::new("tighten up the module").with_metadata(STRATEGY_OVERRIDE_KEY, "review_iterate")
}

async fn review_coordinator(
    executor: Arc<RecordingExecutor>,
    reviewer: ScriptedReviewer,
    sink: Arc<CollectingSink>,
) -> Coordinator {
    let mut coordinator = Coordinator::new(fast_config()).with_telemetry(sink);
    coordinator
        .register(AgentRole::Executor, executor, &AgentConfig::default())
        .await
        .unwrap();
    coordinator
        .register(AgentRole::Reviewer, Arc::new(reviewer), &AgentConfig::default())
        .await
        .unwrap();
    coordinator
}

#[tokio::test]
async fn test_review_loop_converges_to_approval() {
    let issue = ReviewIssue::new("src/lib.rs", 42, Severity::Error, "tighten the bounds check");
    let executor = Arc::new(RecordingExecutor::default());
    let sink = Arc::new(CollectingSink::new());
    let mut coordinator = review_coordinator(
        executor.clone(),
        ScriptedReviewer::new(vec![vec![issue.clone()], vec![]]),
        sink,
    )
    .await;

    let cancel = CancellationToken::new();
    let outcome = coordinator.execute(&cancel, &review_task()).await.unwrap();

    let TaskOutcome::Review(ReviewOutcome::Approved { iterations, .. }) = outcome else {
        panic!("expected approval");
    };
    assert_eq!(iterations, 2);

    let instructions = executor.instructions.lock().unwrap().clone();
    assert_eq!(instructions.len(), 2);
    assert!(instructions[1].contains("tighten the bounds check"));
    assert!(instructions[1].contains("src/lib.rs"));
}

#[tokio::test]
async fn test_identical_issue_sets_stop_as_stalemate() {
    let issues = vec![
        ReviewIssue::new("a.rs", 1, Severity::Error, "unresolved"),
        ReviewIssue::new("b.rs", 7, Severity::Warning, "still here"),
    ];
    // Same set twice, in different order the second time.
    let mut reversed = issues.clone();
    reversed.reverse();

    let executor = Arc::new(RecordingExecutor::default());
    let sink = Arc::new(CollectingSink::new());
    let mut coordinator = review_coordinator(
        executor.clone(),
        ScriptedReviewer::new(vec![issues.clone(), reversed]),
        sink.clone(),
    )
    .await;

    let cancel = CancellationToken::new();
    let outcome = coordinator.execute(&cancel, &review_task()).await.unwrap();

    let TaskOutcome::Review(ReviewOutcome::Stalemate {
        iterations,
        outstanding,
    }) = outcome
    else {
        panic!("expected stalemate");
    };
    // Stopped well short of the default ceiling.
    assert_eq!(iterations, 2);
    assert_eq!(outstanding.len(), 2);
    assert_eq!(sink.count_of(EventKind::Stalemate), 1);
}

#[tokio::test]
async fn test_below_threshold_issues_review_clean() {
    let nit = ReviewIssue::new("style.rs", 3, Severity::Info, "prefer iterators");
    let executor = Arc::new(RecordingExecutor::default());
    let sink = Arc::new(CollectingSink::new());
    let mut coordinator =
        review_coordinator(executor.clone(), ScriptedReviewer::new(vec![vec![nit]]), sink).await;

    let cancel = CancellationToken::new();
    let outcome = coordinator.execute(&cancel, &review_task()).await.unwrap();

    let TaskOutcome::Review(ReviewOutcome::Approved { iterations, .. }) = outcome else {
        panic!("expected approval on first pass");
    };
    assert_eq!(iterations, 1);
    assert_eq!(executor.instructions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_ceiling_reports_needs_human() {
    // A different issue every round, never converging.
    let rounds: Vec<Vec<ReviewIssue>> = (0..8)
        .map(|i| {
            vec![ReviewIssue::new(
                "churn.rs",
                i,
                Severity::Error,
                format!("issue {}", i),
            )]
        })
        .collect();
    let executor = Arc::new(RecordingExecutor::default());
    let sink = Arc::new(CollectingSink::new());
    let mut coordinator =
        review_coordinator(executor.clone(), ScriptedReviewer::new(rounds), sink).await;

    let cancel = CancellationToken::new();
    let outcome = coordinator.execute(&cancel, &review_task()).await.unwrap();

    let TaskOutcome::Review(ReviewOutcome::NeedsHuman {
        iterations,
        outstanding,
    }) = outcome
    else {
        panic!("expected needs-human outcome");
    };
    assert_eq!(iterations, 4);
    assert_eq!(outstanding.len(), 1);
}

#[tokio::test]
async fn test_missing_executor_is_a_configuration_error() {
    let mut coordinator = Coordinator::new(fast_config());
    let cancel = CancellationToken::new();

    let task = Task::new("anything").with_metadata(STRATEGY_OVERRIDE_KEY, "single_agent");
    let err = coordinator.execute(&cancel, &task).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::MissingAgent(_)));
}

#[tokio::test]
async fn test_single_agent_falls_back_to_any_registered_agent() {
    let mut coordinator = Coordinator::new(fast_config());
    let reviewer = ScriptedReviewer::new(vec![]);
    coordinator
        .register(AgentRole::Reviewer, Arc::new(reviewer), &AgentConfig::default())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let task = Task::new("just answer").with_metadata(STRATEGY_OVERRIDE_KEY, "single_agent");
    let outcome = coordinator.execute(&cancel, &task).await.unwrap();
    assert!(outcome.result().is_some());
}

#[tokio::test]
async fn test_explore_modify_swallows_explorer_failure() {
    struct FailingExplorer;

    #[async_trait]
    impl Agent for FailingExplorer {
        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _task: &Task,
            _context: &mut Context,
        ) -> Result<StepResult, AgentError> {
            Err(AgentError::execution("index unavailable"))
        }
    }

    let executor = Arc::new(RecordingExecutor::default());
    let mut coordinator = Coordinator::new(fast_config());
    coordinator
        .register(AgentRole::Explorer, Arc::new(FailingExplorer), &AgentConfig::default())
        .await
        .unwrap();
    coordinator
        .register(AgentRole::Executor, executor.clone(), &AgentConfig::default())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let task = Task::new("poke around").with_metadata(STRATEGY_OVERRIDE_KEY, "explore_modify");
    let outcome = coordinator.execute(&cancel, &task).await.unwrap();

    assert!(outcome.result().is_some());
    assert_eq!(executor.instructions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancelled_run_returns_promptly() {
    let plan = Plan::new(vec![PlanStep::new("a", "step a")]);
    let executor = Arc::new(RecordingExecutor::default());
    let mut coordinator = coordinator_with_plan(plan, executor.clone(), fast_config()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = coordinator.execute(&cancel, &plan_task()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Cancelled));
    assert!(executor.instructions.lock().unwrap().is_empty());
}
