//! Review issues and the review/fix convergence loop.
//!
//! Issue sets are compared structurally across iterations: two rounds
//! producing the same filtered set mean the model is not converging, and
//! the loop stops with a stalemate outcome instead of burning its ceiling.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::Task;
use crate::context::StepResult;
use crate::coordinator::{AgentRole, Coordinator};
use crate::error::CoordinatorError;
use crate::telemetry::{EventKind, TelemetryEvent};

/// Context key under which a reviewer reports its issues.
pub const ISSUES_KEY: &str = "issues";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One reviewer finding. Structural equality drives stalemate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub file: String,
    pub line: u32,
    pub severity: Severity,
    pub message: String,
}

impl ReviewIssue {
    pub fn new(
        file: impl Into<String>,
        line: u32,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file: file.into(),
            line,
            severity,
            message: message.into(),
        }
    }
}

/// Terminal state of a review/fix loop. Stalemate and ceiling are
/// outcomes, not errors; partial progress was made.
#[derive(Debug, Clone)]
pub enum ReviewOutcome {
    Approved {
        iterations: usize,
        result: StepResult,
    },
    Stalemate {
        iterations: usize,
        outstanding: Vec<ReviewIssue>,
    },
    NeedsHuman {
        iterations: usize,
        outstanding: Vec<ReviewIssue>,
    },
}

/// Keep issues at or above `min`, in a canonical order so set comparison
/// ignores reviewer output ordering.
pub fn filter_issues(issues: Vec<ReviewIssue>, min: Severity) -> Vec<ReviewIssue> {
    let mut filtered: Vec<ReviewIssue> =
        issues.into_iter().filter(|i| i.severity >= min).collect();
    filtered.sort_by(|a, b| {
        (&a.file, a.line, a.severity, &a.message).cmp(&(&b.file, b.line, b.severity, &b.message))
    });
    filtered
}

/// Pull issues out of a reviewer result. A missing key means a clean
/// review; a present-but-malformed payload is the reviewer's failure.
pub fn parse_issues(result: &StepResult) -> Result<Vec<ReviewIssue>, CoordinatorError> {
    match result.get(ISSUES_KEY) {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            CoordinatorError::InvalidPlan(format!("unparseable reviewer issues: {}", e))
        }),
    }
}

fn enumerate_issues(issues: &[ReviewIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("- {}:{} [{:?}] {}", i.file, i.line, i.severity, i.message))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Coordinator {
    /// Alternate executor and reviewer until the filtered issue set is
    /// empty, repeats itself, or the iteration ceiling is reached.
    pub(crate) async fn run_review_iterate(
        &mut self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<ReviewOutcome, CoordinatorError> {
        let executor = self.require(AgentRole::Executor)?;
        let reviewer = self.require(AgentRole::Reviewer)?;

        let mut current = task.clone();
        let mut previous: Option<Vec<ReviewIssue>> = None;

        for iteration in 1..=self.config.max_review_iterations {
            if cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled);
            }
            self.context.set_phase("execute");
            self.maybe_compress(cancel).await;

            let result = executor
                .execute(cancel, &current, &mut self.context)
                .await
                .map_err(|e| CoordinatorError::step_failed(current.id.clone(), 1, e))?;

            self.context.set_phase("review");
            let review = reviewer
                .execute(cancel, &current, &mut self.context)
                .await
                .map_err(|e| CoordinatorError::step_failed(current.id.clone(), 1, e))?;

            let outstanding = filter_issues(parse_issues(&review)?, self.config.min_severity);
            debug!(
                iteration,
                outstanding = outstanding.len(),
                "review iteration finished"
            );

            if outstanding.is_empty() {
                info!(iterations = iteration, "review approved");
                return Ok(ReviewOutcome::Approved {
                    iterations: iteration,
                    result,
                });
            }

            if previous.as_deref() == Some(outstanding.as_slice()) {
                info!(iterations = iteration, "review stalemate");
                self.telemetry.record(
                    TelemetryEvent::new(EventKind::Stalemate, task.id.clone())
                        .with_meta("iterations", iteration.to_string()),
                );
                return Ok(ReviewOutcome::Stalemate {
                    iterations: iteration,
                    outstanding,
                });
            }

            current = task.with_instruction(format!(
                "{}\n\nAddress the outstanding review issues:\n{}",
                task.instruction,
                enumerate_issues(&outstanding)
            ));
            previous = Some(outstanding);
        }

        Ok(ReviewOutcome::NeedsHuman {
            iterations: self.config.max_review_iterations,
            outstanding: previous.unwrap_or_default(),
        })
    }
}
