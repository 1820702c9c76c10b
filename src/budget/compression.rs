//! History compression.
//!
//! Both consumers share one summarizer: the budget loop folds older
//! history into a single summary entry kept in place, and the checkpoint
//! path trims history to the keep-recent count and carries the summary
//! alongside the trimmed state. A failed summarization call is logged
//! and skipped; stale-but-present history beats losing state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{Context, Interaction, Role};
use crate::error::ModelError;
use crate::llm::{GenerateOptions, LanguageModel};

pub const DEFAULT_KEEP_RECENT: usize = 6;

pub const DEFAULT_SUMMARY_PROMPT: &str = "Summarize the following conversation for an \
agent that will continue the task. Preserve decisions made, files touched, open \
problems, and constraints. Be concise.\n<conversation_to_summarize>";

/// Summary artifact attached to a checkpoint in place of discarded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedContext {
    pub summary: String,
    /// How many interactions the summary replaced.
    pub replaced: usize,
    pub created_at: DateTime<Utc>,
}

/// Keep-recent count plus the summarization call.
#[derive(Debug, Clone)]
pub struct CompressionStrategy {
    pub keep_recent: usize,
    pub summary_prompt: String,
    pub options: GenerateOptions,
}

impl Default for CompressionStrategy {
    fn default() -> Self {
        Self {
            keep_recent: DEFAULT_KEEP_RECENT,
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            options: GenerateOptions::new().with_temperature(0.2),
        }
    }
}

impl CompressionStrategy {
    pub fn new(keep_recent: usize) -> Self {
        Self {
            keep_recent,
            ..Self::default()
        }
    }

    pub fn with_summary_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.summary_prompt = prompt.into();
        self
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    /// Index where the discarded prefix ends.
    fn split_point(&self, history_len: usize) -> usize {
        history_len.saturating_sub(self.keep_recent)
    }

    /// Summarize a slice of history through the model.
    pub async fn summarize(
        &self,
        cancel: &CancellationToken,
        model: &dyn LanguageModel,
        history: &[Interaction],
    ) -> Result<String, ModelError> {
        if history.is_empty() {
            return Ok(String::new());
        }

        let prompt = format!(
            "{}\n{}\n</conversation_to_summarize>",
            self.summary_prompt,
            format_history(history)
        );
        debug!(
            entries = history.len(),
            prompt_len = prompt.len(),
            "generating history summary"
        );

        let response = model.generate(cancel, &prompt, &self.options).await?;
        Ok(response.content)
    }

    /// Budget-pressure path: replace everything older than the keep-recent
    /// window with one summary entry left in the history.
    ///
    /// Returns `true` if the history was rewritten. Summarization failures
    /// are logged and leave the context untouched.
    pub async fn compress_in_place(
        &self,
        cancel: &CancellationToken,
        model: &dyn LanguageModel,
        context: &mut Context,
    ) -> bool {
        let cut = self.split_point(context.history().len());
        if cut == 0 {
            return false;
        }

        let summary = match self
            .summarize(cancel, model, &context.history()[..cut])
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "summarization failed, keeping history");
                return false;
            }
        };

        let entry = Interaction::new(Role::System, format!("[summary] {}", summary))
            .with_metadata("compressed.replaced", cut.to_string());
        context.history_mut().splice(..cut, [entry]);
        debug!(
            replaced = cut,
            kept = self.keep_recent,
            "history compressed in place"
        );
        true
    }

    /// Checkpoint path: trim history to the keep-recent count and return the
    /// discarded prefix as a summary artifact.
    ///
    /// Returns `Ok(None)` when there is nothing to discard. Unlike the
    /// in-place path the caller decides whether a failure is fatal.
    pub async fn compress_for_checkpoint(
        &self,
        cancel: &CancellationToken,
        model: &dyn LanguageModel,
        context: &mut Context,
    ) -> Result<Option<CompressedContext>, ModelError> {
        let cut = self.split_point(context.history().len());
        if cut == 0 {
            return Ok(None);
        }

        let summary = self
            .summarize(cancel, model, &context.history()[..cut])
            .await?;
        context.history_mut().drain(..cut);

        Ok(Some(CompressedContext {
            summary,
            replaced: cut,
            created_at: Utc::now(),
        }))
    }
}

fn format_history(history: &[Interaction]) -> String {
    history
        .iter()
        .map(|entry| {
            let role = match entry.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
                Role::Tool => "Tool",
            };
            format!("{}: {}", role, entry.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
