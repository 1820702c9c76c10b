//! Shared execution state for one task run.
//!
//! A [`Context`] is the bag of keyed values, interaction history, and phase
//! label that every node, agent, and scheduler round reads and writes. Keys
//! are namespaced with dotted prefixes (`"react.decision"`,
//! `"plan.current_step"`) so components never collide.
//!
//! Lifecycle: created per task, **branched** before any concurrent
//! sub-execution, **merged** back (last-writer-wins per key, histories
//! appended) when a branch completes, and **snapshotted** before risky
//! operations so a rollback can restore prior state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of an interaction in the history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One timestamped entry in the interaction history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Interaction {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Running token counters for the task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Watermark recorded when a branch is created, so a merge only carries
/// the history and usage accumulated *inside* the branch.
#[derive(Debug, Clone, Copy)]
struct BranchBase {
    history_len: usize,
    usage: TokenUsage,
}

/// Shared execution state for one task run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    values: HashMap<String, Value>,
    history: Vec<Interaction>,
    pub phase: String,
    pub usage: TokenUsage,
    #[serde(skip)]
    branch_base: Option<BranchBase>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a keyed value. Keys should carry a dotted namespace prefix.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Set a keyed value from any serializable type.
    pub fn set_json<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed read of a keyed value. Returns `None` on missing key or shape
    /// mismatch.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn record(&mut self, interaction: Interaction) {
        self.history.push(interaction);
    }

    pub fn history(&self) -> &[Interaction] {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut Vec<Interaction> {
        &mut self.history
    }

    pub fn set_phase(&mut self, phase: impl Into<String>) {
        self.phase = phase.into();
    }

    /// Deep copy for a concurrent branch. The branch records a watermark so
    /// [`Context::merge_branch`] only folds in what the branch added.
    pub fn branch(&self) -> Context {
        let mut child = self.clone();
        child.branch_base = Some(BranchBase {
            history_len: self.history.len(),
            usage: self.usage,
        });
        child
    }

    /// Fold a completed branch back into this context.
    ///
    /// Values apply last-writer-wins per key; the branch's new history
    /// entries are appended in order; usage deltas accumulate; the branch's
    /// phase label wins.
    pub fn merge_branch(&mut self, mut branch: Context) {
        let base = branch.branch_base.take().unwrap_or(BranchBase {
            history_len: 0,
            usage: TokenUsage::default(),
        });

        for (key, value) in branch.values {
            self.values.insert(key, value);
        }

        let start = base.history_len.min(branch.history.len());
        self.history.extend(branch.history.drain(start..));

        self.usage.add(TokenUsage {
            input_tokens: branch.usage.input_tokens.saturating_sub(base.usage.input_tokens),
            output_tokens: branch
                .usage
                .output_tokens
                .saturating_sub(base.usage.output_tokens),
        });

        self.phase = branch.phase;
    }

    /// Immutable point-in-time copy, taken before a risky operation.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot(self.clone())
    }

    /// Roll back to a previously taken snapshot.
    pub fn restore(&mut self, snapshot: ContextSnapshot) {
        *self = snapshot.0;
    }
}

/// Opaque rollback point produced by [`Context::snapshot`].
#[derive(Debug, Clone)]
pub struct ContextSnapshot(Context);

/// Outcome of one unit of work (a graph node or a plan step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Identifier of the producing node or step.
    pub node_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn success(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            success: true,
            data: HashMap::new(),
            error: None,
        }
    }

    pub fn failure(node_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            success: false,
            data: HashMap::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}
