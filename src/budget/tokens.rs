//! Token estimation.
//!
//! Usage accounting runs before every model call, so counting must be
//! cheap. The approximate counter divides character length by a tuned
//! ratio and charges a flat per-entry overhead for role and framing
//! tokens.

use serde_json::Value;

use crate::context::Interaction;

pub const DEFAULT_CHARS_PER_TOKEN: f32 = 4.0;
pub const DEFAULT_OVERHEAD_PER_ENTRY: usize = 3;

pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    fn count_interaction(&self, interaction: &Interaction) -> usize;

    fn count_history(&self, history: &[Interaction]) -> usize {
        history.iter().map(|i| self.count_interaction(i)).sum()
    }

    /// Cost of a keyed value as it would render into a prompt.
    fn count_value(&self, value: &Value) -> usize {
        match value {
            Value::String(s) => self.count_text(s),
            other => self.count_text(&other.to_string()),
        }
    }
}

/// Character-ratio estimator. Fast and provider-agnostic; accuracy is
/// within the slack the pressure thresholds already carry.
#[derive(Debug, Clone)]
pub struct ApproxTokenCounter {
    pub chars_per_token: f32,
    pub overhead_per_entry: usize,
}

impl ApproxTokenCounter {
    pub fn new(chars_per_token: f32, overhead_per_entry: usize) -> Self {
        Self {
            chars_per_token,
            overhead_per_entry,
        }
    }
}

impl Default for ApproxTokenCounter {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            overhead_per_entry: DEFAULT_OVERHEAD_PER_ENTRY,
        }
    }
}

impl TokenCounter for ApproxTokenCounter {
    fn count_text(&self, text: &str) -> usize {
        (text.len() as f32 / self.chars_per_token).ceil() as usize
    }

    fn count_interaction(&self, interaction: &Interaction) -> usize {
        let mut tokens = self.count_text(&interaction.content) + self.overhead_per_entry;
        for (key, value) in &interaction.metadata {
            tokens += self.count_text(key) + self.count_text(value);
        }
        tokens
    }
}
