//! Context budget accounting.
//!
//! The budget tracks three reserved pools: system prompt, tool schemas,
//! and free context (history plus keyed values). Callers recompute usage
//! before each model call; nothing here runs automatically.

pub mod compression;
pub mod eviction;
pub mod tokens;

pub use compression::{CompressedContext, CompressionStrategy, DEFAULT_SUMMARY_PROMPT};
pub use eviction::ContextManager;
pub use tokens::{ApproxTokenCounter, TokenCounter};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::Context;
use crate::llm::ToolSpec;

/// How close current usage is to the free-context ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pressure {
    Ok,
    NeedsCompression,
    Critical,
}

/// Reserved pool sizes and pressure thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Tokens reserved for the system prompt.
    pub system_prompt_tokens: usize,
    /// Tokens reserved for tool schemas.
    pub tool_schema_tokens: usize,
    /// Ceiling for history plus keyed values.
    pub free_context_tokens: usize,
    /// Fraction of the free pool at which compression is requested.
    pub compression_threshold: f32,
    /// Fraction of the free pool at which eviction is requested.
    pub critical_threshold: f32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            system_prompt_tokens: 2_000,
            tool_schema_tokens: 4_000,
            free_context_tokens: 96_000,
            compression_threshold: 0.75,
            critical_threshold: 0.92,
        }
    }
}

impl BudgetConfig {
    pub fn with_free_context_tokens(mut self, tokens: usize) -> Self {
        self.free_context_tokens = tokens;
        self
    }

    pub fn with_compression_threshold(mut self, fraction: f32) -> Self {
        self.compression_threshold = fraction;
        self
    }

    pub fn with_critical_threshold(mut self, fraction: f32) -> Self {
        self.critical_threshold = fraction;
        self
    }
}

/// One measurement of pool consumption.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub history_tokens: usize,
    pub value_tokens: usize,
    pub tool_tokens: usize,
}

impl BudgetUsage {
    /// Consumption charged against the free-context pool.
    pub fn free_used(&self) -> usize {
        self.history_tokens + self.value_tokens
    }
}

/// Caller-driven usage meter.
pub struct ContextBudget {
    config: BudgetConfig,
    counter: Arc<dyn TokenCounter>,
    last: BudgetUsage,
}

impl ContextBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self::with_counter(config, Arc::new(ApproxTokenCounter::default()))
    }

    pub fn with_counter(config: BudgetConfig, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            config,
            counter,
            last: BudgetUsage::default(),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn last_usage(&self) -> BudgetUsage {
        self.last
    }

    /// Token ceiling eviction should aim for, below the compression line so
    /// one pass buys real headroom.
    pub fn eviction_target(&self) -> usize {
        (self.config.free_context_tokens as f32 * self.config.compression_threshold * 0.5) as usize
    }

    /// Recompute consumption and classify pressure. Callers run this before
    /// every model call.
    pub fn update_usage(&mut self, context: &Context, active_tools: &[ToolSpec]) -> Pressure {
        let history_tokens = self.counter.count_history(context.history());
        let value_tokens = context
            .keys()
            .filter_map(|key| context.get(key).map(|v| self.counter.count_value(v)))
            .sum();
        let tool_tokens = active_tools
            .iter()
            .map(|spec| {
                self.counter.count_text(&spec.name)
                    + self.counter.count_text(&spec.description)
                    + self.counter.count_value(&spec.parameters)
            })
            .sum();

        self.last = BudgetUsage {
            history_tokens,
            value_tokens,
            tool_tokens,
        };

        if tool_tokens > self.config.tool_schema_tokens {
            warn!(
                tool_tokens,
                reserved = self.config.tool_schema_tokens,
                "tool schemas exceed their reserved pool"
            );
        }

        let ratio = self.last.free_used() as f32 / self.config.free_context_tokens.max(1) as f32;
        if ratio >= self.config.critical_threshold {
            Pressure::Critical
        } else if ratio >= self.config.compression_threshold {
            Pressure::NeedsCompression
        } else {
            Pressure::Ok
        }
    }
}
