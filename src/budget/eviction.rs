//! Critical-pressure eviction.
//!
//! When compression alone cannot get usage under the ceiling, the manager
//! drops keyed values outright. Pinned prefixes are never touched; among
//! the rest, lowest priority goes first and larger items go before
//! smaller ones at the same priority.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::budget::tokens::TokenCounter;
use crate::context::Context;

pub const DEFAULT_PRIORITY: u8 = 5;

/// Eviction policy over keyed context values.
#[derive(Clone)]
pub struct ContextManager {
    counter: Arc<dyn TokenCounter>,
    pinned_prefixes: Vec<String>,
    /// Prefix to priority, 0 lowest. First matching prefix wins.
    priorities: Vec<(String, u8)>,
}

impl ContextManager {
    pub fn new(counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            counter,
            pinned_prefixes: Vec::new(),
            priorities: Vec::new(),
        }
    }

    /// Keys under this prefix survive every eviction pass.
    pub fn pin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.pinned_prefixes.push(prefix.into());
        self
    }

    pub fn with_priority(mut self, prefix: impl Into<String>, priority: u8) -> Self {
        self.priorities.push((prefix.into(), priority));
        self
    }

    fn is_pinned(&self, key: &str) -> bool {
        self.pinned_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    fn priority_of(&self, key: &str) -> u8 {
        self.priorities
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, priority)| *priority)
            .unwrap_or(DEFAULT_PRIORITY)
    }

    /// Estimated token cost of the keyed values alone.
    pub fn value_usage(&self, context: &Context) -> usize {
        context
            .keys()
            .filter_map(|key| context.get(key).map(|v| self.counter.count_value(v)))
            .sum()
    }

    /// Evict non-pinned values until the keyed-value usage estimate drops to
    /// `target_tokens` or nothing evictable remains. Returns evicted keys.
    pub fn evict_to(&self, context: &mut Context, target_tokens: usize) -> Vec<String> {
        let mut usage = self.value_usage(context);
        if usage <= target_tokens {
            return Vec::new();
        }

        // (priority asc, size desc)
        let mut candidates: Vec<(u8, usize, String)> = context
            .keys()
            .filter(|key| !self.is_pinned(key))
            .map(|key| {
                let size = context.get(key).map_or(0, |v| self.counter.count_value(v));
                (self.priority_of(key), size, key.clone())
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

        let mut evicted = Vec::new();
        for (priority, size, key) in candidates {
            if usage <= target_tokens {
                break;
            }
            context.remove(&key);
            usage = usage.saturating_sub(size);
            debug!(key = %key, priority, tokens = size, "evicted context value");
            evicted.push(key);
        }

        if usage > target_tokens {
            warn!(
                usage,
                target = target_tokens,
                "eviction exhausted, only pinned values remain"
            );
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::tokens::ApproxTokenCounter;

    fn manager() -> ContextManager {
        ContextManager::new(Arc::new(ApproxTokenCounter::new(1.0, 0)))
            .pin_prefix("task.")
            .with_priority("scratch.", 0)
            .with_priority("plan.", 9)
    }

    #[test]
    fn test_evicts_lowest_priority_largest_first() {
        let mut ctx = Context::new();
        ctx.set("scratch.big", "x".repeat(100));
        ctx.set("scratch.small", "x".repeat(10));
        ctx.set("plan.current", "x".repeat(100));

        let evicted = manager().evict_to(&mut ctx, 120);
        assert_eq!(evicted, vec!["scratch.big".to_string()]);
        assert!(ctx.contains_key("plan.current"));
        assert!(ctx.contains_key("scratch.small"));
    }

    #[test]
    fn test_pinned_values_survive() {
        let mut ctx = Context::new();
        ctx.set("task.instruction", "x".repeat(200));
        ctx.set("scratch.notes", "x".repeat(50));

        let evicted = manager().evict_to(&mut ctx, 0);
        assert_eq!(evicted, vec!["scratch.notes".to_string()]);
        assert!(ctx.contains_key("task.instruction"));
    }

    #[test]
    fn test_noop_when_under_target() {
        let mut ctx = Context::new();
        ctx.set("scratch.notes", "tiny");

        assert!(manager().evict_to(&mut ctx, 1000).is_empty());
        assert!(ctx.contains_key("scratch.notes"));
    }
}
