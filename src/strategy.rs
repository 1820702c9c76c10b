//! Context strategies.
//!
//! A strategy decides how much material a node preloads before a model
//! call and whether a compression pass is worthwhile once the budget
//! reports pressure. Strategies never mutate the context themselves.

use crate::context::Context;

/// Pluggable preload/compression policy.
pub trait ContextStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// How many items (interactions, files) a node should preload.
    fn preload_limit(&self) -> usize;

    /// Whether a compression pass is worthwhile right now. Consulted only
    /// after the budget has already reported pressure.
    fn should_compress(&self, context: &Context) -> bool;
}

/// Compresses early and preloads little. Suited to long runs where the
/// window must stay lean.
#[derive(Debug, Clone)]
pub struct AggressiveStrategy {
    pub preload_limit: usize,
    pub compress_after: usize,
}

impl Default for AggressiveStrategy {
    fn default() -> Self {
        Self {
            preload_limit: 4,
            compress_after: 8,
        }
    }
}

impl ContextStrategy for AggressiveStrategy {
    fn name(&self) -> &str {
        "aggressive"
    }

    fn preload_limit(&self) -> usize {
        self.preload_limit
    }

    fn should_compress(&self, context: &Context) -> bool {
        context.history().len() > self.compress_after
    }
}

/// Preloads generously and compresses only when history is long. Suited
/// to short tasks where losing detail costs more than tokens.
#[derive(Debug, Clone)]
pub struct ConservativeStrategy {
    pub preload_limit: usize,
    pub compress_after: usize,
}

impl Default for ConservativeStrategy {
    fn default() -> Self {
        Self {
            preload_limit: 16,
            compress_after: 40,
        }
    }
}

impl ContextStrategy for ConservativeStrategy {
    fn name(&self) -> &str {
        "conservative"
    }

    fn preload_limit(&self) -> usize {
        self.preload_limit
    }

    fn should_compress(&self, context: &Context) -> bool {
        context.history().len() > self.compress_after
    }
}

/// Interpolates between the two by phase: exploratory phases keep detail,
/// later phases compress like the aggressive policy.
#[derive(Debug, Clone)]
pub struct AdaptiveStrategy {
    pub preload_limit: usize,
    pub explore_compress_after: usize,
    pub settled_compress_after: usize,
    /// Phase labels treated as exploratory.
    pub explore_phases: Vec<String>,
}

impl Default for AdaptiveStrategy {
    fn default() -> Self {
        Self {
            preload_limit: 8,
            explore_compress_after: 32,
            settled_compress_after: 10,
            explore_phases: vec!["explore".to_string(), "planning".to_string()],
        }
    }
}

impl ContextStrategy for AdaptiveStrategy {
    fn name(&self) -> &str {
        "adaptive"
    }

    fn preload_limit(&self) -> usize {
        self.preload_limit
    }

    fn should_compress(&self, context: &Context) -> bool {
        let threshold = if self.explore_phases.iter().any(|p| p == &context.phase) {
            self.explore_compress_after
        } else {
            self.settled_compress_after
        };
        context.history().len() > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Interaction;

    static_assertions::assert_obj_safe!(ContextStrategy);

    fn context_with_history(n: usize, phase: &str) -> Context {
        let mut ctx = Context::new();
        ctx.set_phase(phase);
        for i in 0..n {
            ctx.record(Interaction::user(format!("turn {}", i)));
        }
        ctx
    }

    #[test]
    fn test_aggressive_compresses_before_conservative() {
        let ctx = context_with_history(12, "work");
        assert!(AggressiveStrategy::default().should_compress(&ctx));
        assert!(!ConservativeStrategy::default().should_compress(&ctx));
    }

    #[test]
    fn test_adaptive_follows_phase() {
        let strategy = AdaptiveStrategy::default();

        let exploring = context_with_history(20, "explore");
        assert!(!strategy.should_compress(&exploring));

        let settled = context_with_history(20, "review");
        assert!(strategy.should_compress(&settled));
    }

    #[test]
    fn test_preload_limits_ordered() {
        assert!(
            AggressiveStrategy::default().preload_limit()
                < ConservativeStrategy::default().preload_limit()
        );
    }
}
