//! Token, cost, and file ceilings for a single review or execution run.

use serde::{Deserialize, Serialize};

use crate::mason_config::LimitsConfig;

/// Ceilings applied to one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub max_tokens: u64,
    pub max_cost: f64,
    pub max_files: usize,
    pub max_file_size: u64,
    pub warn_at_cost: f64,
}

impl BudgetLimits {
    /// Ceilings for a review run.
    pub fn for_review(limits: &LimitsConfig) -> Self {
        Self {
            max_tokens: limits.max_tokens_per_review,
            max_cost: limits.max_cost_per_review,
            max_files: limits.max_files_per_analysis,
            max_file_size: limits.max_file_size,
            warn_at_cost: limits.warn_at_cost,
        }
    }

    /// Ceilings for an execution run. Only cost is bounded.
    pub fn for_execution(limits: &LimitsConfig) -> Self {
        Self {
            max_tokens: u64::MAX,
            max_cost: limits.execution_cost_ceiling(),
            max_files: usize::MAX,
            max_file_size: limits.max_file_size,
            warn_at_cost: limits.warn_at_cost.min(limits.execution_cost_ceiling()),
        }
    }
}

/// Result of charging usage against the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeOutcome {
    Ok,
    /// `warnAtCost` was crossed by this charge.
    Warn,
    Exceeded,
}

/// Remaining spend handed to a provider or agent call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Allowance {
    pub tokens: u64,
    pub cost: f64,
}

impl Allowance {
    pub fn unlimited() -> Self {
        Self {
            tokens: u64::MAX,
            cost: f64::INFINITY,
        }
    }

    /// A child allowance holding `fraction` of this one.
    pub fn carve(&self, fraction: f64) -> Allowance {
        let fraction = fraction.clamp(0.0, 1.0);
        let tokens = if self.tokens == u64::MAX {
            u64::MAX
        } else {
            (self.tokens as f64 * fraction).floor() as u64
        };
        Allowance {
            tokens,
            cost: self.cost * fraction,
        }
    }

    /// The allowance left after spending `tokens` and `cost`.
    pub fn after(&self, tokens: u64, cost: f64) -> Allowance {
        Allowance {
            tokens: self.tokens.saturating_sub(tokens),
            cost: (self.cost - cost).max(0.0),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.tokens == 0 || self.cost <= 0.0
    }
}

/// Running totals against a set of `BudgetLimits`.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    limits: BudgetLimits,
    tokens_used: u64,
    cost: f64,
    files_used: usize,
    warned: bool,
}

impl BudgetTracker {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            tokens_used: 0,
            cost: 0.0,
            files_used: 0,
            warned: false,
        }
    }

    /// Start from usage already recorded (e.g. a resumed checkpoint).
    pub fn with_spent(mut self, tokens: u64, cost: f64) -> Self {
        self.tokens_used = tokens;
        self.cost = cost;
        self.warned = cost >= self.limits.warn_at_cost;
        self
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Record usage. Crossing `warnAtCost` is reported once.
    pub fn charge(&mut self, tokens: u64, cost: f64) -> ChargeOutcome {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        self.cost += cost.max(0.0);

        if self.is_exceeded() {
            tracing::warn!(
                tokens_used = self.tokens_used,
                cost = self.cost,
                "budget exceeded"
            );
            return ChargeOutcome::Exceeded;
        }
        if !self.warned && self.cost >= self.limits.warn_at_cost {
            self.warned = true;
            tracing::warn!(
                cost = self.cost,
                warn_at_cost = self.limits.warn_at_cost,
                "cost warning threshold crossed"
            );
            return ChargeOutcome::Warn;
        }
        ChargeOutcome::Ok
    }

    /// Whether any ceiling has been reached.
    pub fn is_exceeded(&self) -> bool {
        self.tokens_used >= self.limits.max_tokens || self.cost >= self.limits.max_cost
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.limits.max_tokens.saturating_sub(self.tokens_used)
    }

    pub fn remaining_cost(&self) -> f64 {
        (self.limits.max_cost - self.cost).max(0.0)
    }

    pub fn remaining_files(&self) -> usize {
        self.limits.max_files.saturating_sub(self.files_used)
    }

    /// Take up to `n` files from the per-analysis file allowance; returns how many fit.
    pub fn reserve_files(&mut self, n: usize) -> usize {
        let granted = n.min(self.remaining_files());
        self.files_used += granted;
        granted
    }

    /// Reset the per-analysis file allowance (one allowance per domain).
    pub fn reset_files(&mut self) {
        self.files_used = 0;
    }

    /// Snapshot of what is left.
    pub fn allowance(&self) -> Allowance {
        Allowance {
            tokens: self.remaining_tokens(),
            cost: self.remaining_cost(),
        }
    }
}
