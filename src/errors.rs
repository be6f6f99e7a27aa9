//! Typed error hierarchy for the Mason orchestrator.
//!
//! Only lock, config, and storage failures abort a run. The per-domain,
//! per-task, and per-wave variants exist so failures can be matched in tests
//! and rendered consistently, but the orchestrators record them as data
//! (status fields and error messages) instead of propagating them.

use thiserror::Error;

/// Errors surfaced by the review and execution orchestrators.
#[derive(Debug, Error)]
pub enum MasonError {
    #[error(
        "Another mason run is in progress (pid {pid}, command '{command}', host {hostname}, started {age_secs}s ago)"
    )]
    LockHeld {
        pid: u32,
        command: String,
        hostname: String,
        age_secs: i64,
    },

    #[error("Replaced stale lock held by pid {pid} on {hostname}")]
    LockStale { pid: u32, hostname: String },

    #[error("Budget exceeded after {tokens_used} tokens (${cost:.4})")]
    BudgetExceeded { tokens_used: u64, cost: f64 },

    #[error("Analysis of domain '{domain}' failed: {message}")]
    DomainAnalysisFailed { domain: String, message: String },

    #[error("Task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("Wave {wave} blocked: upstream wave(s) {blocked_by:?} produced no successful tasks")]
    WaveBlocked { wave: u32, blocked_by: Vec<u32> },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MasonError {
    /// Wrap any storage-layer failure without losing its context chain.
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }
}

pub type MasonResult<T> = std::result::Result<T, MasonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_held_reports_holder() {
        let err = MasonError::LockHeld {
            pid: 4242,
            command: "mason review".to_string(),
            hostname: "devbox".to_string(),
            age_secs: 90,
        };
        let msg = err.to_string();
        assert!(msg.contains("4242"));
        assert!(msg.contains("mason review"));
        assert!(msg.contains("90s"));
    }

    #[test]
    fn recorded_failures_render_their_subject() {
        let domain = MasonError::DomainAnalysisFailed {
            domain: "security".into(),
            message: "timeout".into(),
        };
        let task = MasonError::TaskFailed {
            task: "1.2".into(),
            message: "exit 1".into(),
        };
        let wave = MasonError::WaveBlocked {
            wave: 2,
            blocked_by: vec![1],
        };
        let budget = MasonError::BudgetExceeded {
            tokens_used: 10,
            cost: 0.5,
        };
        assert!(domain.to_string().contains("'security'"));
        assert!(task.to_string().contains("Task 1.2 failed"));
        assert!(wave.to_string().contains("[1]"));
        assert!(budget.to_string().starts_with("Budget exceeded after 10 tokens"));
    }

    #[test]
    fn storage_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("Failed to persist checkpoint");
        let err = MasonError::storage(inner);
        let msg = err.to_string();
        assert!(msg.contains("Failed to persist checkpoint"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn config_invalid_is_matchable() {
        let err = MasonError::ConfigInvalid("limits.maxConcurrentItems must be >= 1".into());
        assert!(matches!(err, MasonError::ConfigInvalid(ref m) if m.contains("maxConcurrentItems")));
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&MasonError::LockStale {
            pid: 1,
            hostname: "h".into(),
        });
    }
}
