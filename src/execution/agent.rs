//! Agent dispatch seam and bounded nested agent calls.
//!
//! Every task goes through one [`AgentExecutor::run`] regardless of its
//! [`SubagentType`]. An agent may ask for nested calls (the `Task` tool); those
//! are run through the same executor with an explicit depth counter, a shared
//! fan-out counter, and an [`Allowance`] carved from the parent's remainder.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::budget::Allowance;
pub use crate::store::models::SubagentType;

/// A nested call an agent asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub subagent_type: SubagentType,
    pub prompt: String,
}

/// One call into an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    /// `wave.task` label of the top-level task, with `/n` appended per nesting level.
    pub label: String,
    pub subagent_type: SubagentType,
    pub prompt: String,
    /// 0 for the top-level task.
    pub depth: u32,
    pub allowance: Allowance,
}

/// What an agent call reported.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub spawn_requests: Vec<SpawnRequest>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Runs a single agent call.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse>;
}

/// Recursion caps for nested calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentLimits {
    pub max_depth: u32,
    pub max_fan_out: u32,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_fan_out: 8,
        }
    }
}

/// Rolled-up result of a top-level call and all its nested calls.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentOutcome {
    pub success: bool,
    pub output: String,
    pub tokens_used: u64,
    pub cost: f64,
    pub error: Option<String>,
    /// Nested calls that ran.
    pub spawned: u32,
    /// Human-readable reasons for refused spawn requests.
    pub refused: Vec<String>,
}

/// Run a top-level agent call, following spawn requests within `limits`.
///
/// Refused spawns and nested failures are recorded in the output; they never
/// fail the top-level call. Only the top-level call's own error propagates.
pub async fn run_agent(
    executor: &dyn AgentExecutor,
    request: AgentRequest,
    limits: AgentLimits,
) -> Result<AgentOutcome> {
    let fan_out = AtomicU32::new(0);
    let mut outcome = run_nested(executor, request, limits, &fan_out).await?;
    if !outcome.refused.is_empty() {
        outcome.output.push_str("\n\n[refused nested calls]\n");
        for reason in &outcome.refused {
            outcome.output.push_str("- ");
            outcome.output.push_str(reason);
            outcome.output.push('\n');
        }
    }
    Ok(outcome)
}

fn run_nested<'a>(
    executor: &'a dyn AgentExecutor,
    request: AgentRequest,
    limits: AgentLimits,
    fan_out: &'a AtomicU32,
) -> Pin<Box<dyn Future<Output = Result<AgentOutcome>> + Send + 'a>> {
    Box::pin(async move {
        let depth = request.depth;
        let label = request.label.clone();
        let allowance = request.allowance;

        let response = executor.run(request).await?;
        let mut outcome = AgentOutcome {
            success: response.success,
            output: response.output,
            tokens_used: response.tokens_used,
            cost: response.cost,
            error: response.error,
            spawned: 0,
            refused: Vec::new(),
        };

        let pending = response.spawn_requests.len();
        for (i, spawn) in response.spawn_requests.into_iter().enumerate() {
            let child_label = format!("{}/{}", label, i + 1);
            let remaining = allowance.after(outcome.tokens_used, outcome.cost);

            if depth + 1 > limits.max_depth {
                outcome.refused.push(format!(
                    "{child_label} ({}): depth limit {} reached",
                    spawn.subagent_type, limits.max_depth
                ));
                continue;
            }
            if remaining.is_exhausted() {
                outcome.refused.push(format!(
                    "{child_label} ({}): allowance exhausted",
                    spawn.subagent_type
                ));
                continue;
            }
            if fan_out.fetch_add(1, Ordering::SeqCst) >= limits.max_fan_out {
                outcome.refused.push(format!(
                    "{child_label} ({}): fan-out limit {} reached",
                    spawn.subagent_type, limits.max_fan_out
                ));
                continue;
            }

            // Split what is left evenly across the requests still to run.
            let share = 1.0 / (pending - i) as f64;
            let child = AgentRequest {
                label: child_label.clone(),
                subagent_type: spawn.subagent_type,
                prompt: spawn.prompt,
                depth: depth + 1,
                allowance: remaining.carve(share),
            };

            tracing::debug!(label = %child_label, depth = depth + 1, "running nested agent call");
            outcome.spawned += 1;
            match run_nested(executor, child, limits, fan_out).await {
                Ok(child_outcome) => {
                    outcome.tokens_used += child_outcome.tokens_used;
                    outcome.cost += child_outcome.cost;
                    outcome.spawned += child_outcome.spawned;
                    outcome.refused.extend(child_outcome.refused);
                    let status = if child_outcome.success { "ok" } else { "failed" };
                    outcome.output.push_str(&format!(
                        "\n\n[{child_label} {} {status}]\n{}",
                        spawn.subagent_type, child_outcome.output
                    ));
                }
                Err(e) => {
                    outcome
                        .output
                        .push_str(&format!("\n\n[{child_label} error] {e:#}"));
                }
            }
        }

        Ok(outcome)
    })
}
