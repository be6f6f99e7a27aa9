//! `claude` CLI adapter for domain analysis and agent tasks.
//!
//! The prompt goes to the CLI on stdin; `--output-format json` gives back one
//! envelope with the model's text plus usage and cost.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::execution::agent::{AgentExecutor, AgentRequest, AgentResponse, SpawnRequest};
use crate::mason_config::MasonConfig;
use crate::review::findings::{Improvement, ReviewDomainResult};
use crate::review::orchestrator::{AnalysisProvider, DomainAnalysisRequest};
use crate::store::models::{Complexity, SubagentType};
use crate::util::extract_json_object;

/// Result envelope printed by `claude --print --output-format json`.
#[derive(Debug, Clone, Default, Deserialize)]
struct CliEnvelope {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    usage: CliUsage,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl CliUsage {
    fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

impl CliEnvelope {
    /// Parse CLI stdout. Plain text output is taken as the result with no usage.
    fn parse(stdout: &str) -> Self {
        serde_json::from_str(stdout.trim()).unwrap_or_else(|_| Self {
            result: stdout.to_string(),
            ..Self::default()
        })
    }
}

/// One finding as the model reports it. Scores may arrive as floats.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFinding {
    title: String,
    #[serde(default)]
    problem: String,
    #[serde(default)]
    solution: String,
    #[serde(default = "default_score")]
    impact_score: f64,
    #[serde(default = "default_score")]
    effort_score: f64,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    prd_content: Option<String>,
}

fn default_score() -> f64 {
    5.0
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    improvements: Vec<RawFinding>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSpawn {
    subagent_type: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAgentReport {
    success: bool,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    spawn_requests: Vec<RawSpawn>,
}

/// Parse the analysis JSON out of model text.
fn parse_analysis(domain: &str, text: &str) -> Result<Vec<Improvement>> {
    let json = extract_json_object(text).context("No JSON object in analysis output")?;
    let raw: RawAnalysis = serde_json::from_str(&json).context("Malformed analysis JSON")?;
    Ok(raw
        .improvements
        .into_iter()
        .filter(|f| !f.title.trim().is_empty())
        .map(|f| {
            let complexity = f
                .complexity
                .as_deref()
                .and_then(|c| c.parse::<Complexity>().ok())
                .unwrap_or_default();
            let mut imp = Improvement::new(
                f.title.trim(),
                domain,
                f.impact_score.round() as i64,
                f.effort_score.round() as i64,
            )
            .with_problem(&f.problem)
            .with_solution(&f.solution)
            .with_files(f.files)
            .with_complexity(complexity);
            if let Some(prd) = f.prd_content.filter(|p| !p.trim().is_empty()) {
                imp = imp.with_prd(&prd);
            }
            imp
        })
        .collect())
}

/// Turn an agent's final text into a response. Missing reports fall back to
/// the CLI's own error flag.
fn parse_agent_report(envelope: &CliEnvelope) -> AgentResponse {
    let report = extract_json_object(&envelope.result)
        .and_then(|json| serde_json::from_str::<RawAgentReport>(&json).ok());
    let tokens_used = envelope.usage.total();
    let cost = envelope.total_cost_usd;

    match report {
        Some(report) => AgentResponse {
            success: report.success && !envelope.is_error,
            output: if report.summary.is_empty() {
                envelope.result.clone()
            } else {
                report.summary
            },
            tokens_used,
            cost,
            spawn_requests: report
                .spawn_requests
                .into_iter()
                .map(|s| SpawnRequest {
                    subagent_type: SubagentType::from_name(&s.subagent_type),
                    prompt: s.prompt,
                })
                .collect(),
            error: report.error,
        },
        None => AgentResponse {
            success: !envelope.is_error,
            output: envelope.result.clone(),
            tokens_used,
            cost,
            spawn_requests: Vec::new(),
            error: envelope
                .is_error
                .then(|| "agent reported an error".to_string()),
        },
    }
}

fn analysis_prompt(request: &DomainAnalysisRequest) -> String {
    let mut prompt = format!(
        "You are reviewing a code repository for the '{}' domain.\n",
        request.domain.name
    );
    if let Some(stack) = &request.stack {
        prompt.push_str(&format!("The stack is: {stack}.\n"));
    }
    if let Some(context) = &request.domain.prompt_context {
        prompt.push_str(&format!("\nFocus:\n{context}\n"));
    }
    prompt.push_str("\nFiles in scope (path, bytes):\n");
    for file in &request.files {
        prompt.push_str(&format!("- {} ({})\n", file.path, file.size));
    }
    prompt.push_str(
        "\nRead the files you need and report concrete improvements. Respond with a single JSON \
         object and nothing else:\n\
         {\"improvements\": [{\"title\": \"...\", \"problem\": \"...\", \"solution\": \"...\", \
         \"impactScore\": 1-10, \"effortScore\": 1-10, \
         \"complexity\": \"low|medium|high|very_high\", \"files\": [\"path\"], \
         \"prdContent\": \"optional markdown with '## Wave N' task lists\"}]}\n",
    );
    prompt
}

fn agent_prompt(request: &AgentRequest) -> String {
    let mut prompt = format!(
        "You are acting as a {} agent for task {}.\n\n{}\n",
        request.subagent_type, request.label, request.prompt
    );
    if request.allowance.cost.is_finite() {
        prompt.push_str(&format!(
            "\nStay within about ${:.2} of spend.\n",
            request.allowance.cost
        ));
    }
    prompt.push_str(
        "\nWhen done, end your reply with one JSON object:\n\
         {\"success\": true|false, \"summary\": \"what you did\", \"error\": null, \
         \"spawnRequests\": [{\"subagentType\": \"Explore|Plan|Bash|code-reviewer|frontend-design|general-purpose\", \
         \"prompt\": \"...\"}]}\n\
         Only add spawnRequests if you need help you cannot do yourself.\n",
    );
    prompt
}

/// Runs prompts through the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    cmd: String,
    working_dir: PathBuf,
    timeout: Duration,
    skip_permissions: bool,
}

impl ClaudeCli {
    pub fn new(cmd: &str, working_dir: PathBuf) -> Self {
        Self {
            cmd: cmd.to_string(),
            working_dir,
            timeout: Duration::from_secs(600),
            skip_permissions: true,
        }
    }

    pub fn from_config(config: &MasonConfig) -> Self {
        Self::new(&config.agent_cmd(), config.project_dir.clone())
            .with_timeout(Duration::from_secs(config.file.agent.timeout_secs))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn invoke(&self, prompt: &str) -> Result<CliEnvelope> {
        let mut cmd = Command::new(&self.cmd);
        cmd.arg("--print").arg("--output-format").arg("json");
        if self.skip_permissions {
            cmd.arg("--dangerously-skip-permissions");
        }
        cmd.current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to stdin")?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("'{}' timed out after {:?}", self.cmd, self.timeout))?
            .context("Failed to wait for agent process")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "'{}' exited with code {}: {}",
                self.cmd,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        Ok(CliEnvelope::parse(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl AnalysisProvider for ClaudeCli {
    async fn analyze(&self, request: DomainAnalysisRequest) -> Result<ReviewDomainResult> {
        let domain = request.domain.name.clone();
        tracing::debug!(domain = %domain, files = request.files.len(), "invoking analysis");
        let envelope = self.invoke(&analysis_prompt(&request)).await?;
        if envelope.is_error {
            anyhow::bail!("Analysis reported an error: {}", envelope.result.trim());
        }

        let mut result = ReviewDomainResult::new(&domain)
            .with_usage(envelope.usage.total(), envelope.total_cost_usd);
        for improvement in parse_analysis(&domain, &envelope.result)? {
            result = result.add_improvement(improvement);
        }
        Ok(result)
    }
}

#[async_trait]
impl AgentExecutor for ClaudeCli {
    async fn run(&self, request: AgentRequest) -> Result<AgentResponse> {
        tracing::debug!(task = %request.label, depth = request.depth, "invoking agent");
        let envelope = self.invoke(&agent_prompt(&request)).await?;
        Ok(parse_agent_report(&envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Allowance;

    #[test]
    fn test_parse_envelope() {
        let stdout = r#"{"type":"result","is_error":false,"result":"done","total_cost_usd":0.12,
            "usage":{"input_tokens":100,"output_tokens":50,"cache_read_input_tokens":10}}"#;
        let envelope = CliEnvelope::parse(stdout);
        assert_eq!(envelope.result, "done");
        assert_eq!(envelope.usage.total(), 160);
        assert!((envelope.total_cost_usd - 0.12).abs() < 1e-9);
    }

    #[test]
    fn test_plain_text_output_is_result() {
        let envelope = CliEnvelope::parse("just some text");
        assert_eq!(envelope.result, "just some text");
        assert_eq!(envelope.usage.total(), 0);
        assert!(!envelope.is_error);
    }

    #[test]
    fn test_parse_analysis_with_surrounding_text() {
        let text = r#"Here is what I found:
{"improvements": [
  {"title": "Add rate limiting", "problem": "unbounded", "solution": "token bucket",
   "impactScore": 8.4, "effortScore": 3, "complexity": "high", "files": ["src/auth.rs"]},
  {"title": "   ", "impactScore": 5, "effortScore": 5}
]}
Thanks."#;
        let found = parse_analysis("security", text).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].domain, "security");
        assert_eq!(found[0].impact_score, 8);
        assert_eq!(found[0].complexity, Complexity::High);
        assert_eq!(found[0].files, vec!["src/auth.rs"]);
    }

    #[test]
    fn test_parse_analysis_without_json_fails() {
        assert!(parse_analysis("security", "nothing to report").is_err());
    }

    #[test]
    fn test_agent_report_with_spawns() {
        let envelope = CliEnvelope {
            result: r#"Work done.
{"success": true, "summary": "added limiter",
 "spawnRequests": [{"subagentType": "code-reviewer", "prompt": "review it"},
                   {"subagentType": "mystery", "prompt": "?"}]}"#
                .to_string(),
            total_cost_usd: 0.5,
            usage: CliUsage {
                input_tokens: 10,
                output_tokens: 5,
                ..CliUsage::default()
            },
            ..CliEnvelope::default()
        };
        let response = parse_agent_report(&envelope);
        assert!(response.success);
        assert_eq!(response.output, "added limiter");
        assert_eq!(response.tokens_used, 15);
        assert_eq!(response.spawn_requests.len(), 2);
        assert_eq!(response.spawn_requests[0].subagent_type, SubagentType::CodeReviewer);
        assert_eq!(response.spawn_requests[1].subagent_type, SubagentType::GeneralPurpose);
    }

    #[test]
    fn test_agent_without_report_uses_error_flag() {
        let envelope = CliEnvelope {
            result: "crashed".to_string(),
            is_error: true,
            ..CliEnvelope::default()
        };
        let response = parse_agent_report(&envelope);
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[test]
    fn test_agent_prompt_mentions_role_and_allowance() {
        let request = AgentRequest {
            label: "2.1".to_string(),
            subagent_type: SubagentType::Explore,
            prompt: "map the auth module".to_string(),
            depth: 0,
            allowance: Allowance {
                tokens: 1000,
                cost: 1.5,
            },
        };
        let prompt = agent_prompt(&request);
        assert!(prompt.contains("Explore agent for task 2.1"));
        assert!(prompt.contains("$1.50"));
        assert!(prompt.contains("spawnRequests"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_reads_stdout_of_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-claude");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\nprintf '%s\\n' '{\"result\":\"{\\\"success\\\": true}\",\"total_cost_usd\":0.01,\"usage\":{\"input_tokens\":3}}'\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cli = ClaudeCli::new(script.to_str().unwrap(), dir.path().to_path_buf());
        let response = cli
            .run(AgentRequest {
                label: "1.1".to_string(),
                subagent_type: SubagentType::Bash,
                prompt: "echo".to_string(),
                depth: 0,
                allowance: Allowance::unlimited(),
            })
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.tokens_used, 3);
    }
}
