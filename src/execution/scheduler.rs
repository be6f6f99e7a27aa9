//! Execution run scheduler.
//!
//! Waves run strictly in order; tasks inside a wave run concurrently, bounded
//! by a semaphore of `maxConcurrentItems` permits. Every task and run status
//! change is written through [`RunStore`] before the next scheduling step.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::agent::{AgentExecutor, AgentLimits, AgentRequest, run_agent};
use super::planner::ExecutionPlan;
use crate::budget::{BudgetLimits, BudgetTracker, ChargeOutcome};
use crate::errors::{MasonError, MasonResult};
use crate::mason_config::MasonConfigFile;
use crate::store::models::{
    BacklogItem, ExecutionRun, ExecutionTask, ItemStatus, RunStatus, SubagentType, TaskStatus,
};
use crate::store::{BacklogStore, RunStore};
use crate::util::sanitize_branch_name;

/// Where git stood before the run touched anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPoint {
    pub original_head: String,
    pub backup_branch: String,
}

/// Branch and pull-request operations used by a run.
#[async_trait]
pub trait GitCollaborator: Send + Sync {
    /// Record HEAD, create a backup branch at it, and switch to `work_branch`.
    async fn prepare_run(&self, work_branch: &str) -> Result<RollbackPoint>;

    /// Open a pull request for `work_branch` and return its URL.
    async fn open_pull_request(&self, work_branch: &str, title: &str, body: &str)
    -> Result<String>;
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: String,
        total_waves: u32,
        task_count: usize,
    },
    WaveStarted {
        wave: u32,
        tasks: usize,
    },
    TaskStarted {
        wave: u32,
        task_number: u32,
        item_id: i64,
        subagent_type: SubagentType,
    },
    TaskFinished {
        wave: u32,
        task_number: u32,
        item_id: i64,
        status: TaskStatus,
        tokens_used: u64,
        cost: f64,
    },
    WaveCompleted {
        wave: u32,
        success_count: usize,
        failed_count: usize,
        skipped_count: usize,
    },
    RunCompleted {
        summary: Box<RunSummary>,
    },
}

/// Per-item outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub item_id: i64,
    pub status: ItemStatus,
    pub completed_tasks: usize,
    pub total_tasks: usize,
}

/// Terminal summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub pr_url: Option<String>,
    pub item_results: Vec<ItemResult>,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub tokens_used: u64,
    pub cost: f64,
    pub branch_name: Option<String>,
    pub original_head: Option<String>,
    pub backup_branch: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_task_attempts: u32,
    pub cost_ceiling: f64,
    pub warn_at_cost: f64,
    pub agent_limits: AgentLimits,
    pub validation_steps: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&MasonConfigFile::default())
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &MasonConfigFile) -> Self {
        let limits = &config.limits;
        Self {
            max_concurrent: limits.max_concurrent_items.max(1),
            max_task_attempts: limits.max_task_attempts.max(1),
            cost_ceiling: limits.execution_cost_ceiling(),
            warn_at_cost: limits.warn_at_cost,
            agent_limits: AgentLimits {
                max_depth: limits.max_agent_depth,
                max_fan_out: limits.max_agent_fan_out,
            },
            validation_steps: config
                .validation
                .enabled_steps()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_cost_ceiling(mut self, ceiling: f64) -> Self {
        self.cost_ceiling = ceiling;
        self
    }

    pub fn with_max_task_attempts(mut self, attempts: u32) -> Self {
        self.max_task_attempts = attempts.max(1);
        self
    }

    fn budget_limits(&self) -> BudgetLimits {
        BudgetLimits {
            max_tokens: u64::MAX,
            max_cost: self.cost_ceiling,
            max_files: usize::MAX,
            max_file_size: u64::MAX,
            warn_at_cost: self.warn_at_cost.min(self.cost_ceiling),
        }
    }
}

/// Shared state handed to every spawned task.
#[derive(Clone)]
struct TaskContext {
    executor: Arc<dyn AgentExecutor>,
    runs: Arc<dyn RunStore>,
    budget: Arc<Mutex<BudgetTracker>>,
    event_tx: Option<mpsc::Sender<ExecutionEvent>>,
    cancel: CancellationToken,
    limits: AgentLimits,
    max_attempts: u32,
}

impl TaskContext {
    async fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.event_tx {
            tx.send(event).await.ok();
        }
    }

    async fn persist(&self, task: &mut ExecutionTask) -> MasonResult<()> {
        task.updated_at = Utc::now();
        self.runs.upsert_task(task).await.map_err(MasonError::storage)
    }

    /// Why a not-yet-started task must be skipped, if it must.
    async fn stop_reason(&self) -> Option<&'static str> {
        if self.cancel.is_cancelled() {
            Some("run cancelled")
        } else if self.budget.lock().await.is_exceeded() {
            Some("execution cost ceiling reached")
        } else {
            None
        }
    }
}

/// Runs an [`ExecutionPlan`] to a terminal status.
pub struct ExecutionScheduler {
    executor: Arc<dyn AgentExecutor>,
    runs: Arc<dyn RunStore>,
    backlog: Arc<dyn BacklogStore>,
    git: Arc<dyn GitCollaborator>,
    config: SchedulerConfig,
    event_tx: Option<mpsc::Sender<ExecutionEvent>>,
    cancel: CancellationToken,
}

impl ExecutionScheduler {
    pub fn new(
        executor: Arc<dyn AgentExecutor>,
        runs: Arc<dyn RunStore>,
        backlog: Arc<dyn BacklogStore>,
        git: Arc<dyn GitCollaborator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            runs,
            backlog,
            git,
            config,
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set an event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ExecutionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Stop scheduling new tasks when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    async fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.event_tx {
            tx.send(event).await.ok();
        }
    }

    async fn save_run(&self, run: &mut ExecutionRun) -> MasonResult<()> {
        run.updated_at = Utc::now();
        self.runs.update_run(run).await.map_err(MasonError::storage)
    }

    async fn skip_tasks(&self, tasks: &mut [ExecutionTask], reason: &str) -> MasonResult<()> {
        for task in tasks.iter_mut().filter(|t| t.status == TaskStatus::Pending) {
            task.status = TaskStatus::Skipped;
            task.error_message = Some(reason.to_string());
            task.completed_at = Some(Utc::now());
            task.updated_at = Utc::now();
            self.runs.upsert_task(task).await.map_err(MasonError::storage)?;
        }
        Ok(())
    }

    /// Execute `plan` for `items`. Only storage failures return `Err`.
    pub async fn execute(
        &self,
        items: Vec<BacklogItem>,
        plan: ExecutionPlan,
    ) -> MasonResult<RunSummary> {
        let item_ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        let items_by_id: HashMap<i64, BacklogItem> =
            items.into_iter().map(|i| (i.id, i)).collect();

        let mut run = ExecutionRun::new(item_ids.clone(), plan.total_waves);
        run.branch_name = Some(work_branch_name(&run.id, &item_ids, &items_by_id));
        self.runs
            .create_run(&run)
            .await
            .map_err(MasonError::storage)?;

        let mut waves: BTreeMap<u32, Vec<ExecutionTask>> = BTreeMap::new();
        for wave in &plan.waves {
            let tasks = waves.entry(wave.wave).or_default();
            for planned in &wave.tasks {
                let task = ExecutionTask::new(
                    &run.id,
                    planned.item_id,
                    wave.wave,
                    planned.task_number,
                    planned.subagent_type,
                    &planned.description,
                );
                self.runs
                    .upsert_task(&task)
                    .await
                    .map_err(MasonError::storage)?;
                tasks.push(task);
            }
        }

        tracing::info!(run_id = %run.id, waves = plan.total_waves, tasks = plan.task_count(), "execution run created");
        self.emit(ExecutionEvent::RunStarted {
            run_id: run.id.clone(),
            total_waves: plan.total_waves,
            task_count: plan.task_count(),
        })
        .await;

        let branch = run.branch_name.clone().unwrap_or_default();
        match self.git.prepare_run(&branch).await {
            Ok(point) => {
                run.original_head = Some(point.original_head);
                run.backup_branch = Some(point.backup_branch);
            }
            Err(e) => {
                let message = format!("Failed to prepare git branches: {e:#}");
                tracing::error!(run_id = %run.id, "{message}");
                for tasks in waves.values_mut() {
                    self.skip_tasks(tasks, "run aborted before start").await?;
                }
                run.status = RunStatus::Failed;
                run.error_message = Some(message);
                run.completed_at = Some(Utc::now());
                self.save_run(&mut run).await?;
                let all: Vec<ExecutionTask> = waves.into_values().flatten().collect();
                return Ok(self.finish(run, &all, &items_by_id).await);
            }
        }

        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.save_run(&mut run).await?;
        for id in &item_ids {
            self.backlog
                .update_item_status(*id, ItemStatus::InProgress)
                .await
                .map_err(MasonError::storage)?;
            self.backlog
                .set_item_branch(*id, &branch)
                .await
                .map_err(MasonError::storage)?;
        }

        let ctx = TaskContext {
            executor: Arc::clone(&self.executor),
            runs: Arc::clone(&self.runs),
            budget: Arc::new(Mutex::new(BudgetTracker::new(self.config.budget_limits()))),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
            limits: self.config.agent_limits,
            max_attempts: self.config.max_task_attempts,
        };
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let blocked_by: HashMap<u32, Vec<u32>> = plan
            .waves
            .iter()
            .map(|w| (w.wave, w.blocked_by.clone()))
            .collect();
        let mut successes: HashMap<u32, usize> = HashMap::new();
        let mut finished: Vec<ExecutionTask> = Vec::new();

        for (wave, mut tasks) in waves {
            if let Some(reason) = ctx.stop_reason().await {
                self.skip_tasks(&mut tasks, reason).await?;
                finished.extend(tasks);
                continue;
            }

            let dead_upstream: Vec<u32> = blocked_by
                .get(&wave)
                .into_iter()
                .flatten()
                .copied()
                .filter(|w| successes.get(w).copied().unwrap_or(0) == 0)
                .collect();
            if !dead_upstream.is_empty() {
                let blocked = MasonError::WaveBlocked {
                    wave,
                    blocked_by: dead_upstream,
                };
                tracing::warn!(run_id = %run.id, "{blocked}");
                self.skip_tasks(&mut tasks, &blocked.to_string()).await?;
                self.emit(ExecutionEvent::WaveCompleted {
                    wave,
                    success_count: 0,
                    failed_count: 0,
                    skipped_count: tasks.len(),
                })
                .await;
                successes.insert(wave, 0);
                finished.extend(tasks);
                continue;
            }

            run.current_wave = wave;
            self.save_run(&mut run).await?;
            tracing::info!(run_id = %run.id, wave, tasks = tasks.len(), "wave started");
            self.emit(ExecutionEvent::WaveStarted {
                wave,
                tasks: tasks.len(),
            })
            .await;

            let mut join_set = JoinSet::new();
            for task in tasks {
                let prompt = build_task_prompt(
                    items_by_id.get(&task.item_id),
                    &task,
                    &self.config.validation_steps,
                );
                join_set.spawn(run_task(
                    ctx.clone(),
                    task,
                    prompt,
                    Arc::clone(&semaphore),
                ));
            }

            // Every task in the wave reaches a terminal status before we move on.
            let mut wave_tasks = Vec::new();
            let mut fatal: Option<MasonError> = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok(task)) => wave_tasks.push(task),
                    Ok(Err(e)) => {
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        fatal.get_or_insert(MasonError::Other(anyhow!("task panicked: {e}")));
                    }
                }
            }

            {
                let budget = ctx.budget.lock().await;
                run.tokens_used = budget.tokens_used();
                run.estimated_cost = budget.cost();
            }

            if let Some(e) = fatal {
                run.status = RunStatus::Failed;
                run.error_message = Some(e.to_string());
                run.completed_at = Some(Utc::now());
                if let Err(save_err) = self.save_run(&mut run).await {
                    tracing::error!(error = %save_err, "failed to record run failure");
                }
                return Err(e);
            }

            let count = |s: TaskStatus| wave_tasks.iter().filter(|t| t.status == s).count();
            let success_count = count(TaskStatus::Completed);
            self.emit(ExecutionEvent::WaveCompleted {
                wave,
                success_count,
                failed_count: count(TaskStatus::Failed),
                skipped_count: count(TaskStatus::Skipped),
            })
            .await;
            successes.insert(wave, success_count);
            self.save_run(&mut run).await?;
            finished.extend(wave_tasks);
        }

        let budget_exceeded = ctx.budget.lock().await.is_exceeded();
        let any_unsuccessful = finished.iter().any(|t| !t.status.is_success());
        run.status = if self.cancel.is_cancelled() || budget_exceeded {
            RunStatus::Cancelled
        } else if any_unsuccessful {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        run.error_message = match run.status {
            RunStatus::Cancelled if budget_exceeded => Some(
                MasonError::BudgetExceeded {
                    tokens_used: run.tokens_used,
                    cost: run.estimated_cost,
                }
                .to_string(),
            ),
            RunStatus::Cancelled => Some("Run cancelled".to_string()),
            RunStatus::Failed => {
                let failed = finished
                    .iter()
                    .filter(|t| t.status == TaskStatus::Failed)
                    .count();
                let skipped = finished
                    .iter()
                    .filter(|t| t.status == TaskStatus::Skipped)
                    .count();
                Some(format!("{failed} task(s) failed, {skipped} skipped"))
            }
            _ => None,
        };

        for id in &item_ids {
            let all_done = finished
                .iter()
                .filter(|t| t.item_id == *id)
                .all(|t| t.status.is_success());
            let status = if all_done {
                ItemStatus::Completed
            } else {
                ItemStatus::Failed
            };
            self.backlog
                .update_item_status(*id, status)
                .await
                .map_err(MasonError::storage)?;
        }

        if finished.iter().any(|t| t.status.is_success()) {
            let (title, body) = pull_request_text(&run, &finished, &items_by_id);
            match self.git.open_pull_request(&branch, &title, &body).await {
                Ok(url) => {
                    tracing::info!(run_id = %run.id, pr_url = %url, "pull request opened");
                    run.pr_url = Some(url);
                }
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %format!("{e:#}"), "failed to open pull request");
                }
            }
        }

        run.completed_at = Some(Utc::now());
        self.save_run(&mut run).await?;
        tracing::info!(run_id = %run.id, status = %run.status, "execution run finished");

        Ok(self.finish(run, &finished, &items_by_id).await)
    }

    async fn finish(
        &self,
        run: ExecutionRun,
        tasks: &[ExecutionTask],
        items_by_id: &HashMap<i64, BacklogItem>,
    ) -> RunSummary {
        let mut item_results: Vec<ItemResult> = run
            .item_ids
            .iter()
            .map(|id| {
                let mine: Vec<_> = tasks.iter().filter(|t| t.item_id == *id).collect();
                let completed_tasks = mine.iter().filter(|t| t.status.is_success()).count();
                let status = if run.status == RunStatus::Failed && run.started_at.is_none() {
                    items_by_id
                        .get(id)
                        .map_or(ItemStatus::Approved, |i| i.status)
                } else if completed_tasks == mine.len() {
                    ItemStatus::Completed
                } else {
                    ItemStatus::Failed
                };
                ItemResult {
                    item_id: *id,
                    status,
                    completed_tasks,
                    total_tasks: mine.len(),
                }
            })
            .collect();
        item_results.sort_by_key(|r| r.item_id);

        let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
        let summary = RunSummary {
            run_id: run.id.clone(),
            status: run.status,
            pr_url: run.pr_url.clone(),
            item_results,
            success_count: count(TaskStatus::Completed),
            failure_count: count(TaskStatus::Failed),
            skipped_count: count(TaskStatus::Skipped),
            tokens_used: run.tokens_used,
            cost: run.estimated_cost,
            branch_name: run.branch_name.clone(),
            original_head: run.original_head.clone(),
            backup_branch: run.backup_branch.clone(),
            error_message: run.error_message.clone(),
        };
        self.emit(ExecutionEvent::RunCompleted {
            summary: Box::new(summary.clone()),
        })
        .await;
        summary
    }
}

/// Run one task to a terminal status, retrying within the attempt limit.
async fn run_task(
    ctx: TaskContext,
    mut task: ExecutionTask,
    prompt: String,
    semaphore: Arc<Semaphore>,
) -> MasonResult<ExecutionTask> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| MasonError::Other(anyhow!("worker pool closed: {e}")))?;

    if let Some(reason) = ctx.stop_reason().await {
        task.status = TaskStatus::Skipped;
        task.error_message = Some(reason.to_string());
        task.completed_at = Some(Utc::now());
        ctx.persist(&mut task).await?;
        return Ok(task);
    }

    task.status = TaskStatus::Running;
    task.started_at = Some(Utc::now());
    ctx.persist(&mut task).await?;
    ctx.emit(ExecutionEvent::TaskStarted {
        wave: task.wave,
        task_number: task.task_number,
        item_id: task.item_id,
        subagent_type: task.subagent_type,
    })
    .await;

    let mut succeeded = false;
    let mut last_error: Option<String> = None;
    while task.attempts < ctx.max_attempts {
        let allowance = {
            let budget = ctx.budget.lock().await;
            if task.attempts > 0 && budget.is_exceeded() {
                break;
            }
            budget.allowance()
        };
        task.attempts += 1;

        let request = AgentRequest {
            label: task.label(),
            subagent_type: task.subagent_type,
            prompt: prompt.clone(),
            depth: 0,
            allowance,
        };
        match run_agent(ctx.executor.as_ref(), request, ctx.limits).await {
            Ok(outcome) => {
                task.tokens_used += outcome.tokens_used;
                task.cost += outcome.cost;
                task.output = Some(outcome.output);
                let charge = ctx
                    .budget
                    .lock()
                    .await
                    .charge(outcome.tokens_used, outcome.cost);
                if outcome.success {
                    succeeded = true;
                    last_error = None;
                    break;
                }
                last_error = Some(
                    outcome
                        .error
                        .unwrap_or_else(|| "agent reported failure".to_string()),
                );
                if charge == ChargeOutcome::Exceeded {
                    break;
                }
            }
            Err(e) => {
                last_error = Some(format!("{e:#}"));
            }
        }

        if task.attempts < ctx.max_attempts {
            tracing::warn!(
                task = %task.label(),
                attempt = task.attempts,
                error = last_error.as_deref().unwrap_or(""),
                "task attempt failed, retrying"
            );
        }
    }

    task.status = if succeeded {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    };
    if let Some(message) = &last_error {
        let failure = MasonError::TaskFailed {
            task: task.label(),
            message: message.clone(),
        };
        tracing::warn!("{failure}");
    }
    task.error_message = last_error;
    task.completed_at = Some(Utc::now());
    ctx.persist(&mut task).await?;
    ctx.emit(ExecutionEvent::TaskFinished {
        wave: task.wave,
        task_number: task.task_number,
        item_id: task.item_id,
        status: task.status,
        tokens_used: task.tokens_used,
        cost: task.cost,
    })
    .await;
    Ok(task)
}

fn work_branch_name(run_id: &str, item_ids: &[i64], items: &HashMap<i64, BacklogItem>) -> String {
    let short_id: String = run_id.chars().take(8).collect();
    match item_ids {
        [only] => {
            let title = items.get(only).map(|i| i.title.as_str()).unwrap_or("item");
            let slug = sanitize_branch_name(title);
            if slug.is_empty() {
                format!("mason/run-{short_id}")
            } else {
                format!("mason/{slug}-{short_id}")
            }
        }
        _ => format!("mason/run-{short_id}"),
    }
}

fn build_task_prompt(
    item: Option<&BacklogItem>,
    task: &ExecutionTask,
    validation_steps: &[String],
) -> String {
    let mut prompt = String::new();
    if let Some(item) = item {
        prompt.push_str(&format!(
            "Backlog item #{}: {}\n\nProblem:\n{}\n\nProposed solution:\n{}\n\n",
            item.id, item.title, item.problem, item.solution
        ));
    }
    prompt.push_str(&format!(
        "Your task ({}, wave {} task {}):\n{}\n",
        task.subagent_type, task.wave, task.task_number, task.description
    ));
    if !task.subagent_type.is_preparatory() && !validation_steps.is_empty() {
        prompt.push_str(&format!(
            "\nBefore finishing, make sure these checks pass: {}.\n",
            validation_steps.join(", ")
        ));
    }
    prompt
}

fn pull_request_text(
    run: &ExecutionRun,
    tasks: &[ExecutionTask],
    items: &HashMap<i64, BacklogItem>,
) -> (String, String) {
    let titles: Vec<&str> = run
        .item_ids
        .iter()
        .filter_map(|id| items.get(id).map(|i| i.title.as_str()))
        .collect();
    let title = match titles.as_slice() {
        [one] => format!("mason: {one}"),
        _ => format!("mason: {} improvements", titles.len()),
    };

    let mut body = String::from("## Items\n\n");
    for id in &run.item_ids {
        if let Some(item) = items.get(id) {
            let done = tasks
                .iter()
                .filter(|t| t.item_id == *id)
                .all(|t| t.status.is_success());
            let mark = if done { "x" } else { " " };
            body.push_str(&format!("- [{mark}] #{} {} ({})\n", item.id, item.title, item.domain));
        }
    }
    body.push_str("\n## Tasks\n\n| Wave | Task | Agent | Status |\n|---|---|---|---|\n");
    for task in tasks {
        body.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            task.wave, task.task_number, task.subagent_type, task.status
        ));
    }
    if let Some(head) = &run.original_head {
        body.push_str(&format!("\nOriginal HEAD: `{head}`\n"));
    }
    (title, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::agent::AgentResponse;
    use crate::execution::planner::{
        ExecutionWave, ExecutionWaveTask, NeverConflicts, WavePlanner,
    };
    use crate::review::findings::Improvement;
    use crate::review::fingerprint::FileHashes;
    use crate::store::{DbHandle, MasonDb};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Executor driven by the task label: labels listed in `fail` report failure.
    struct ScriptedExecutor {
        fail: Vec<String>,
        cost_per_call: f64,
        delay: Duration,
        log: StdMutex<Vec<String>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                fail: Vec::new(),
                cost_per_call: 0.01,
                delay: Duration::from_millis(5),
                log: StdMutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }

        fn failing(mut self, labels: &[&str]) -> Self {
            self.fail = labels.iter().map(|s| s.to_string()).collect();
            self
        }

        fn costing(mut self, cost: f64) -> Self {
            self.cost_per_call = cost;
            self
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentExecutor for ScriptedExecutor {
        async fn run(&self, request: AgentRequest) -> Result<AgentResponse> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("start {}", request.label));
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(format!("end {}", request.label));
            self.running.fetch_sub(1, Ordering::SeqCst);

            let success = !self.fail.contains(&request.label);
            Ok(AgentResponse {
                success,
                output: format!("output of {}", request.label),
                tokens_used: 100,
                cost: self.cost_per_call,
                spawn_requests: Vec::new(),
                error: (!success).then(|| "tests failed".to_string()),
            })
        }
    }

    struct FakeGit {
        fail_prepare: bool,
        prs: StdMutex<Vec<String>>,
    }

    impl FakeGit {
        fn new() -> Self {
            Self {
                fail_prepare: false,
                prs: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GitCollaborator for FakeGit {
        async fn prepare_run(&self, _work_branch: &str) -> Result<RollbackPoint> {
            if self.fail_prepare {
                anyhow::bail!("not a git repository");
            }
            Ok(RollbackPoint {
                original_head: "abc123".to_string(),
                backup_branch: "mason-backup/test".to_string(),
            })
        }

        async fn open_pull_request(
            &self,
            work_branch: &str,
            _title: &str,
            _body: &str,
        ) -> Result<String> {
            self.prs.lock().unwrap().push(work_branch.to_string());
            Ok("https://github.com/acme/app/pull/7".to_string())
        }
    }

    /// Approved items; an empty file name means the item names no files.
    async fn seed(db: &DbHandle, specs: &[(i64, i64, &str)]) -> Vec<BacklogItem> {
        let items: Vec<BacklogItem> = specs
            .iter()
            .enumerate()
            .map(|(i, (impact, effort, file))| {
                let files = if file.is_empty() {
                    Vec::new()
                } else {
                    vec![file.to_string()]
                };
                let imp = Improvement::new(&format!("Item {i}"), "security", *impact, *effort)
                    .with_files(files);
                let mut item = BacklogItem::from_improvement(&imp, &FileHashes::new(), i as i64);
                item.status = ItemStatus::Approved;
                item
            })
            .collect();
        let ids = db.insert_items(items.clone()).await.unwrap();
        items
            .into_iter()
            .zip(ids)
            .map(|(mut item, id)| {
                item.id = id;
                item
            })
            .collect()
    }

    fn scheduler(
        executor: Arc<ScriptedExecutor>,
        db: &DbHandle,
        git: Arc<FakeGit>,
        config: SchedulerConfig,
    ) -> ExecutionScheduler {
        ExecutionScheduler::new(
            executor,
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            git,
            config,
        )
    }

    fn db() -> DbHandle {
        DbHandle::new(MasonDb::new_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_two_independent_items_one_wave() {
        let db = db();
        let items = seed(&db, &[(8, 3, "src/a.rs"), (5, 5, "src/b.rs")]).await;
        let plan = WavePlanner::default().plan(&items);
        assert_eq!(plan.total_waves, 1);
        assert!(plan.waves[0].blocked_by.is_empty());
        assert_eq!(plan.waves[0].tasks.len(), 2);

        let executor = Arc::new(ScriptedExecutor::new());
        let git = Arc::new(FakeGit::new());
        let (tx, mut rx) = mpsc::channel(64);
        let summary = scheduler(executor, &db, git.clone(), SchedulerConfig::default())
            .with_event_channel(tx)
            .execute(items.clone(), plan)
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 0);
        assert_eq!(summary.pr_url.as_deref(), Some("https://github.com/acme/app/pull/7"));
        assert_eq!(summary.original_head.as_deref(), Some("abc123"));
        assert_eq!(git.prs.lock().unwrap().len(), 1);

        for item in &items {
            let stored = db.get_item(item.id).await.unwrap().unwrap();
            assert_eq!(stored.status, ItemStatus::Completed);
            assert!(stored.branch_name.is_some());
        }
        let run = db.get_run(&summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.tokens_used, 200);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("run_started"));
        assert_eq!(kinds.last().map(String::as_str), Some("run_completed"));
        assert_eq!(kinds.iter().filter(|k| *k == "task_finished").count(), 2);
    }

    #[tokio::test]
    async fn test_next_wave_waits_for_previous() {
        let db = db();
        let items = seed(
            &db,
            &[(8, 3, "src/shared.rs"), (7, 3, "src/shared.rs"), (6, 3, "src/c.rs")],
        )
        .await;
        let plan = WavePlanner::default().plan(&items);
        assert_eq!(plan.total_waves, 2);

        let executor = Arc::new(ScriptedExecutor::new());
        let summary = scheduler(
            executor.clone(),
            &db,
            Arc::new(FakeGit::new()),
            SchedulerConfig::default(),
        )
        .execute(items, plan)
        .await
        .unwrap();
        assert_eq!(summary.status, RunStatus::Completed);

        let log = executor.log();
        let last_wave1_end = log
            .iter()
            .rposition(|l| l.starts_with("end 1."))
            .unwrap();
        let first_wave2_start = log.iter().position(|l| l.starts_with("start 2.")).unwrap();
        assert!(last_wave1_end < first_wave2_start, "log: {log:?}");
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_max_concurrent() {
        let db = db();
        let items = seed(
            &db,
            &[(9, 1, "a"), (8, 1, "b"), (7, 1, "c"), (6, 1, "d")],
        )
        .await;
        let plan = WavePlanner::new(Box::new(NeverConflicts)).plan(&items);
        let executor = Arc::new(ScriptedExecutor::new());
        let config = SchedulerConfig::default().with_max_concurrent(2);
        scheduler(executor.clone(), &db, Arc::new(FakeGit::new()), config)
            .execute(items, plan)
            .await
            .unwrap();
        assert!(executor.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.log().len(), 8);
    }

    #[tokio::test]
    async fn test_failed_wave_skips_dependents() {
        let db = db();
        let items = seed(&db, &[(8, 3, "src/x.rs"), (5, 5, "src/x.rs")]).await;
        let plan = WavePlanner::default().plan(&items);
        assert_eq!(plan.waves[1].blocked_by, vec![1]);

        let executor = Arc::new(ScriptedExecutor::new().failing(&["1.1"]));
        let git = Arc::new(FakeGit::new());
        let summary = scheduler(executor.clone(), &db, git.clone(), SchedulerConfig::default())
            .execute(items.clone(), plan)
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.success_count, 0);
        assert!(summary.pr_url.is_none());
        assert!(git.prs.lock().unwrap().is_empty());
        // wave 2 never ran
        assert!(!executor.log().iter().any(|l| l.contains("2.1")));

        let tasks = db.list_tasks(&summary.run_id).await.unwrap();
        let skipped = tasks.iter().find(|t| t.wave == 2).unwrap();
        assert_eq!(skipped.status, TaskStatus::Skipped);
        assert!(skipped.error_message.as_deref().unwrap().contains("blocked"));
        for item in &items {
            let stored = db.get_item(item.id).await.unwrap().unwrap();
            assert_eq!(stored.status, ItemStatus::Failed);
        }
    }

    #[tokio::test]
    async fn test_retry_until_attempts_exhausted() {
        let db = db();
        let items = seed(&db, &[(8, 3, "a")]).await;
        let plan = WavePlanner::default().plan(&items);
        let executor = Arc::new(ScriptedExecutor::new().failing(&["1.1"]));
        let config = SchedulerConfig::default().with_max_task_attempts(3);
        let summary = scheduler(executor.clone(), &db, Arc::new(FakeGit::new()), config)
            .execute(items, plan)
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        let tasks = db.list_tasks(&summary.run_id).await.unwrap();
        assert_eq!(tasks[0].attempts, 3);
        assert_eq!(tasks[0].tokens_used, 300);
        assert_eq!(tasks[0].error_message.as_deref(), Some("tests failed"));
    }

    #[tokio::test]
    async fn test_cost_ceiling_cancels_run() {
        let db = db();
        let items = seed(&db, &[(8, 3, "x"), (7, 3, "x"), (6, 3, "x")]).await;
        let plan = WavePlanner::default().plan(&items);
        assert_eq!(plan.total_waves, 3);

        let executor = Arc::new(ScriptedExecutor::new().costing(0.6));
        let config = SchedulerConfig::default().with_cost_ceiling(1.0);
        let summary = scheduler(executor.clone(), &db, Arc::new(FakeGit::new()), config)
            .execute(items, plan)
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.skipped_count, 1);
        assert!(summary.error_message.unwrap().contains("Budget exceeded"));
        // partial work still gets a PR
        assert!(summary.pr_url.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_token_skips_unstarted_waves() {
        let db = db();
        let items = seed(&db, &[(8, 3, "x"), (7, 3, "x")]).await;
        let plan = WavePlanner::default().plan(&items);
        let token = CancellationToken::new();
        token.cancel();

        let executor = Arc::new(ScriptedExecutor::new());
        let summary = scheduler(
            executor.clone(),
            &db,
            Arc::new(FakeGit::new()),
            SchedulerConfig::default(),
        )
        .with_cancellation(token)
        .execute(items, plan)
        .await
        .unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.skipped_count, 2);
        assert!(executor.log().is_empty());
    }

    #[tokio::test]
    async fn test_git_prepare_failure_fails_run_without_touching_items() {
        let db = db();
        let items = seed(&db, &[(8, 3, "x")]).await;
        let plan = WavePlanner::default().plan(&items);
        let git = Arc::new(FakeGit {
            fail_prepare: true,
            prs: StdMutex::new(Vec::new()),
        });

        let executor = Arc::new(ScriptedExecutor::new());
        let summary = scheduler(executor.clone(), &db, git, SchedulerConfig::default())
            .execute(items.clone(), plan)
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        assert!(summary.error_message.unwrap().contains("not a git repository"));
        assert!(executor.log().is_empty());
        let stored = db.get_item(items[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Approved);
    }

    #[tokio::test]
    async fn test_explicit_plan_with_empty_blocked_wave_cascade() {
        let db = db();
        let items = seed(&db, &[(8, 3, "")]).await;
        let id = items[0].id;
        let task = |n: u32, kind: SubagentType| ExecutionWaveTask {
            item_id: id,
            task_number: n,
            subagent_type: kind,
            description: "step".to_string(),
        };
        let plan = ExecutionPlan {
            waves: vec![
                ExecutionWave {
                    wave: 1,
                    tasks: vec![task(1, SubagentType::Explore)],
                    blocked_by: vec![],
                },
                ExecutionWave {
                    wave: 2,
                    tasks: vec![task(1, SubagentType::GeneralPurpose)],
                    blocked_by: vec![1],
                },
                ExecutionWave {
                    wave: 3,
                    tasks: vec![task(1, SubagentType::CodeReviewer)],
                    blocked_by: vec![2],
                },
            ],
            total_waves: 3,
        };
        let executor = Arc::new(ScriptedExecutor::new().failing(&["1.1"]));
        let summary = scheduler(
            executor,
            &db,
            Arc::new(FakeGit::new()),
            SchedulerConfig::default(),
        )
        .execute(items, plan)
        .await
        .unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.skipped_count, 2);
    }

    #[test]
    fn test_prompt_includes_validation_for_implementation_only() {
        let imp = Improvement::new("Add limiter", "security", 8, 3).with_solution("token bucket");
        let item = BacklogItem::from_improvement(&imp, &FileHashes::new(), 0);
        let steps = vec!["lint".to_string(), "test".to_string()];

        let build = ExecutionTask::new("r", 0, 1, 1, SubagentType::GeneralPurpose, "build it");
        let prompt = build_task_prompt(Some(&item), &build, &steps);
        assert!(prompt.contains("Add limiter"));
        assert!(prompt.contains("token bucket"));
        assert!(prompt.contains("lint, test"));

        let explore = ExecutionTask::new("r", 0, 1, 2, SubagentType::Explore, "look around");
        assert!(!build_task_prompt(Some(&item), &explore, &steps).contains("checks pass"));
    }

    #[test]
    fn test_work_branch_name() {
        let mut items = HashMap::new();
        let imp = Improvement::new("Add Rate Limiting!", "security", 8, 3);
        let mut item = BacklogItem::from_improvement(&imp, &FileHashes::new(), 0);
        item.id = 4;
        items.insert(4, item);
        assert_eq!(
            work_branch_name("0123456789", &[4], &items),
            "mason/add-rate-limiting-01234567"
        );
        assert_eq!(work_branch_name("0123456789", &[4, 5], &items), "mason/run-01234567");
    }
}
