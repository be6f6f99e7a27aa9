//! `mason execute`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use mason::execution::{
    ExecutionEvent, ExecutionPlan, ExecutionScheduler, RunSummary, SchedulerConfig, WavePlanner,
};
use mason::providers::{ClaudeCli, GitRepo};
use mason::store::{BacklogItem, BacklogStore, ItemStatus, RunStatus, TaskStatus};

use super::{acquire_lock, cancel_on_ctrl_c, format_cost, load_config, open_db};

pub struct ExecuteOptions {
    pub max_concurrent: Option<usize>,
    pub items: Vec<i64>,
    pub dry_run: bool,
    pub json: bool,
}

pub async fn cmd_execute(project_dir: &Path, verbose: bool, opts: ExecuteOptions) -> Result<()> {
    let config = load_config(project_dir, verbose)?.with_max_concurrent(opts.max_concurrent);
    config.file.check()?;
    let db = open_db(&config)?;
    // Covers the approved-set read as well as the run.
    let _lock = if opts.dry_run {
        None
    } else {
        Some(acquire_lock(&config, "execute")?)
    };

    let mut approved = db.list_items(Some(ItemStatus::Approved)).await?;
    if !opts.items.is_empty() {
        for id in &opts.items {
            if !approved.iter().any(|i| i.id == *id) {
                anyhow::bail!("Backlog item {id} is not approved");
            }
        }
        approved.retain(|i| opts.items.contains(&i.id));
    }
    if approved.is_empty() {
        println!("No approved items. Run 'mason approve' first.");
        return Ok(());
    }

    let plan = WavePlanner::default().plan(&approved);
    if opts.dry_run {
        if opts.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            print_plan(&plan, &approved);
        }
        return Ok(());
    }
    if !opts.json {
        print_plan(&plan, &approved);
    }

    let git = GitRepo::new(&config.project_dir)?.with_excluded(&config.file.data_dir);

    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = ExecutionScheduler::new(
        Arc::new(ClaudeCli::from_config(&config)),
        Arc::new(db.clone()),
        Arc::new(db.clone()),
        Arc::new(git),
        SchedulerConfig::from_config(&config.file),
    )
    .with_event_channel(tx)
    .with_cancellation(cancel_on_ctrl_c(&config.data_dir));

    let quiet = opts.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !quiet {
                print_event(&event);
            }
        }
    });

    let summary = scheduler.execute(approved, plan).await;
    drop(scheduler);
    printer.await.ok();
    let summary = summary?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if summary.status == RunStatus::Failed {
        anyhow::bail!(
            "Execution run {} failed: {}",
            summary.run_id,
            summary.error_message.as_deref().unwrap_or("see task errors")
        );
    }
    Ok(())
}

fn print_plan(plan: &ExecutionPlan, items: &[BacklogItem]) {
    let title = |id: i64| {
        items
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.title.as_str())
            .unwrap_or("?")
    };
    println!();
    println!(
        "{} {} task(s) in {} wave(s)",
        style("Plan:").bold().cyan(),
        plan.task_count(),
        plan.total_waves
    );
    for wave in &plan.waves {
        let blocked = if wave.blocked_by.is_empty() {
            String::new()
        } else {
            let waves: Vec<String> = wave.blocked_by.iter().map(|w| w.to_string()).collect();
            format!(" (after wave {})", waves.join(", "))
        };
        println!("  {}{}", style(format!("Wave {}", wave.wave)).bold(), style(blocked).dim());
        for task in &wave.tasks {
            println!(
                "    {}.{} [{}] #{} {}",
                wave.wave,
                task.task_number,
                task.subagent_type,
                task.item_id,
                title(task.item_id)
            );
        }
    }
    println!();
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { run_id, .. } => {
            println!("{} run {}", style("Executing").bold().cyan(), run_id);
        }
        ExecutionEvent::WaveStarted { wave, tasks } => {
            println!("  {} {} ({} task(s))", style("Wave").bold(), wave, tasks);
        }
        ExecutionEvent::TaskStarted {
            wave,
            task_number,
            subagent_type,
            ..
        } => {
            println!("    {} {}.{} {}", style("→").dim(), wave, task_number, subagent_type);
        }
        ExecutionEvent::TaskFinished {
            wave,
            task_number,
            status,
            cost,
            ..
        } => {
            let mark = match status {
                TaskStatus::Completed => style("✓").green(),
                TaskStatus::Skipped => style("-").dim(),
                _ => style("✗").red(),
            };
            println!(
                "    {} {}.{} {} {}",
                mark,
                wave,
                task_number,
                status,
                style(format_cost(*cost)).dim()
            );
        }
        ExecutionEvent::WaveCompleted {
            wave,
            success_count,
            failed_count,
            skipped_count,
        } => {
            println!(
                "  Wave {} done: {} ok, {} failed, {} skipped",
                wave, success_count, failed_count, skipped_count
            );
        }
        ExecutionEvent::RunCompleted { .. } => {}
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    let status = match summary.status {
        RunStatus::Completed => style("Run completed").green().bold(),
        RunStatus::Cancelled => style("Run cancelled").yellow().bold(),
        _ => style("Run failed").red().bold(),
    };
    println!("{status}");
    println!(
        "  {} succeeded, {} failed, {} skipped, {} tokens, {}",
        summary.success_count,
        summary.failure_count,
        summary.skipped_count,
        summary.tokens_used,
        format_cost(summary.cost)
    );
    for item in &summary.item_results {
        println!(
            "  #{} {} ({}/{} tasks)",
            item.item_id, item.status, item.completed_tasks, item.total_tasks
        );
    }
    if let Some(branch) = &summary.branch_name {
        println!("  Branch: {}", branch);
    }
    if let Some(url) = &summary.pr_url {
        println!("  Pull request: {}", style(url).underlined());
    }
    if let Some(message) = &summary.error_message {
        println!("  {}", message);
    }
    if summary.status != RunStatus::Completed
        && let (Some(head), Some(backup)) = (&summary.original_head, &summary.backup_branch)
    {
        println!("  To roll back: git checkout {} (backup of {})", backup, head);
    }
}
