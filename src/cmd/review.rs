//! `mason review`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use mason::providers::ClaudeCli;
use mason::review::{
    CheckpointStore, DomainAnalysisOrchestrator, ReviewCache, ReviewEvent, ReviewOutcome,
    ReviewStatus,
};

use super::{acquire_lock, cancel_on_ctrl_c, format_cost, load_config, open_db};

pub async fn cmd_review(project_dir: &Path, verbose: bool, fresh: bool, json: bool) -> Result<()> {
    let config = load_config(project_dir, verbose)?;
    let db = open_db(&config)?;
    let _lock = acquire_lock(&config, "review")?;

    let (tx, mut rx) = mpsc::channel(64);
    let orchestrator = DomainAnalysisOrchestrator::new(
        Arc::new(ClaudeCli::from_config(&config)),
        Arc::new(db),
        CheckpointStore::new(&config.checkpoint_dir()),
        ReviewCache::new(&config.cache_dir(), config.file.cache_ttl_hours),
        config.file.clone(),
        config.project_dir.clone(),
    )
    .fresh(fresh)
    .with_event_channel(tx)
    .with_cancellation(cancel_on_ctrl_c(&config.data_dir));

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !json {
                print_event(&event);
            }
        }
    });

    let outcome = orchestrator.run().await;
    drop(orchestrator);
    printer.await.ok();
    let outcome = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_summary(&outcome);
    }
    Ok(())
}

fn print_event(event: &ReviewEvent) {
    match event {
        ReviewEvent::ReviewStarted {
            resumed,
            files,
            pending,
            ..
        } => {
            let mode = if *resumed { "Resuming" } else { "Starting" };
            println!(
                "{} review of {} file(s) across {} domain(s)",
                style(mode).bold().cyan(),
                files,
                pending.len()
            );
        }
        ReviewEvent::DomainStarted { domain, files } => {
            println!("  {} {} ({} files)", style("→").dim(), domain, files);
        }
        ReviewEvent::DomainCompleted {
            domain,
            improvements,
            cost,
            from_cache,
            ..
        } => {
            let source = if *from_cache {
                style("cached".to_string()).dim()
            } else {
                style(format_cost(*cost)).dim()
            };
            println!(
                "  {} {}: {} improvement(s) {}",
                style("✓").green(),
                domain,
                improvements,
                source
            );
        }
        ReviewEvent::DomainFailed { domain, message } => {
            println!("  {} {}: {}", style("✗").red(), domain, message);
        }
        ReviewEvent::BudgetWarning { cost } => {
            println!(
                "  {} spend has reached {}",
                style("⚠").yellow(),
                format_cost(*cost)
            );
        }
        ReviewEvent::ReviewCompleted { .. } => {}
    }
}

fn print_summary(outcome: &ReviewOutcome) {
    println!();
    let status = match outcome.status {
        ReviewStatus::Completed => style("Review complete").green().bold(),
        ReviewStatus::BudgetExceeded => style("Budget exceeded").yellow().bold(),
        ReviewStatus::Partial => style("Review partially complete").yellow().bold(),
    };
    println!("{status}");
    println!(
        "  {} domain(s) analyzed, {} cache hit(s), {} tokens, {}",
        outcome.domains_analyzed,
        outcome.cache_hits,
        outcome.tokens_used,
        format_cost(outcome.cost)
    );
    println!(
        "  {} new backlog item(s), {} duplicate(s) skipped",
        outcome.item_ids.len(),
        outcome.duplicates_skipped
    );
    if !outcome.pending_domains.is_empty() {
        println!(
            "  Pending: {} (run `mason review` again to resume)",
            outcome.pending_domains.join(", ")
        );
    }
    if !outcome.item_ids.is_empty() {
        println!();
        println!("Next: `mason list` to see the backlog, `mason approve` to pick items.");
    }
}
