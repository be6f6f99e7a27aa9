//! Backlog listing, details, and approval commands.

use anyhow::{Context, Result};
use console::style;
use dialoguer::{MultiSelect, theme::ColorfulTheme};
use std::path::Path;

use mason::priority::{rank, rank_weighted};
use mason::store::{BacklogItem, BacklogStore, ItemStatus};

use super::{acquire_lock, load_config, open_db};

fn status_style(status: ItemStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        ItemStatus::New => s.cyan(),
        ItemStatus::Approved => s.blue(),
        ItemStatus::InProgress => s.yellow(),
        ItemStatus::Completed => s.green(),
        ItemStatus::Failed => s.red(),
        ItemStatus::Rejected => s.dim(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

pub async fn cmd_list(
    project_dir: &Path,
    verbose: bool,
    status: Option<&str>,
    weighted: bool,
    json: bool,
) -> Result<()> {
    let config = load_config(project_dir, verbose)?;
    let status = status
        .map(|s| s.parse::<ItemStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    let db = open_db(&config)?;
    let mut items = db.list_items(status).await?;

    if weighted {
        rank_weighted(&mut items, |domain| config.file.domain_weight(domain));
    } else {
        rank(&mut items);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!();
        println!("Backlog is empty. Run 'mason review' to analyze the codebase.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<5} {:>4} {:>4} {:>4}  {:<12} {:<14} Title",
        "ID", "Pri", "Imp", "Eff", "Status", "Domain"
    );
    println!(
        "{:<5} {:>4} {:>4} {:>4}  {:<12} {:<14} -----",
        "-----", "----", "----", "----", "------------", "--------------"
    );
    for item in &items {
        println!(
            "{:<5} {:>4} {:>4} {:>4}  {:<12} {:<14} {}",
            item.id,
            item.priority_score,
            item.impact_score,
            item.effort_score,
            // pad before styling so ANSI codes don't break alignment
            status_style(item.status).to_string()
                + &" ".repeat(12usize.saturating_sub(item.status.as_str().len())),
            truncate(&item.domain, 14),
            truncate(&item.title, 60)
        );
    }
    println!();
    println!("{} item(s)", items.len());
    Ok(())
}

pub async fn cmd_show(project_dir: &Path, verbose: bool, id: i64, json: bool) -> Result<()> {
    let config = load_config(project_dir, verbose)?;
    let db = open_db(&config)?;
    let item = db
        .get_item(id)
        .await?
        .with_context(|| format!("Backlog item {id} not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    println!();
    println!("{} {}", style(format!("#{}", item.id)).bold(), style(&item.title).bold());
    println!();
    println!("  Status:     {}", status_style(item.status));
    println!("  Domain:     {}", item.domain);
    println!(
        "  Priority:   {} (impact {}, effort {})",
        item.priority_score, item.impact_score, item.effort_score
    );
    println!("  Complexity: {}", item.complexity);
    if let Some(branch) = &item.branch_name {
        println!("  Branch:     {}", branch);
    }
    println!("  Discovered: {}", item.discovered_at.format("%Y-%m-%d %H:%M"));

    if !item.problem.is_empty() {
        println!();
        println!("{}", style("Problem").underlined());
        println!("{}", item.problem);
    }
    if !item.solution.is_empty() {
        println!();
        println!("{}", style("Solution").underlined());
        println!("{}", item.solution);
    }
    let files = item.touched_files();
    if !files.is_empty() {
        println!();
        println!("{}", style("Files").underlined());
        for file in files {
            println!("  {}", file);
        }
    }
    if let Some(prd) = &item.prd_content {
        println!();
        println!("{}", style("PRD").underlined());
        println!("{}", prd);
    }
    println!();
    Ok(())
}

/// Pick `new` items interactively.
fn select_items(candidates: &[BacklogItem], reject: bool) -> Result<Vec<BacklogItem>> {
    let labels: Vec<String> = candidates
        .iter()
        .map(|i| format!("#{} [{}] {} ({})", i.id, i.priority_score, i.title, i.domain))
        .collect();
    let prompt = if reject {
        "Select items to reject"
    } else {
        "Select items to approve"
    };
    let chosen = MultiSelect::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&labels)
        .interact()
        .context("Selection cancelled")?;
    Ok(chosen.into_iter().map(|i| candidates[i].clone()).collect())
}

pub async fn cmd_approve(
    project_dir: &Path,
    verbose: bool,
    ids: &[i64],
    all: bool,
    reject: bool,
) -> Result<()> {
    let config = load_config(project_dir, verbose)?;
    let db = open_db(&config)?;
    let _lock = acquire_lock(&config, if reject { "reject" } else { "approve" })?;
    let target = if reject {
        ItemStatus::Rejected
    } else {
        ItemStatus::Approved
    };

    let items: Vec<BacklogItem> = if all {
        db.list_items(Some(ItemStatus::New)).await?
    } else if !ids.is_empty() {
        let mut found = Vec::new();
        for id in ids {
            let item = db
                .get_item(*id)
                .await?
                .with_context(|| format!("Backlog item {id} not found"))?;
            found.push(item);
        }
        found
    } else {
        let candidates = db.list_items(Some(ItemStatus::New)).await?;
        if candidates.is_empty() {
            println!("No new items to review.");
            return Ok(());
        }
        if !console::Term::stdout().is_term() {
            anyhow::bail!("No items given; pass item ids or --all");
        }
        select_items(&candidates, reject)?
    };

    let mut changed = 0;
    for item in &items {
        // Failed items may be re-approved for another attempt.
        if !item.status.can_transition_to(target) {
            println!(
                "  {} #{} is {}; cannot mark {}",
                style("skip").dim(),
                item.id,
                item.status,
                target
            );
            continue;
        }
        db.update_item_status(item.id, target).await?;
        tracing::info!(item = item.id, status = %target, "backlog item updated");
        println!("  {} #{} {}", style("✓").green(), item.id, item.title);
        changed += 1;
    }

    println!();
    println!("{} item(s) marked {}", changed, target);
    if changed > 0 && !reject {
        println!("Next: `mason execute` to implement approved items.");
    }
    Ok(())
}
