//! Project setup and inspection commands: `init`, `doctor`, `status`.

use anyhow::Result;
use console::style;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use mason::init::{init_project, is_initialized};
use mason::lock::LockManager;
use mason::mason_config::MasonConfig;
use mason::providers::GitRepo;
use mason::review::CheckpointStore;
use mason::store::{BacklogStore, RunStore};

use super::{format_cost, load_config, open_db};

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let was_initialized = is_initialized(project_dir);
    let result = init_project(project_dir, force)?;

    if result.config_written {
        let verb = if was_initialized { "Rewrote" } else { "Wrote" };
        println!("{} {}", verb, result.config_path.display());
    } else {
        println!(
            "{} already exists; kept it (use --force to overwrite)",
            result.config_path.display()
        );
    }
    println!("Data directory: {}", result.data_dir.display());
    if result.gitignore_updated {
        println!("Added the data directory to .gitignore");
    }
    println!();
    println!("Next steps:");
    println!("  1. Run `mason doctor` to check the environment");
    println!("  2. Run `mason review` to analyze the codebase");
    println!("  3. Run `mason approve` and `mason execute` to implement improvements");
    Ok(())
}

enum Check {
    Pass(String),
    Warn(String),
    Fail(String),
}

fn report(name: &str, check: &Check) {
    match check {
        Check::Pass(detail) => println!("  {} {:<12} {}", style("✓").green(), name, detail),
        Check::Warn(detail) => println!("  {} {:<12} {}", style("!").yellow(), name, detail),
        Check::Fail(detail) => println!("  {} {:<12} {}", style("✗").red(), name, detail),
    }
}

/// Run `<command> --version` and return its first output line.
async fn tool_version(command: &str) -> Result<String, String> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or_else(|| "empty command".to_string())?;
    let output = Command::new(program)
        .args(parts)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("`{program}` not runnable: {e}"))?;
    if !output.status.success() {
        return Err(format!("`{command} --version` exited with {}", output.status));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.lines().next().unwrap_or("").trim().to_string())
}

fn check_data_dir(config: &MasonConfig) -> Check {
    if let Err(e) = config.ensure_directories() {
        return Check::Fail(format!("{e:#}"));
    }
    match tempfile::NamedTempFile::new_in(&config.data_dir) {
        Ok(_) => Check::Pass(config.data_dir.display().to_string()),
        Err(e) => Check::Fail(format!("{} is not writable: {e}", config.data_dir.display())),
    }
}

fn check_lock(config: &MasonConfig) -> Check {
    match LockManager::new(&config.data_dir).read() {
        Ok(None) => Check::Pass("not held".to_string()),
        Ok(Some(lock)) if lock.is_stale() => Check::Warn(format!(
            "stale lock from pid {} ({}); it will be cleared on the next run",
            lock.pid, lock.command
        )),
        Ok(Some(lock)) => Check::Warn(format!(
            "held by pid {} running `mason {}` for {}s",
            lock.pid,
            lock.command,
            lock.age_secs()
        )),
        Err(e) => Check::Fail(format!("{e:#}")),
    }
}

pub async fn cmd_doctor(project_dir: &Path, verbose: bool) -> Result<()> {
    println!("{}", style("mason doctor").bold());
    let mut checks: Vec<(&str, Check)> = Vec::new();

    let config = match MasonConfig::new(project_dir.to_path_buf()) {
        Ok(config) => config.with_verbose(verbose),
        Err(e) => {
            report("config", &Check::Fail(format!("{e:#}")));
            anyhow::bail!("1 check(s) failed");
        }
    };

    let errors = config.file.errors();
    checks.push((
        "config",
        if !errors.is_empty() {
            Check::Fail(errors.join("; "))
        } else if !is_initialized(&config.project_dir) {
            Check::Warn("no mason.config.json; using defaults (run `mason init`)".to_string())
        } else {
            let warnings = config.file.validate();
            if warnings.is_empty() {
                Check::Pass(config.config_path().display().to_string())
            } else {
                Check::Warn(warnings.join("; "))
            }
        },
    ));

    checks.push((
        "git",
        match GitRepo::new(&config.project_dir) {
            Ok(_) => Check::Pass("repository found".to_string()),
            Err(e) => Check::Fail(format!("{e:#}")),
        },
    ));

    checks.push((
        "agent",
        match tool_version(&config.agent_cmd()).await {
            Ok(version) => Check::Pass(format!("{} {}", config.agent_cmd(), version)),
            Err(e) => Check::Fail(e),
        },
    ));

    checks.push((
        "gh",
        match tool_version("gh").await {
            Ok(version) => Check::Pass(version),
            Err(_) => Check::Warn("gh not found; pull requests will not be opened".to_string()),
        },
    ));

    checks.push(("data dir", check_data_dir(&config)));
    checks.push(("lock", check_lock(&config)));

    let mut failed = 0;
    for (name, check) in &checks {
        report(name, check);
        if matches!(check, Check::Fail(_)) {
            failed += 1;
        }
    }
    println!();
    if failed > 0 {
        anyhow::bail!("{failed} check(s) failed");
    }
    println!("{}", style("All checks passed").green());
    Ok(())
}

pub async fn cmd_status(project_dir: &Path, verbose: bool, json: bool) -> Result<()> {
    let config = load_config(project_dir, verbose)?;
    let lock = LockManager::new(&config.data_dir).read()?;
    let checkpoint = CheckpointStore::new(&config.checkpoint_dir()).load()?;

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut latest = None;
    if config.db_path().exists() {
        let db = open_db(&config)?;
        for item in db.list_items(None).await? {
            *counts.entry(item.status.to_string()).or_default() += 1;
        }
        if let Some(run) = db.latest_run().await? {
            let tasks = db.list_tasks(&run.id).await?;
            latest = Some((run, tasks));
        }
    }

    if json {
        let value = json!({
            "lock": lock,
            "checkpoint": checkpoint.as_ref().map(|c| json!({
                "id": c.id,
                "status": c.status,
                "completedDomains": c.completed_domains,
                "pendingDomains": c.pending_domains,
                "tokensUsed": c.tokens_used,
                "costSoFar": c.cost_so_far,
            })),
            "backlog": counts,
            "latestRun": latest.as_ref().map(|(run, tasks)| json!({
                "run": run,
                "tasks": tasks,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    match &lock {
        Some(lock) => println!(
            "{} `mason {}` (pid {}, {}s)",
            style("Running:").yellow().bold(),
            lock.command,
            lock.pid,
            lock.age_secs()
        ),
        None => println!("{} idle", style("Lock:").bold()),
    }

    if let Some(checkpoint) = &checkpoint {
        println!(
            "{} {} ({} done, {} pending, {})",
            style("Review:").bold(),
            checkpoint.id,
            checkpoint.completed_domains.len(),
            checkpoint.pending_domains.len(),
            format_cost(checkpoint.cost_so_far)
        );
        if !checkpoint.pending_domains.is_empty() {
            println!("  Pending: {}", checkpoint.pending_domains.join(", "));
        }
    }

    if counts.is_empty() {
        println!("{} empty", style("Backlog:").bold());
    } else {
        let parts: Vec<String> = counts.iter().map(|(s, n)| format!("{n} {s}")).collect();
        println!("{} {}", style("Backlog:").bold(), parts.join(", "));
    }

    if let Some((run, tasks)) = &latest {
        println!(
            "{} {} {} (wave {}/{}, {} tokens, {})",
            style("Last run:").bold(),
            run.id,
            run.status,
            run.current_wave,
            run.total_waves,
            run.tokens_used,
            format_cost(run.estimated_cost)
        );
        if let Some(branch) = &run.branch_name {
            println!("  Branch: {}", branch);
        }
        if let Some(url) = &run.pr_url {
            println!("  Pull request: {}", url);
        }
        for task in tasks {
            println!(
                "  {:<6} {:<14} #{:<4} {}",
                task.label(),
                task.status,
                task.item_id,
                task.subagent_type
            );
        }
    }
    println!();
    Ok(())
}
