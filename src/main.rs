use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use mason::logging::{LogFormat, init_logging};
use mason::mason_config::MasonConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "mason")]
#[command(version, about = "Review a codebase with AI agents and execute the improvements")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Stderr log format: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write mason.config.json and create the data directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Check the environment: config, git, agent CLI, data directory
    Doctor,
    /// Analyze the codebase domain by domain and add findings to the backlog
    Review {
        /// Abandon any resumable checkpoint and start over
        #[arg(long)]
        fresh: bool,
        #[arg(long)]
        json: bool,
    },
    /// List backlog items by priority
    List {
        /// Only items with this status (new, approved, in_progress, ...)
        #[arg(short, long)]
        status: Option<String>,
        /// Scale priority by the configured domain weights
        #[arg(long)]
        weighted: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show one backlog item
    Show {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Approve (or reject) backlog items for execution
    Approve {
        /// Item ids; prompts interactively when omitted
        ids: Vec<i64>,
        /// Every new item
        #[arg(long)]
        all: bool,
        /// Mark the items rejected instead
        #[arg(long)]
        reject: bool,
    },
    /// Implement approved items in dependency-ordered waves
    Execute {
        /// Overrides limits.maxConcurrentItems
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Restrict the run to these approved item ids (comma-separated)
        #[arg(long, value_delimiter = ',')]
        items: Vec<i64>,
        /// Print the wave plan and stop
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the lock holder, review checkpoint, backlog counts, and last run
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only log to file once the data directory exists; `init` creates it.
    let log_dir = MasonConfig::new(project_dir.clone())
        .ok()
        .map(|config| config.log_dir())
        .filter(|dir| dir.is_dir());
    let _log_guard = init_logging(log_dir.as_deref(), cli.verbose, cli.log_format);
    tracing::debug!(project_dir = %project_dir.display(), "mason starting");

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Doctor => cmd::cmd_doctor(&project_dir, cli.verbose).await?,
        Commands::Review { fresh, json } => {
            cmd::cmd_review(&project_dir, cli.verbose, *fresh, *json).await?
        }
        Commands::List {
            status,
            weighted,
            json,
        } => {
            cmd::cmd_list(
                &project_dir,
                cli.verbose,
                status.as_deref(),
                *weighted,
                *json,
            )
            .await?
        }
        Commands::Show { id, json } => cmd::cmd_show(&project_dir, cli.verbose, *id, *json).await?,
        Commands::Approve { ids, all, reject } => {
            cmd::cmd_approve(&project_dir, cli.verbose, ids, *all, *reject).await?
        }
        Commands::Execute {
            max_concurrent,
            items,
            dry_run,
            json,
        } => {
            let opts = cmd::execute::ExecuteOptions {
                max_concurrent: *max_concurrent,
                items: items.clone(),
                dry_run: *dry_run,
                json: *json,
            };
            cmd::cmd_execute(&project_dir, cli.verbose, opts).await?
        }
        Commands::Status { json } => cmd::cmd_status(&project_dir, cli.verbose, *json).await?,
    }

    Ok(())
}
