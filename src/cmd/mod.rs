//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                      |
//! |-----------------|---------------------------------------|
//! | `project`       | `Init`, `Doctor`, `Status`            |
//! | `review`        | `Review`                              |
//! | `backlog`       | `List`, `Show`, `Approve`             |
//! | `execute`       | `Execute`                             |
//!
//! State-changing commands (`review`, `approve`, `execute`) hold the
//! data-directory lock for their whole duration.

pub mod backlog;
pub mod execute;
pub mod project;
pub mod review;

pub use backlog::{cmd_approve, cmd_list, cmd_show};
pub use execute::cmd_execute;
pub use project::{cmd_doctor, cmd_init, cmd_status};
pub use review::cmd_review;

use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use mason::lock::{LockGuard, LockManager};
use mason::mason_config::MasonConfig;
use mason::store::{DbHandle, MasonDb};

/// Load and validate configuration, printing warnings.
pub fn load_config(project_dir: &Path, verbose: bool) -> Result<MasonConfig> {
    let config = MasonConfig::new(project_dir.to_path_buf())?.with_verbose(verbose);
    for warning in config.file.validate() {
        eprintln!("{} {}", console::style("warning:").yellow().bold(), warning);
    }
    config.file.check()?;
    Ok(config)
}

/// Open (creating if needed) the SQLite store in the data directory.
pub fn open_db(config: &MasonConfig) -> Result<DbHandle> {
    config.ensure_directories()?;
    Ok(DbHandle::new(MasonDb::new(&config.db_path())?))
}

/// Take the data-directory lock for `command`.
pub fn acquire_lock(config: &MasonConfig, command: &str) -> Result<LockGuard> {
    std::fs::create_dir_all(&config.data_dir)?;
    let guard = LockManager::new(&config.data_dir).lock(command)?;
    tracing::debug!(path = %guard.path().display(), command, "lock acquired");
    Ok(guard)
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn interrupted() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    ctrl_c().await;
}

/// A token cancelled on the first interrupt. In-flight work finishes and is
/// persisted; nothing new is scheduled. A second interrupt removes this
/// process's lockfile and exits with status 130.
pub fn cancel_on_ctrl_c(data_dir: &Path) -> CancellationToken {
    let token = CancellationToken::new();
    let watcher = watch_interrupts(token.clone(), data_dir.to_path_buf(), interrupted);
    tokio::spawn(async move {
        watcher.await;
        std::process::exit(130);
    });
    token
}

/// Cancel `token` on the first `next()`; return after the second, once the
/// lockfile is gone if this process held it.
async fn watch_interrupts<F, Fut>(token: CancellationToken, data_dir: PathBuf, mut next: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    next().await;
    eprintln!(
        "\n{} finishing in-flight work, then stopping (interrupt again to force quit)",
        console::style("Interrupted:").yellow().bold()
    );
    token.cancel();

    next().await;
    eprintln!(
        "\n{} exiting without waiting for in-flight work",
        console::style("Interrupted again:").red().bold()
    );
    if let Err(e) = LockManager::new(&data_dir).release_if_held_by(std::process::id()) {
        tracing::warn!(error = %format!("{e:#}"), "failed to release lock on forced exit");
    }
}

pub fn format_cost(cost: f64) -> String {
    format!("${cost:.4}")
}
