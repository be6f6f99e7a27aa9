//! Single-instance lock for a Mason data directory.
//!
//! The lockfile lives at `<dataDir>/mason.lock` and holds the holder's pid,
//! command, start time, and hostname as JSON. A lock is stale when its pid is
//! no longer alive or it was written on another host; stale locks are replaced.
//!
//! Two guards keep concurrent acquirers apart:
//! - the check/remove/create section runs under an exclusive advisory lock on
//!   `mason.lock.guard`;
//! - the lockfile is published by hard-linking a fully written temp file, which
//!   fails if the target already exists.

mod sys;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::errors::{MasonError, MasonResult};

pub use sys::{current_hostname, process_alive};

const LOCK_FILE_NAME: &str = "mason.lock";
const GUARD_FILE_NAME: &str = "mason.lock.guard";

/// Contents of `mason.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lockfile {
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub hostname: String,
}

impl Lockfile {
    /// A lockfile describing the current process.
    pub fn for_current_process(command: &str) -> Self {
        Self {
            pid: std::process::id(),
            command: command.to_string(),
            started_at: Utc::now(),
            hostname: current_hostname(),
        }
    }

    /// Whether the holder is gone (dead pid or a different host).
    pub fn is_stale(&self) -> bool {
        self.hostname != current_hostname() || !process_alive(self.pid)
    }

    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAcquisition {
    pub acquired: bool,
    /// The lock that was found on disk, live or stale.
    pub existing_lock: Option<Lockfile>,
    /// True when `existing_lock` was stale and has been replaced.
    pub is_stale: bool,
}

/// Manages `mason.lock` for one data directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    data_dir: PathBuf,
}

impl LockManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE_NAME)
    }

    fn guard_path(&self) -> PathBuf {
        self.data_dir.join(GUARD_FILE_NAME)
    }

    /// Read the current lockfile, if any. Unparseable contents are an error.
    pub fn read(&self) -> Result<Option<Lockfile>> {
        match fs::read_to_string(self.lock_path()) {
            Ok(contents) => {
                let lock = serde_json::from_str(&contents).with_context(|| {
                    format!("Malformed lockfile: {}", self.lock_path().display())
                })?;
                Ok(Some(lock))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Failed to read lockfile"),
        }
    }

    /// Try to take the lock for `command`.
    ///
    /// A live local holder yields `acquired = false` with its details. A stale
    /// holder is removed and replaced. A malformed lockfile is treated as stale.
    pub fn acquire(&self, command: &str) -> Result<LockAcquisition> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create {}", self.data_dir.display()))?;

        let guard = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.guard_path())
            .context("Failed to open lock guard file")?;
        guard
            .lock_exclusive()
            .context("Failed to take lock guard")?;

        let result = self.acquire_locked(command);

        if let Err(e) = FileExt::unlock(&guard) {
            tracing::debug!(error = %e, "failed to unlock lock guard");
        }
        result
    }

    fn acquire_locked(&self, command: &str) -> Result<LockAcquisition> {
        let mut existing_lock = None;
        let mut is_stale = false;

        match self.read() {
            Ok(Some(lock)) => {
                if !lock.is_stale() {
                    return Ok(LockAcquisition {
                        acquired: false,
                        existing_lock: Some(lock),
                        is_stale: false,
                    });
                }
                tracing::warn!(
                    pid = lock.pid,
                    hostname = %lock.hostname,
                    command = %lock.command,
                    "replacing stale lock"
                );
                existing_lock = Some(lock);
                is_stale = true;
                self.remove_lockfile()?;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "replacing unreadable lockfile");
                is_stale = true;
                self.remove_lockfile()?;
            }
        }

        let lock = Lockfile::for_current_process(command);
        match self.publish(&lock) {
            Ok(()) => Ok(LockAcquisition {
                acquired: true,
                existing_lock,
                is_stale,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Another writer bypassed the guard; report whatever is there now.
                Ok(LockAcquisition {
                    acquired: false,
                    existing_lock: self.read().ok().flatten(),
                    is_stale: false,
                })
            }
            Err(e) => Err(e).context("Failed to write lockfile"),
        }
    }

    /// Write the lockfile to a temp file and hard-link it into place.
    fn publish(&self, lock: &Lockfile) -> io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.data_dir)?;
        let body = serde_json::to_string_pretty(lock).map_err(io::Error::other)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file().sync_all()?;
        sys::set_lock_permissions(tmp.path())?;
        fs::hard_link(tmp.path(), self.lock_path())
    }

    fn remove_lockfile(&self) -> Result<()> {
        match fs::remove_file(self.lock_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove lockfile"),
        }
    }

    /// Delete the lockfile unconditionally.
    pub fn release(&self) -> Result<()> {
        self.remove_lockfile()
    }

    /// Delete the lockfile only if `pid` holds it. Returns whether it was removed.
    pub fn release_if_held_by(&self, pid: u32) -> Result<bool> {
        match self.read() {
            Ok(Some(lock)) if lock.pid == pid => self.remove_lockfile().map(|()| true),
            _ => Ok(false),
        }
    }

    /// Acquire or fail with `LockHeld`, returning a guard that releases on drop.
    pub fn lock(&self, command: &str) -> MasonResult<LockGuard> {
        let acquisition = self.acquire(command).map_err(MasonError::storage)?;
        if !acquisition.acquired {
            return Err(self.refusal(acquisition.existing_lock));
        }
        if let (true, Some(stale)) = (acquisition.is_stale, &acquisition.existing_lock) {
            let note = MasonError::LockStale {
                pid: stale.pid,
                hostname: stale.hostname.clone(),
            };
            tracing::info!("{note}");
        }
        Ok(LockGuard {
            manager: self.clone(),
            pid: std::process::id(),
        })
    }

    /// The error for a lost acquisition. A holder that vanished or could not
    /// be read between the failed write and the re-read is a storage fault.
    fn refusal(&self, holder: Option<Lockfile>) -> MasonError {
        match holder {
            Some(holder) => MasonError::LockHeld {
                pid: holder.pid,
                age_secs: holder.age_secs(),
                command: holder.command,
                hostname: holder.hostname,
            },
            None => MasonError::storage(anyhow::anyhow!(
                "lockfile {} appeared concurrently but could not be read",
                self.lock_path().display()
            )),
        }
    }
}

/// Holds `mason.lock` until dropped.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    pid: u32,
}

impl LockGuard {
    pub fn path(&self) -> PathBuf {
        self.manager.lock_path()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release_if_held_by(self.pid) {
            tracing::warn!(error = %format!("{e:#}"), "failed to release lock");
        }
    }
}
