//! Crash-recovery checkpoints for multi-domain reviews.
//!
//! The live checkpoint is `<dataDir>/checkpoints/review.json`. When a new
//! review supersedes it, the old record is archived as
//! `<dataDir>/checkpoints/<id>.json`.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::findings::{DomainFailure, ReviewDomainResult};
use super::fingerprint::FileHashes;
use crate::util::write_json_atomic;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Active,
    Completed,
    Abandoned,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Persisted progress of one review run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCheckpoint {
    pub schema_version: u32,
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: CheckpointStatus,
    pub config_hash: String,
    pub completed_domains: Vec<String>,
    pub pending_domains: Vec<String>,
    pub partial_results: Vec<ReviewDomainResult>,
    pub tokens_used: u64,
    pub cost_so_far: f64,
    pub file_hashes: FileHashes,
    #[serde(default)]
    pub failures: Vec<DomainFailure>,
}

impl ReviewCheckpoint {
    /// A fresh checkpoint with every domain pending.
    pub fn new(config_hash: &str, file_hashes: FileHashes, domains: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            updated_at: now,
            status: CheckpointStatus::Active,
            config_hash: config_hash.to_string(),
            completed_domains: Vec::new(),
            pending_domains: domains,
            partial_results: Vec::new(),
            tokens_used: 0,
            cost_so_far: 0.0,
            file_hashes,
            failures: Vec::new(),
        }
    }

    /// Whether a review with these inputs may continue from this checkpoint.
    pub fn is_resumable(&self, config_hash: &str, file_hashes: &FileHashes) -> bool {
        !self.status.is_terminal()
            && self.config_hash == config_hash
            && &self.file_hashes == file_hashes
    }

    /// Move `result.domain` from pending to completed. Usage is recorded
    /// separately through [`add_usage`](Self::add_usage), before the result
    /// is cached.
    pub fn complete_domain(&mut self, result: ReviewDomainResult) {
        self.pending_domains.retain(|d| d != &result.domain);
        if !self.completed_domains.contains(&result.domain) {
            self.completed_domains.push(result.domain.clone());
        }
        self.partial_results.push(result);
        self.updated_at = Utc::now();
    }

    /// Record a failure. The domain stays pending.
    pub fn record_failure(&mut self, domain: &str, message: &str) {
        self.failures.push(DomainFailure {
            domain: domain.to_string(),
            message: message.to_string(),
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Add spend from a provider call.
    pub fn add_usage(&mut self, tokens: u64, cost: f64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        self.cost_so_far += cost;
        self.updated_at = Utc::now();
    }

    pub fn mark(&mut self, status: CheckpointStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// completed ∩ pending = ∅ and no domain is listed twice.
    pub fn domains_are_disjoint(&self) -> bool {
        let mut seen = HashSet::new();
        self.completed_domains
            .iter()
            .chain(self.pending_domains.iter())
            .all(|d| seen.insert(d))
    }
}

/// Upgrade a raw record to the current schema.
fn migrate(mut value: serde_json::Value) -> Result<ReviewCheckpoint> {
    let version = value
        .get("schemaVersion")
        .and_then(|v| v.as_u64())
        .unwrap_or(1);

    if version > u64::from(CHECKPOINT_SCHEMA_VERSION) {
        bail!(
            "Checkpoint schema version {} is newer than supported version {}",
            version,
            CHECKPOINT_SCHEMA_VERSION
        );
    }

    if version == 1 {
        let obj = value
            .as_object_mut()
            .context("Checkpoint record is not a JSON object")?;
        let started = obj
            .get("startedAt")
            .cloned()
            .unwrap_or_else(|| serde_json::json!(Utc::now()));
        obj.entry("updatedAt").or_insert(started);
        obj.entry("status").or_insert(serde_json::json!("active"));
        obj.entry("failures").or_insert(serde_json::json!([]));
        obj.insert(
            "schemaVersion".to_string(),
            serde_json::json!(CHECKPOINT_SCHEMA_VERSION),
        );
        tracing::info!("migrated review checkpoint from schema v1");
    }

    serde_json::from_value(value).context("Malformed review checkpoint")
}

/// Reads and writes the live checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join("review.json")
    }

    pub fn load(&self) -> Result<Option<ReviewCheckpoint>> {
        let path = self.path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read review checkpoint"),
        };
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed review checkpoint: {}", path.display()))?;
        migrate(value).map(Some)
    }

    pub fn save(&self, checkpoint: &ReviewCheckpoint) -> Result<()> {
        write_json_atomic(&self.path(), checkpoint).context("Failed to persist review checkpoint")
    }

    /// Copy a checkpoint to `<id>.json` so it survives being superseded.
    pub fn archive(&self, checkpoint: &ReviewCheckpoint) -> Result<()> {
        let path = self.dir.join(format!("{}.json", checkpoint.id));
        write_json_atomic(&path, checkpoint).context("Failed to archive review checkpoint")
    }

    /// Mark the live checkpoint abandoned and archive it.
    pub fn abandon(&self) -> Result<Option<ReviewCheckpoint>> {
        let Some(mut checkpoint) = self.load()? else {
            return Ok(None);
        };
        if checkpoint.status == CheckpointStatus::Active {
            checkpoint.mark(CheckpointStatus::Abandoned);
            self.save(&checkpoint)?;
        }
        self.archive(&checkpoint)?;
        Ok(Some(checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn domains() -> Vec<String> {
        vec!["security".to_string(), "reliability".to_string()]
    }

    fn hashes() -> FileHashes {
        let mut h = FileHashes::new();
        h.insert("a.rs".to_string(), "1".to_string());
        h
    }

    #[test]
    fn test_complete_domain_moves_pending() {
        let mut cp = ReviewCheckpoint::new("cfg", hashes(), domains());
        cp.add_usage(100, 0.5);
        cp.complete_domain(ReviewDomainResult::new("security").with_usage(100, 0.5));

        assert_eq!(cp.completed_domains, vec!["security"]);
        assert_eq!(cp.pending_domains, vec!["reliability"]);
        assert_eq!(cp.tokens_used, 100);
        assert_eq!(cp.partial_results[0].tokens_used, 100);
        assert!(cp.domains_are_disjoint());
    }

    #[test]
    fn test_failure_leaves_domain_pending() {
        let mut cp = ReviewCheckpoint::new("cfg", hashes(), domains());
        cp.record_failure("security", "provider timeout");
        assert_eq!(cp.pending_domains.len(), 2);
        assert_eq!(cp.failures.len(), 1);
        assert_eq!(cp.failures[0].domain, "security");
    }

    #[test]
    fn test_is_resumable() {
        let mut cp = ReviewCheckpoint::new("cfg", hashes(), domains());
        assert!(cp.is_resumable("cfg", &hashes()));
        assert!(!cp.is_resumable("other", &hashes()));

        let mut changed = hashes();
        changed.insert("b.rs".to_string(), "2".to_string());
        assert!(!cp.is_resumable("cfg", &changed));

        cp.mark(CheckpointStatus::Completed);
        assert!(!cp.is_resumable("cfg", &hashes()));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load().unwrap().is_none());

        let mut cp = ReviewCheckpoint::new("cfg", hashes(), domains());
        cp.complete_domain(ReviewDomainResult::new("security"));
        store.save(&cp).unwrap();

        assert_eq!(store.load().unwrap().unwrap(), cp);
    }

    #[test]
    fn test_v1_record_migrates() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let v1 = serde_json::json!({
            "id": "old",
            "startedAt": "2025-01-01T00:00:00Z",
            "configHash": "cfg",
            "completedDomains": ["security"],
            "pendingDomains": ["reliability"],
            "partialResults": [],
            "tokensUsed": 10,
            "costSoFar": 0.1,
            "fileHashes": {"a.rs": "1"}
        });
        std::fs::write(store.path(), v1.to_string()).unwrap();

        let cp = store.load().unwrap().unwrap();
        assert_eq!(cp.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert_eq!(cp.status, CheckpointStatus::Active);
        assert_eq!(cp.updated_at, cp.started_at);
        assert!(cp.failures.is_empty());
        assert!(cp.is_resumable("cfg", &hashes()));
    }

    #[test]
    fn test_future_schema_is_error() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut value = serde_json::to_value(ReviewCheckpoint::new("cfg", hashes(), domains()))
            .unwrap();
        value["schemaVersion"] = serde_json::json!(99);
        std::fs::write(store.path(), value.to_string()).unwrap();

        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn test_abandon_archives() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let cp = ReviewCheckpoint::new("cfg", hashes(), domains());
        store.save(&cp).unwrap();

        let abandoned = store.abandon().unwrap().unwrap();
        assert_eq!(abandoned.status, CheckpointStatus::Abandoned);
        assert!(dir.path().join(format!("{}.json", cp.id)).exists());
        assert_eq!(store.load().unwrap().unwrap().status, CheckpointStatus::Abandoned);
    }
}
