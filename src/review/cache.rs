//! TTL-bound cache of per-domain review results.
//!
//! Entries live at `<dataDir>/cache/<key>.json` where `key` is the sha256 of
//! `{configHash, fileHashes, domain}`. A hit before `expiresAt` replaces the
//! provider call entirely.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::findings::ReviewDomainResult;
use super::fingerprint::{FileHashes, sha256_hex};
use crate::util::write_json_atomic;

/// One cached domain result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub results: ReviewDomainResult,
    pub tokens_used: u64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct ReviewCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ReviewCache {
    pub fn new(dir: &Path, ttl_hours: u64) -> Self {
        // capped at ~100 years to stay inside chrono's range
        let hours = ttl_hours.min(24 * 365 * 100) as i64;
        Self {
            dir: dir.to_path_buf(),
            ttl: Duration::hours(hours),
        }
    }

    /// Cache key for a domain under a given config and file set.
    pub fn key(config_hash: &str, file_hashes: &FileHashes, domain: &str) -> String {
        let material = serde_json::json!({
            "configHash": config_hash,
            "fileHashes": file_hashes,
            "domain": domain,
        });
        sha256_hex(material.to_string().as_bytes())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Look up a fresh entry. Expired or unreadable entries are misses.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.is_fresh(now) => Some(entry),
            Ok(_) => {
                tracing::debug!(key, "cache entry expired");
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable cache entry");
                None
            }
        }
    }

    /// Store a domain result with the configured TTL.
    pub fn put(&self, key: &str, result: &ReviewDomainResult, now: DateTime<Utc>) -> Result<()> {
        let entry = CacheEntry {
            results: ReviewDomainResult {
                from_cache: false,
                ..result.clone()
            },
            tokens_used: result.tokens_used,
            cost: result.cost,
            created_at: now,
            expires_at: now + self.ttl,
        };
        write_json_atomic(&self.entry_path(key), &entry)
            .with_context(|| format!("Failed to write cache entry {key}"))
    }

    /// Delete expired and unreadable entries. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context("Failed to list cache directory"),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let keep = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
                .is_some_and(|e| e.is_fresh(now));
            if !keep {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
