//! Content fingerprints for the review scope.
//!
//! `config_hash` covers only settings that change what an analysis would
//! produce. `scan_scope` walks the repository, applies `include`/`ignore`
//! globs, and hashes every file in scope.

use anyhow::{Context, Result};
use glob::Pattern;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::mason_config::MasonConfigFile;

/// Path (relative, `/`-separated) → sha256 hex of the file contents.
pub type FileHashes = BTreeMap<String, String>;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash of the analysis-relevant configuration.
pub fn config_hash(config: &MasonConfigFile) -> String {
    // serde_json::Value objects are key-sorted, so this is canonical.
    sha256_hex(config.analysis_inputs().to_string().as_bytes())
}

/// One file in the review scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeFile {
    pub path: String,
    pub size: u64,
    pub hash: String,
}

/// Every in-scope file, sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub files: Vec<ScopeFile>,
}

impl Scope {
    pub fn file_hashes(&self) -> FileHashes {
        self.files
            .iter()
            .map(|f| (f.path.clone(), f.hash.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Compiled include/ignore globs.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    include: Vec<Pattern>,
    ignore: Vec<Pattern>,
    skip_dirs: Vec<String>,
}

impl ScopeFilter {
    pub fn new(include: &[String], ignore: &[String], skip_dirs: Vec<String>) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| Pattern::new(p).with_context(|| format!("Invalid glob '{p}'")))
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            ignore: compile(ignore)?,
            skip_dirs,
        })
    }

    /// Filter for a config, always skipping `.git` and the data directory.
    pub fn from_config(config: &MasonConfigFile) -> Result<Self> {
        let data_dir = config.data_dir.trim_end_matches('/').to_string();
        Self::new(
            &config.include,
            &config.ignore,
            vec![".git".to_string(), data_dir],
        )
    }

    fn skips_dir(&self, rel: &str) -> bool {
        self.skip_dirs.iter().any(|d| rel == d)
            || self.ignore.iter().any(|p| p.matches(rel))
    }

    pub fn admits(&self, rel: &str) -> bool {
        if self.ignore.iter().any(|p| p.matches(rel)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches(rel))
    }
}

/// Walk `root` and hash every admitted file.
pub fn scan_scope(root: &Path, filter: &ScopeFilter) -> Result<Scope> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            match relative_path(root, entry.path()) {
                Some(rel) => !filter.skips_dir(&rel),
                None => true,
            }
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if !filter.admits(&rel) {
            continue;
        }
        let bytes = std::fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        files.push(ScopeFile {
            path: rel,
            size: bytes.len() as u64,
            hash: sha256_hex(&bytes),
        });
    }

    Ok(Scope { files })
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
