//! Unified configuration for Mason.
//!
//! Settings are read from `mason.config.json` at the repository root and
//! layered file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```json
//! {
//!   "stack": "typescript",
//!   "dataDir": ".mason",
//!   "limits": {
//!     "maxTokensPerReview": 500000,
//!     "maxCostPerReview": 5.0,
//!     "maxFilesPerAnalysis": 200,
//!     "warnAtCost": 3.0,
//!     "maxFileSize": 102400,
//!     "maxConcurrentItems": 3
//!   },
//!   "validation": { "typecheck": true, "lint": true, "test": true, "build": true },
//!   "domains": [
//!     { "name": "security", "enabled": true, "promptContext": "OWASP top 10", "weight": 1.5 }
//!   ],
//!   "ignore": ["node_modules/**", "dist/**"],
//!   "include": ["src/**"],
//!   "cacheTtlHours": 24
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{MasonError, MasonResult};

/// Name of the config file at the repository root.
pub const CONFIG_FILE_NAME: &str = "mason.config.json";

/// Budget and concurrency ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    #[serde(default = "default_max_tokens_per_review")]
    pub max_tokens_per_review: u64,
    #[serde(default = "default_max_cost_per_review")]
    pub max_cost_per_review: f64,
    #[serde(default = "default_max_files_per_analysis")]
    pub max_files_per_analysis: usize,
    #[serde(default = "default_warn_at_cost")]
    pub warn_at_cost: f64,
    /// Bytes; larger files are skipped during analysis.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_concurrent_items")]
    pub max_concurrent_items: usize,
    /// Run-level cost ceiling for `execute`. Falls back to `maxCostPerReview`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_per_execution: Option<f64>,
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
    #[serde(default = "default_max_agent_depth")]
    pub max_agent_depth: u32,
    #[serde(default = "default_max_agent_fan_out")]
    pub max_agent_fan_out: u32,
}

fn default_max_tokens_per_review() -> u64 {
    500_000
}

fn default_max_cost_per_review() -> f64 {
    5.0
}

fn default_max_files_per_analysis() -> usize {
    200
}

fn default_warn_at_cost() -> f64 {
    3.0
}

fn default_max_file_size() -> u64 {
    100 * 1024
}

fn default_max_concurrent_items() -> usize {
    3
}

fn default_max_task_attempts() -> u32 {
    1
}

fn default_max_agent_depth() -> u32 {
    2
}

fn default_max_agent_fan_out() -> u32 {
    8
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_review: default_max_tokens_per_review(),
            max_cost_per_review: default_max_cost_per_review(),
            max_files_per_analysis: default_max_files_per_analysis(),
            warn_at_cost: default_warn_at_cost(),
            max_file_size: default_max_file_size(),
            max_concurrent_items: default_max_concurrent_items(),
            max_cost_per_execution: None,
            max_task_attempts: default_max_task_attempts(),
            max_agent_depth: default_max_agent_depth(),
            max_agent_fan_out: default_max_agent_fan_out(),
        }
    }
}

impl LimitsConfig {
    /// Effective run-level cost ceiling for executions.
    pub fn execution_cost_ceiling(&self) -> f64 {
        self.max_cost_per_execution
            .unwrap_or(self.max_cost_per_review)
    }
}

/// Validation steps agents are asked to run before finishing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_true")]
    pub typecheck: bool,
    #[serde(default = "default_true")]
    pub lint: bool,
    #[serde(default = "default_true")]
    pub test: bool,
    #[serde(default = "default_true")]
    pub build: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            typecheck: true,
            lint: true,
            test: true,
            build: true,
        }
    }
}

impl ValidationConfig {
    /// Names of the enabled validation steps, in a fixed order.
    pub fn enabled_steps(&self) -> Vec<&'static str> {
        [
            (self.typecheck, "typecheck"),
            (self.lint, "lint"),
            (self.test, "test"),
            (self.build, "build"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

/// One analysis domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_context: Option<String>,
    /// Ranking multiplier for display; never alters stored scores.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl DomainConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            prompt_context: None,
            weight: default_weight(),
        }
    }
}

fn default_domains() -> Vec<DomainConfig> {
    ["frontend-ux", "api-backend", "reliability", "security", "code-quality"]
        .into_iter()
        .map(DomainConfig::new)
        .collect()
}

/// Agent command settings (not part of the documented file format, but accepted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_agent_timeout_secs() -> u64 {
    600
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

fn default_data_dir() -> String {
    ".mason".to_string()
}

fn default_cache_ttl_hours() -> u64 {
    24
}

/// The complete `mason.config.json` structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasonConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default = "default_domains")]
    pub domains: Vec<DomainConfig>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
    #[serde(default)]
    pub agent: AgentSection,
}

impl Default for MasonConfigFile {
    fn default() -> Self {
        Self {
            stack: None,
            data_dir: default_data_dir(),
            limits: LimitsConfig::default(),
            validation: ValidationConfig::default(),
            domains: default_domains(),
            ignore: Vec::new(),
            include: Vec::new(),
            cache_ttl_hours: default_cache_ttl_hours(),
            agent: AgentSection::default(),
        }
    }
}

impl MasonConfigFile {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse mason.config.json")
    }

    /// Load from `<project_dir>/mason.config.json`, or defaults when absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize mason.config.json")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Domains that take part in a review, in configured order.
    pub fn enabled_domains(&self) -> Vec<&DomainConfig> {
        self.domains.iter().filter(|d| d.enabled).collect()
    }

    /// Ranking weight for a domain (1.0 when unknown).
    pub fn domain_weight(&self, domain: &str) -> f64 {
        self.domains
            .iter()
            .find(|d| d.name == domain)
            .map_or(1.0, |d| d.weight)
    }

    /// The subset of settings that changes what an analysis would produce.
    ///
    /// Budget ceilings and display weights are excluded so tuning them does not
    /// invalidate checkpoints or cache entries.
    pub fn analysis_inputs(&self) -> serde_json::Value {
        let domains: Vec<_> = self
            .enabled_domains()
            .iter()
            .map(|d| serde_json::json!({"name": d.name, "promptContext": d.prompt_context}))
            .collect();
        serde_json::json!({
            "stack": self.stack,
            "domains": domains,
            "include": self.include,
            "ignore": self.ignore,
            "maxFileSize": self.limits.max_file_size,
            "maxFilesPerAnalysis": self.limits.max_files_per_analysis,
        })
    }

    /// Hard errors that prevent any run from starting.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let limits = &self.limits;

        if limits.max_concurrent_items == 0 {
            errors.push("limits.maxConcurrentItems must be at least 1".to_string());
        }
        if limits.max_tokens_per_review == 0 {
            errors.push("limits.maxTokensPerReview must be greater than 0".to_string());
        }
        if !(limits.max_cost_per_review > 0.0) {
            errors.push("limits.maxCostPerReview must be greater than 0".to_string());
        }
        if let Some(c) = limits.max_cost_per_execution
            && !(c > 0.0)
        {
            errors.push("limits.maxCostPerExecution must be greater than 0".to_string());
        }
        if limits.max_task_attempts == 0 {
            errors.push("limits.maxTaskAttempts must be at least 1".to_string());
        }
        if self.data_dir.trim().is_empty() {
            errors.push("dataDir must not be empty".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for domain in &self.domains {
            if domain.name.trim().is_empty() {
                errors.push("domains[].name must not be empty".to_string());
            } else if !seen.insert(domain.name.as_str()) {
                errors.push(format!("Duplicate domain '{}'", domain.name));
            }
            if !(domain.weight > 0.0) {
                errors.push(format!("Domain '{}' weight must be positive", domain.name));
            }
        }

        for pattern in self.include.iter().chain(self.ignore.iter()) {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(format!("Invalid glob '{}': {}", pattern, e));
            }
        }

        errors
    }

    /// Non-fatal configuration warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.enabled_domains().is_empty() {
            warnings.push("No domains are enabled; review will produce nothing".to_string());
        }
        if self.limits.warn_at_cost > self.limits.max_cost_per_review {
            warnings.push(format!(
                "limits.warnAtCost ({}) exceeds limits.maxCostPerReview ({}); the warning will never fire",
                self.limits.warn_at_cost, self.limits.max_cost_per_review
            ));
        }
        if self.cache_ttl_hours == 0 {
            warnings.push("cacheTtlHours is 0; review results will never be reused".to_string());
        }
        warnings
    }

    /// Fail with `ConfigInvalid` if any hard error is present.
    pub fn check(&self) -> MasonResult<()> {
        let errors = self.errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MasonError::ConfigInvalid(errors.join("; ")))
        }
    }
}

/// Runtime configuration: the parsed file plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct MasonConfig {
    /// Repository root.
    pub project_dir: PathBuf,
    /// Resolved data directory (absolute).
    pub data_dir: PathBuf,
    /// Parsed `mason.config.json`.
    pub file: MasonConfigFile,
    /// CLI override: verbose mode.
    pub verbose: bool,
}

impl MasonConfig {
    /// Load configuration for a repository, applying environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let file = MasonConfigFile::load_or_default(&project_dir)?;
        Ok(Self::from_file(project_dir, file))
    }

    /// Build from an already-parsed file (used by tests and `init`).
    pub fn from_file(project_dir: PathBuf, mut file: MasonConfigFile) -> Self {
        if let Ok(dir) = std::env::var("MASON_DATA_DIR")
            && !dir.trim().is_empty()
        {
            file.data_dir = dir;
        }
        if let Ok(cmd) = std::env::var("MASON_AGENT_CMD")
            && !cmd.trim().is_empty()
        {
            file.agent.command = Some(cmd);
        }
        let data_dir = project_dir.join(&file.data_dir);
        Self {
            project_dir,
            data_dir,
            file,
            verbose: false,
        }
    }

    /// Apply CLI overrides.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Override `limits.maxConcurrentItems` from the CLI.
    pub fn with_max_concurrent(mut self, max: Option<usize>) -> Self {
        if let Some(max) = max {
            self.file.limits.max_concurrent_items = max;
        }
        self
    }

    /// Agent CLI command (file/env → default).
    pub fn agent_cmd(&self) -> String {
        self.file
            .agent
            .command
            .clone()
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn config_path(&self) -> PathBuf {
        self.project_dir.join(CONFIG_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("mason.lock")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("mason.db")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.checkpoint_dir(),
            self.cache_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_object_uses_defaults() {
        let config = MasonConfigFile::parse("{}").unwrap();
        assert_eq!(config.data_dir, ".mason");
        assert_eq!(config.cache_ttl_hours, 24);
        assert_eq!(config.limits.max_concurrent_items, 3);
        assert_eq!(config.domains.len(), 5);
        assert!(config.errors().is_empty());
    }

    #[test]
    fn test_parse_camel_case_fields() {
        let json = r#"{
            "stack": "rust",
            "dataDir": ".state",
            "limits": { "maxTokensPerReview": 1000, "maxCostPerReview": 2.5, "maxConcurrentItems": 5 },
            "domains": [
                { "name": "security", "weight": 2.0, "promptContext": "auth flows" },
                { "name": "reliability", "enabled": false }
            ],
            "ignore": ["target/**"],
            "cacheTtlHours": 6
        }"#;
        let config = MasonConfigFile::parse(json).unwrap();
        assert_eq!(config.stack.as_deref(), Some("rust"));
        assert_eq!(config.data_dir, ".state");
        assert_eq!(config.limits.max_tokens_per_review, 1000);
        assert_eq!(config.limits.max_cost_per_review, 2.5);
        assert_eq!(config.limits.max_concurrent_items, 5);
        // unspecified limits keep their defaults
        assert_eq!(config.limits.max_files_per_analysis, 200);
        assert_eq!(config.enabled_domains().len(), 1);
        assert_eq!(config.domain_weight("security"), 2.0);
        assert_eq!(config.domain_weight("unknown"), 1.0);
        assert_eq!(config.cache_ttl_hours, 6);
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(MasonConfigFile::parse("{ not json").is_err());
    }

    #[test]
    fn test_errors_detect_bad_limits_and_duplicates() {
        let mut config = MasonConfigFile::default();
        config.limits.max_concurrent_items = 0;
        config.domains.push(DomainConfig::new("security"));
        config.ignore.push("[".to_string());

        let errors = config.errors();
        assert!(errors.iter().any(|e| e.contains("maxConcurrentItems")));
        assert!(errors.iter().any(|e| e.contains("Duplicate domain 'security'")));
        assert!(errors.iter().any(|e| e.contains("Invalid glob")));
        assert!(matches!(config.check(), Err(MasonError::ConfigInvalid(_))));
    }

    #[test]
    fn test_validate_warns_on_unreachable_warn_threshold() {
        let mut config = MasonConfigFile::default();
        config.limits.warn_at_cost = 10.0;
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("warnAtCost")));
    }

    #[test]
    fn test_analysis_inputs_ignore_budget_and_weight() {
        let base = MasonConfigFile::default();
        let mut tuned = base.clone();
        tuned.limits.max_cost_per_review = 50.0;
        tuned.domains[0].weight = 3.0;
        assert_eq!(base.analysis_inputs(), tuned.analysis_inputs());

        let mut changed = base.clone();
        changed.domains[0].prompt_context = Some("focus on forms".to_string());
        assert_ne!(base.analysis_inputs(), changed.analysis_inputs());
    }

    #[test]
    fn test_execution_cost_ceiling_falls_back() {
        let mut limits = LimitsConfig::default();
        assert_eq!(limits.execution_cost_ceiling(), 5.0);
        limits.max_cost_per_execution = Some(1.5);
        assert_eq!(limits.execution_cost_ceiling(), 1.5);
    }

    #[test]
    fn test_validation_enabled_steps() {
        let v = ValidationConfig {
            typecheck: true,
            lint: false,
            test: true,
            build: false,
        };
        assert_eq!(v.enabled_steps(), vec!["typecheck", "test"]);
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = MasonConfigFile::default();
        config.stack = Some("go".to_string());
        config.save(&path).unwrap();

        let loaded = MasonConfigFile::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = MasonConfigFile::load_or_default(dir.path()).unwrap();
        assert_eq!(config, MasonConfigFile::default());
    }

    #[test]
    fn test_runtime_paths_live_under_data_dir() {
        let dir = tempdir().unwrap();
        let config = MasonConfig::from_file(dir.path().to_path_buf(), MasonConfigFile::default());
        let data_dir = config.data_dir.clone();
        assert!(config.lock_path().starts_with(&data_dir));
        assert!(config.lock_path().ends_with("mason.lock"));
        assert!(config.checkpoint_dir().starts_with(&data_dir));
        assert!(config.db_path().ends_with("mason.db"));

        config.ensure_directories().unwrap();
        assert!(config.cache_dir().exists());
        assert!(config.log_dir().exists());
    }
}
