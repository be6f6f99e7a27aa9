//! Review output types.
//!
//! - [`Improvement`]: one candidate backlog item reported by a domain analysis
//! - [`FileSkip`]: a file left out of an analysis and why
//! - [`ReviewDomainResult`]: everything one domain analysis produced
//! - [`DomainFailure`]: a recorded domain failure
//!
//! ## Example
//!
//! ```
//! use mason::review::findings::{Improvement, ReviewDomainResult};
//!
//! let improvement = Improvement::new("Add rate limiting", "security", 8, 3)
//!     .with_problem("Login endpoint accepts unlimited attempts")
//!     .with_solution("Add a token bucket per IP")
//!     .with_files(vec!["src/auth.rs".to_string()]);
//!
//! let result = ReviewDomainResult::new("security").add_improvement(improvement);
//! assert_eq!(result.improvements.len(), 1);
//! assert_eq!(result.improvements[0].impact_score, 8);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::store::models::Complexity;

/// A candidate improvement found by a domain analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Improvement {
    pub title: String,
    #[serde(default)]
    pub problem: String,
    #[serde(default)]
    pub solution: String,
    pub domain: String,
    pub impact_score: i64,
    pub effort_score: i64,
    #[serde(default)]
    pub complexity: Complexity,
    /// Files the improvement touches, relative to the repository root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_content: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Improvement {
    pub fn new(title: &str, domain: &str, impact: i64, effort: i64) -> Self {
        Self {
            title: title.to_string(),
            problem: String::new(),
            solution: String::new(),
            domain: domain.to_string(),
            impact_score: impact,
            effort_score: effort,
            complexity: Complexity::default(),
            files: Vec::new(),
            prd_content: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_problem(mut self, problem: &str) -> Self {
        self.problem = problem.to_string();
        self
    }

    pub fn with_solution(mut self, solution: &str) -> Self {
        self.solution = solution.to_string();
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_prd(mut self, prd: &str) -> Self {
        self.prd_content = Some(prd.to_string());
        self
    }

    /// Lowercased, whitespace-collapsed title used for cross-domain dedup.
    pub fn dedup_key(&self) -> String {
        normalize_title(&self.title)
    }
}

pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drop later improvements whose normalized title was already seen.
pub fn dedup_improvements(improvements: Vec<Improvement>) -> Vec<Improvement> {
    let mut seen = HashSet::new();
    improvements
        .into_iter()
        .filter(|imp| seen.insert(imp.dedup_key()))
        .collect()
}

/// A file excluded from an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSkip {
    pub path: String,
    pub reason: String,
}

impl FileSkip {
    pub const FILE_LIMIT: &'static str = "file limit";
    pub const TOO_LARGE: &'static str = "too large";

    pub fn file_limit(path: &str) -> Self {
        Self {
            path: path.to_string(),
            reason: Self::FILE_LIMIT.to_string(),
        }
    }

    pub fn too_large(path: &str) -> Self {
        Self {
            path: path.to_string(),
            reason: Self::TOO_LARGE.to_string(),
        }
    }
}

/// What one domain analysis produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDomainResult {
    pub domain: String,
    #[serde(default)]
    pub improvements: Vec<Improvement>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub files_analyzed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<FileSkip>,
    /// Set when this result was served from the review cache.
    #[serde(default)]
    pub from_cache: bool,
}

impl ReviewDomainResult {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            improvements: Vec::new(),
            tokens_used: 0,
            cost: 0.0,
            files_analyzed: 0,
            skipped: Vec::new(),
            from_cache: false,
        }
    }

    pub fn add_improvement(mut self, improvement: Improvement) -> Self {
        self.improvements.push(improvement);
        self
    }

    pub fn with_usage(mut self, tokens: u64, cost: f64) -> Self {
        self.tokens_used = tokens;
        self.cost = cost;
        self
    }
}

/// A domain that failed during a review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainFailure {
    pub domain: String,
    pub message: String,
    pub at: DateTime<Utc>,
}
