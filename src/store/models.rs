use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::priority::priority_score;
use crate::review::findings::Improvement;
use crate::review::fingerprint::FileHashes;

// ── Backlog ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        }
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "very_high" => Ok(Self::VeryHigh),
            _ => Err(format!("Invalid complexity: {}", s)),
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    New,
    Approved,
    InProgress,
    Completed,
    Failed,
    Rejected,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Approved => "approved",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// Allowed lifecycle moves. Failed items may be re-approved for another run.
    pub fn can_transition_to(&self, to: ItemStatus) -> bool {
        matches!(
            (self, to),
            (Self::New, Self::Approved)
                | (Self::New, Self::Rejected)
                | (Self::Approved, Self::InProgress)
                | (Self::Approved, Self::Rejected)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::Failed, Self::Approved)
        )
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "approved" => Ok(Self::Approved),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid item status: {}", s)),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One improvement in the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogItem {
    pub id: i64,
    pub title: String,
    pub problem: String,
    pub solution: String,
    pub impact_score: i64,
    pub effort_score: i64,
    pub priority_score: i64,
    pub domain: String,
    pub complexity: Complexity,
    pub status: ItemStatus,
    pub branch_name: Option<String>,
    pub prd_content: Option<String>,
    pub file_hashes: FileHashes,
    pub metadata: serde_json::Value,
    pub discovery_order: i64,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BacklogItem {
    /// Build an unsaved item (id 0) from an improvement.
    ///
    /// `scope_hashes` is the full fingerprint of the review; the item keeps the
    /// hashes of the files it names. Scores are clamped to `[1,10]`.
    pub fn from_improvement(
        improvement: &Improvement,
        scope_hashes: &FileHashes,
        discovery_order: i64,
    ) -> Self {
        let impact = crate::priority::clamp_score(improvement.impact_score);
        let effort = crate::priority::clamp_score(improvement.effort_score);
        let file_hashes = improvement
            .files
            .iter()
            .map(|f| {
                let hash = scope_hashes.get(f).cloned().unwrap_or_default();
                (f.clone(), hash)
            })
            .collect();
        let now = Utc::now();
        Self {
            id: 0,
            title: improvement.title.clone(),
            problem: improvement.problem.clone(),
            solution: improvement.solution.clone(),
            impact_score: impact,
            effort_score: effort,
            priority_score: priority_score(impact, effort),
            domain: improvement.domain.clone(),
            complexity: improvement.complexity,
            status: ItemStatus::New,
            branch_name: None,
            prd_content: improvement.prd_content.clone(),
            file_hashes,
            metadata: improvement.metadata.clone(),
            discovery_order,
            discovered_at: now,
            updated_at: now,
        }
    }

    /// Files the item touches: `fileHashes` keys plus `metadata.files`.
    pub fn touched_files(&self) -> std::collections::BTreeSet<String> {
        let mut files: std::collections::BTreeSet<String> =
            self.file_hashes.keys().cloned().collect();
        if let Some(extra) = self.metadata.get("files").and_then(|v| v.as_array()) {
            files.extend(extra.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }
        files
    }
}

// ── Execution ─────────────────────────────────────────────────────────

/// The closed set of agent kinds a task can be dispatched to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubagentType {
    #[serde(rename = "Explore")]
    Explore,
    #[serde(rename = "Plan")]
    Plan,
    #[serde(rename = "Bash")]
    Bash,
    #[serde(rename = "code-reviewer")]
    CodeReviewer,
    #[serde(rename = "frontend-design")]
    FrontendDesign,
    #[serde(rename = "general-purpose")]
    GeneralPurpose,
}

impl SubagentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explore => "Explore",
            Self::Plan => "Plan",
            Self::Bash => "Bash",
            Self::CodeReviewer => "code-reviewer",
            Self::FrontendDesign => "frontend-design",
            Self::GeneralPurpose => "general-purpose",
        }
    }

    /// Lenient parse: case-insensitive, unknown names become `GeneralPurpose`.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or(Self::GeneralPurpose)
    }

    /// Read-only stages that precede implementation work on the same item.
    pub fn is_preparatory(&self) -> bool {
        matches!(self, Self::Explore | Self::Plan)
    }
}

impl FromStr for SubagentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "explore" => Ok(Self::Explore),
            "plan" => Ok(Self::Plan),
            "bash" => Ok(Self::Bash),
            "code-reviewer" => Ok(Self::CodeReviewer),
            "frontend-design" => Ok(Self::FrontendDesign),
            "general-purpose" => Ok(Self::GeneralPurpose),
            _ => Err(format!("Invalid subagent type: {}", s)),
        }
    }
}

impl fmt::Display for SubagentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRun {
    pub id: String,
    pub item_ids: Vec<i64>,
    pub status: RunStatus,
    pub current_wave: u32,
    pub total_waves: u32,
    pub branch_name: Option<String>,
    pub backup_branch: Option<String>,
    pub original_head: Option<String>,
    pub tokens_used: u64,
    pub estimated_cost: f64,
    pub error_message: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRun {
    pub fn new(item_ids: Vec<i64>, total_waves: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_ids,
            status: RunStatus::Pending,
            current_wave: 0,
            total_waves,
            branch_name: None,
            backup_branch: None,
            original_head: None,
            tokens_used: 0,
            estimated_cost: 0.0,
            error_message: None,
            pr_url: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTask {
    pub id: String,
    pub run_id: String,
    pub item_id: i64,
    pub wave: u32,
    pub task_number: u32,
    pub subagent_type: SubagentType,
    pub description: String,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub tokens_used: u64,
    pub cost: f64,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionTask {
    pub fn new(
        run_id: &str,
        item_id: i64,
        wave: u32,
        task_number: u32,
        subagent_type: SubagentType,
        description: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            item_id,
            wave,
            task_number,
            subagent_type,
            description: description.to_string(),
            status: TaskStatus::Pending,
            output: None,
            error_message: None,
            tokens_used: 0,
            cost: 0.0,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// `wave.task` label used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}.{}", self.wave, self.task_number)
    }
}
