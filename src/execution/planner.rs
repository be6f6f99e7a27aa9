//! Wave planning: approved items → dependency-ordered execution waves.
//!
//! Each item contributes a sequence of stages (from its PRD, or one inferred
//! implementation task). Stages of one item occupy consecutive waves. An item
//! that conflicts with an earlier-placed item starts after that item's last
//! wave. Everything else shares waves.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use crate::priority::rank;
use crate::store::models::{BacklogItem, SubagentType};

// Compile regexes once using LazyLock
static WAVE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*#{1,6}\s*wave\s+(\d+)\b").expect("valid regex"));
static LIST_TASK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*+]\s*\[([^\]]+)\]\s*(.+?)\s*$").expect("valid regex"));
static TABLE_TASK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\|\s*(\d+)\s*\|\s*([^|]+?)\s*\|\s*([^|]+?)\s*\|").expect("valid regex")
});

/// One task inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTask {
    pub subagent_type: SubagentType,
    pub description: String,
}

/// The ordered stages of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBreakdown {
    pub stages: Vec<Vec<PlannedTask>>,
}

impl TaskBreakdown {
    /// Breakdown declared in the item's PRD, or a single inferred task.
    pub fn for_item(item: &BacklogItem) -> Self {
        item.prd_content
            .as_deref()
            .and_then(Self::parse_prd)
            .unwrap_or_else(|| Self::inferred(item))
    }

    /// One general-purpose task implementing the item's solution.
    pub fn inferred(item: &BacklogItem) -> Self {
        let mut description = format!("Implement: {}", item.title);
        if !item.solution.trim().is_empty() {
            description.push_str("\n\n");
            description.push_str(item.solution.trim());
        }
        Self {
            stages: vec![vec![PlannedTask {
                subagent_type: SubagentType::GeneralPurpose,
                description,
            }]],
        }
    }

    /// Parse `## Wave N` sections. Returns `None` when no wave declares a task.
    ///
    /// Tasks are `- [subagent] description` list items or
    /// `| n | subagent | description |` table rows.
    pub fn parse_prd(prd: &str) -> Option<Self> {
        let mut waves: BTreeMap<u32, Vec<PlannedTask>> = BTreeMap::new();
        let mut current: Option<u32> = None;

        for line in prd.lines() {
            if let Some(caps) = WAVE_HEADING.captures(line) {
                current = caps[1].parse().ok();
                continue;
            }
            let Some(wave) = current else {
                continue;
            };

            let task = if let Some(caps) = LIST_TASK.captures(line) {
                Some((caps[1].to_string(), caps[2].to_string()))
            } else {
                TABLE_TASK
                    .captures(line)
                    .map(|caps| (caps[2].to_string(), caps[3].to_string()))
            };

            if let Some((subagent, description)) = task {
                waves.entry(wave).or_default().push(PlannedTask {
                    subagent_type: SubagentType::from_name(&subagent),
                    description,
                });
            }
        }

        let stages: Vec<_> = waves.into_values().filter(|t| !t.is_empty()).collect();
        if stages.is_empty() {
            None
        } else {
            Some(Self { stages })
        }
    }
}

/// Decides whether two items must not run in the same wave.
pub trait ConflictDetector: Send + Sync {
    fn conflicts(&self, a: &BacklogItem, b: &BacklogItem) -> bool;
}

/// Items conflict when their touched file sets overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOverlapDetector;

impl ConflictDetector for FileOverlapDetector {
    fn conflicts(&self, a: &BacklogItem, b: &BacklogItem) -> bool {
        let a_files = a.touched_files();
        b.touched_files().iter().any(|f| a_files.contains(f))
    }
}

/// Never reports a conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverConflicts;

impl ConflictDetector for NeverConflicts {
    fn conflicts(&self, _a: &BacklogItem, _b: &BacklogItem) -> bool {
        false
    }
}

/// A task placed in a wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionWaveTask {
    pub item_id: i64,
    /// 1-based position within the wave.
    pub task_number: u32,
    pub subagent_type: SubagentType,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionWave {
    pub wave: u32,
    pub tasks: Vec<ExecutionWaveTask>,
    pub blocked_by: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub waves: Vec<ExecutionWave>,
    pub total_waves: u32,
}

impl ExecutionPlan {
    pub fn task_count(&self) -> usize {
        self.waves.iter().map(|w| w.tasks.len()).sum()
    }
}

pub struct WavePlanner {
    detector: Box<dyn ConflictDetector>,
}

impl Default for WavePlanner {
    fn default() -> Self {
        Self::new(Box::new(FileOverlapDetector))
    }
}

impl WavePlanner {
    pub fn new(detector: Box<dyn ConflictDetector>) -> Self {
        Self { detector }
    }

    /// Plan waves for items, using each item's PRD breakdown.
    pub fn plan(&self, items: &[BacklogItem]) -> ExecutionPlan {
        let with_breakdowns: Vec<_> = items
            .iter()
            .map(|item| (item.clone(), TaskBreakdown::for_item(item)))
            .collect();
        self.plan_with(with_breakdowns)
    }

    /// Plan waves for items with explicit breakdowns.
    pub fn plan_with(&self, mut items: Vec<(BacklogItem, TaskBreakdown)>) -> ExecutionPlan {
        // rank() orders by priority, impact, then discovery order
        let mut order: Vec<BacklogItem> = items.iter().map(|(i, _)| i.clone()).collect();
        rank(&mut order);
        items.sort_by_key(|(item, _)| {
            order
                .iter()
                .position(|o| o.id == item.id)
                .unwrap_or(usize::MAX)
        });

        let mut waves: BTreeMap<u32, (Vec<ExecutionWaveTask>, BTreeSet<u32>)> = BTreeMap::new();
        let mut placed: Vec<(&BacklogItem, u32)> = Vec::new();

        for (item, breakdown) in &items {
            let conflicting_last_waves: Vec<u32> = placed
                .iter()
                .filter(|(other, _)| self.detector.conflicts(other, item))
                .map(|(_, last)| *last)
                .collect();
            let start = conflicting_last_waves.iter().max().map_or(1, |w| w + 1);

            for (offset, stage) in breakdown.stages.iter().enumerate() {
                let wave = start + offset as u32;
                let (tasks, blocked_by) = waves.entry(wave).or_default();
                if offset == 0 {
                    blocked_by.extend(conflicting_last_waves.iter().copied());
                } else {
                    blocked_by.insert(wave - 1);
                }
                for task in stage {
                    let task_number = tasks.len() as u32 + 1;
                    tasks.push(ExecutionWaveTask {
                        item_id: item.id,
                        task_number,
                        subagent_type: task.subagent_type,
                        description: task.description.clone(),
                    });
                }
            }

            let last = start + breakdown.stages.len().saturating_sub(1) as u32;
            placed.push((item, last));
        }

        let waves: Vec<ExecutionWave> = waves
            .into_iter()
            .map(|(wave, (tasks, blocked_by))| ExecutionWave {
                wave,
                tasks,
                blocked_by: blocked_by.into_iter().collect(),
            })
            .collect();
        let total_waves = waves.len() as u32;
        ExecutionPlan { waves, total_waves }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::findings::Improvement;
    use crate::review::fingerprint::FileHashes;

    fn item(id: i64, impact: i64, effort: i64, files: &[&str]) -> BacklogItem {
        let imp = Improvement::new(&format!("item {id}"), "security", impact, effort)
            .with_solution("do the thing")
            .with_files(files.iter().map(|f| f.to_string()).collect());
        let mut item = BacklogItem::from_improvement(&imp, &FileHashes::new(), id);
        item.id = id;
        item
    }

    const THREE_WAVE_PRD: &str = "\
# PRD

Some intro text.
- [Bash] not inside a wave, ignored

## Wave 1
- [Explore] Map the auth module
- [Plan] Design the limiter

## wave 2: build
| # | Subagent | Task |
|---|----------|------|
| 1 | general-purpose | Implement the token bucket |
| 2 | frontend_design | Add the lockout banner |

### Wave 3
- [code-reviewer] Review the change
- [mystery-agent] Something odd
";

    #[test]
    fn test_parse_prd_waves() {
        let breakdown = TaskBreakdown::parse_prd(THREE_WAVE_PRD).unwrap();
        assert_eq!(breakdown.stages.len(), 3);
        assert_eq!(breakdown.stages[0].len(), 2);
        assert_eq!(breakdown.stages[0][0].subagent_type, SubagentType::Explore);
        assert_eq!(breakdown.stages[0][1].description, "Design the limiter");
        assert_eq!(breakdown.stages[1].len(), 2);
        assert_eq!(breakdown.stages[1][0].subagent_type, SubagentType::GeneralPurpose);
        assert_eq!(breakdown.stages[1][1].subagent_type, SubagentType::FrontendDesign);
        assert_eq!(breakdown.stages[2][0].subagent_type, SubagentType::CodeReviewer);
        assert_eq!(breakdown.stages[2][1].subagent_type, SubagentType::GeneralPurpose);
    }

    #[test]
    fn test_prd_without_waves_is_inferred() {
        assert!(TaskBreakdown::parse_prd("# Just prose\n- a bullet").is_none());
        let mut it = item(1, 5, 5, &[]);
        it.prd_content = Some("no waves here".to_string());
        let breakdown = TaskBreakdown::for_item(&it);
        assert_eq!(breakdown.stages.len(), 1);
        assert_eq!(breakdown.stages[0][0].subagent_type, SubagentType::GeneralPurpose);
        assert!(breakdown.stages[0][0].description.contains("item 1"));
        assert!(breakdown.stages[0][0].description.contains("do the thing"));
    }

    #[test]
    fn test_independent_items_share_one_wave() {
        let a = item(1, 8, 3, &["src/a.rs"]);
        let b = item(2, 5, 5, &["src/b.rs"]);
        let plan = WavePlanner::default().plan(&[b, a]);

        assert_eq!(plan.total_waves, 1);
        assert_eq!(plan.waves[0].wave, 1);
        assert!(plan.waves[0].blocked_by.is_empty());
        let ids: Vec<_> = plan.waves[0].tasks.iter().map(|t| t.item_id).collect();
        // higher priority item placed first
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(plan.waves[0].tasks[1].task_number, 2);
    }

    #[test]
    fn test_overlapping_files_serialize_items() {
        let a = item(1, 8, 3, &["src/shared.rs"]);
        let b = item(2, 5, 5, &["src/shared.rs", "src/b.rs"]);
        let c = item(3, 4, 4, &["src/c.rs"]);
        let plan = WavePlanner::default().plan(&[a, b, c]);

        assert_eq!(plan.total_waves, 2);
        let wave1: Vec<_> = plan.waves[0].tasks.iter().map(|t| t.item_id).collect();
        assert_eq!(wave1, vec![1, 3]);
        assert_eq!(plan.waves[1].tasks[0].item_id, 2);
        assert_eq!(plan.waves[1].blocked_by, vec![1]);
    }

    #[test]
    fn test_never_conflicts_ignores_overlap() {
        let a = item(1, 8, 3, &["src/shared.rs"]);
        let b = item(2, 5, 5, &["src/shared.rs"]);
        let plan = WavePlanner::new(Box::new(NeverConflicts)).plan(&[a, b]);
        assert_eq!(plan.total_waves, 1);
        assert_eq!(plan.task_count(), 2);
    }

    #[test]
    fn test_prd_stages_occupy_consecutive_waves() {
        let mut a = item(1, 8, 3, &["src/auth.rs"]);
        a.prd_content = Some(THREE_WAVE_PRD.to_string());
        let b = item(2, 5, 5, &["src/auth.rs"]);
        let plan = WavePlanner::default().plan(&[a, b]);

        // a: waves 1-3, b conflicts → wave 4 blocked by a's last wave
        assert_eq!(plan.total_waves, 4);
        assert_eq!(plan.waves[1].blocked_by, vec![1]);
        assert_eq!(plan.waves[2].blocked_by, vec![2]);
        assert_eq!(plan.waves[3].blocked_by, vec![3]);
        assert_eq!(plan.waves[3].tasks[0].item_id, 2);
        let numbers: Vec<u32> = plan.waves.iter().map(|w| w.wave).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_metadata_files_count_as_overlap() {
        let mut a = item(1, 8, 3, &[]);
        let mut b = item(2, 5, 5, &[]);
        assert!(!FileOverlapDetector.conflicts(&a, &b));
        a.metadata = serde_json::json!({"files": ["src/x.rs"]});
        b.metadata = serde_json::json!({"files": ["src/x.rs"]});
        assert!(FileOverlapDetector.conflicts(&a, &b));
    }
}
