//! Execution of approved backlog items.
//!
//! - [`planner`]: breaks items into tasks and places them in waves
//! - [`scheduler`]: runs waves in order with a bounded worker pool
//! - [`agent`]: the agent dispatch seam and nested-call limits

pub mod agent;
pub mod planner;
pub mod scheduler;

pub use agent::{AgentExecutor, AgentLimits, AgentOutcome, AgentRequest, AgentResponse, run_agent};
pub use planner::{
    ConflictDetector, ExecutionPlan, ExecutionWave, ExecutionWaveTask, FileOverlapDetector,
    NeverConflicts, TaskBreakdown, WavePlanner,
};
pub use scheduler::{
    ExecutionEvent, ExecutionScheduler, GitCollaborator, ItemResult, RollbackPoint, RunSummary,
    SchedulerConfig,
};
