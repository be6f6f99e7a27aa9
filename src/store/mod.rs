//! Backlog and execution persistence.
//!
//! The orchestrators only see the [`BacklogStore`] and [`RunStore`] traits.
//! [`sqlite::MasonDb`] is the default implementation.

pub mod models;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use models::{
    BacklogItem, Complexity, ExecutionRun, ExecutionTask, ItemStatus, RunStatus, SubagentType,
    TaskStatus,
};
pub use sqlite::{DbHandle, MasonDb};

/// Persistence for backlog items.
#[async_trait]
pub trait BacklogStore: Send + Sync {
    /// Insert unsaved items, assigning ids. Returns ids in input order.
    async fn insert_items(&self, items: Vec<BacklogItem>) -> Result<Vec<i64>>;

    async fn get_item(&self, id: i64) -> Result<Option<BacklogItem>>;

    /// Items in priority order, optionally filtered by status.
    async fn list_items(&self, status: Option<ItemStatus>) -> Result<Vec<BacklogItem>>;

    async fn update_item_status(&self, id: i64, status: ItemStatus) -> Result<()>;

    async fn set_item_branch(&self, id: i64, branch_name: &str) -> Result<()>;

    /// Next free discovery order (max + 1).
    async fn next_discovery_order(&self) -> Result<i64>;
}

/// Persistence for execution runs and their tasks.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &ExecutionRun) -> Result<()>;

    async fn update_run(&self, run: &ExecutionRun) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Option<ExecutionRun>>;

    async fn latest_run(&self) -> Result<Option<ExecutionRun>>;

    /// Insert or replace a task row.
    async fn upsert_task(&self, task: &ExecutionTask) -> Result<()>;

    /// Tasks for a run ordered by wave, then task number.
    async fn list_tasks(&self, run_id: &str) -> Result<Vec<ExecutionTask>>;

    /// Tasks whose `updated_at` is strictly after `since`, oldest first.
    async fn tasks_updated_since(
        &self,
        run_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutionTask>>;
}
