use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use super::{BacklogStore, RunStore};

/// Async-safe handle to the Mason database.
///
/// Wraps `MasonDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads. Every write is a single-writer transaction.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<MasonDb>>,
}

impl DbHandle {
    pub fn new(db: MasonDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MasonDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, MasonDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct MasonDb {
    conn: Connection,
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str, what: &str) -> Result<T> {
    T::from_str(raw)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

impl MasonDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure SQLite")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS backlog_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    problem TEXT NOT NULL DEFAULT '',
                    solution TEXT NOT NULL DEFAULT '',
                    impact_score INTEGER NOT NULL,
                    effort_score INTEGER NOT NULL,
                    priority_score INTEGER NOT NULL,
                    domain TEXT NOT NULL,
                    complexity TEXT NOT NULL DEFAULT 'medium',
                    status TEXT NOT NULL DEFAULT 'new',
                    branch_name TEXT,
                    prd_content TEXT,
                    file_hashes TEXT NOT NULL DEFAULT '{}',
                    metadata TEXT NOT NULL DEFAULT 'null',
                    discovery_order INTEGER NOT NULL DEFAULT 0,
                    discovered_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS execution_runs (
                    id TEXT PRIMARY KEY,
                    item_ids TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_wave INTEGER NOT NULL DEFAULT 0,
                    total_waves INTEGER NOT NULL DEFAULT 0,
                    branch_name TEXT,
                    backup_branch TEXT,
                    original_head TEXT,
                    tokens_used INTEGER NOT NULL DEFAULT 0,
                    estimated_cost REAL NOT NULL DEFAULT 0,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS execution_tasks (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES execution_runs(id) ON DELETE CASCADE,
                    item_id INTEGER NOT NULL,
                    wave INTEGER NOT NULL,
                    task_number INTEGER NOT NULL,
                    subagent_type TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    output TEXT,
                    error_message TEXT,
                    tokens_used INTEGER NOT NULL DEFAULT 0,
                    cost REAL NOT NULL DEFAULT 0,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    updated_at TEXT NOT NULL,
                    UNIQUE(run_id, wave, task_number)
                );

                CREATE INDEX IF NOT EXISTS idx_backlog_status ON backlog_items(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_run ON execution_tasks(run_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_updated ON execution_tasks(run_id, updated_at);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (columns are nullable, safe to re-run).
        // Only "duplicate column" errors are ignored; anything else propagates.
        match self
            .conn
            .execute("ALTER TABLE execution_runs ADD COLUMN pr_url TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add pr_url column: {}", e)),
        }

        Ok(())
    }

    // ── Backlog ───────────────────────────────────────────────────────

    pub fn insert_items(&self, items: &[BacklogItem]) -> Result<Vec<i64>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            tx.execute(
                "INSERT INTO backlog_items (title, problem, solution, impact_score, effort_score,
                    priority_score, domain, complexity, status, branch_name, prd_content,
                    file_hashes, metadata, discovery_order, discovered_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    item.title,
                    item.problem,
                    item.solution,
                    item.impact_score,
                    item.effort_score,
                    item.priority_score,
                    item.domain,
                    item.complexity.as_str(),
                    item.status.as_str(),
                    item.branch_name,
                    item.prd_content,
                    serde_json::to_string(&item.file_hashes)?,
                    serde_json::to_string(&item.metadata)?,
                    item.discovery_order,
                    ts(item.discovered_at),
                    ts(item.updated_at),
                ],
            )
            .context("Failed to insert backlog item")?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit().context("Failed to commit backlog items")?;
        Ok(ids)
    }

    const ITEM_COLUMNS: &'static str = "id, title, problem, solution, impact_score, effort_score,
        priority_score, domain, complexity, status, branch_name, prd_content, file_hashes,
        metadata, discovery_order, discovered_at, updated_at";

    pub fn get_item(&self, id: i64) -> Result<Option<BacklogItem>> {
        let sql = format!("SELECT {} FROM backlog_items WHERE id = ?1", Self::ITEM_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ItemRow::from_row)
            .optional()
            .context("Failed to query backlog item")?;
        row.map(ItemRow::into_item).transpose()
    }

    pub fn list_items(&self, status: Option<ItemStatus>) -> Result<Vec<BacklogItem>> {
        let sql = format!(
            "SELECT {} FROM backlog_items WHERE (?1 IS NULL OR status = ?1)
             ORDER BY priority_score DESC, impact_score DESC, discovery_order ASC, id ASC",
            Self::ITEM_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_items")?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], ItemRow::from_row)
            .context("Failed to query backlog items")?;
        rows.map(|row| row.context("Failed to read backlog row")?.into_item())
            .collect()
    }

    pub fn update_item_status(&self, id: i64, status: ItemStatus) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE backlog_items SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(Utc::now()), id],
            )
            .context("Failed to update item status")?;
        anyhow::ensure!(changed == 1, "Backlog item {} not found", id);
        Ok(())
    }

    pub fn set_item_branch(&self, id: i64, branch_name: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE backlog_items SET branch_name = ?1, updated_at = ?2 WHERE id = ?3",
                params![branch_name, ts(Utc::now()), id],
            )
            .context("Failed to update item branch")?;
        anyhow::ensure!(changed == 1, "Backlog item {} not found", id);
        Ok(())
    }

    pub fn next_discovery_order(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(discovery_order) + 1, 0) FROM backlog_items",
                [],
                |row| row.get(0),
            )
            .context("Failed to read discovery order")
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(&self, run: &ExecutionRun) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO execution_runs (id, item_ids, status, current_wave, total_waves,
                    branch_name, backup_branch, original_head, tokens_used, estimated_cost,
                    error_message, pr_url, created_at, started_at, completed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    run.id,
                    serde_json::to_string(&run.item_ids)?,
                    run.status.as_str(),
                    run.current_wave,
                    run.total_waves,
                    run.branch_name,
                    run.backup_branch,
                    run.original_head,
                    run.tokens_used as i64,
                    run.estimated_cost,
                    run.error_message,
                    run.pr_url,
                    ts(run.created_at),
                    run.started_at.map(ts),
                    run.completed_at.map(ts),
                    ts(run.updated_at),
                ],
            )
            .context("Failed to insert execution run")?;
        Ok(())
    }

    pub fn update_run(&self, run: &ExecutionRun) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE execution_runs SET item_ids = ?2, status = ?3, current_wave = ?4,
                    total_waves = ?5, branch_name = ?6, backup_branch = ?7, original_head = ?8,
                    tokens_used = ?9, estimated_cost = ?10, error_message = ?11, pr_url = ?12,
                    started_at = ?13, completed_at = ?14, updated_at = ?15
                 WHERE id = ?1",
                params![
                    run.id,
                    serde_json::to_string(&run.item_ids)?,
                    run.status.as_str(),
                    run.current_wave,
                    run.total_waves,
                    run.branch_name,
                    run.backup_branch,
                    run.original_head,
                    run.tokens_used as i64,
                    run.estimated_cost,
                    run.error_message,
                    run.pr_url,
                    run.started_at.map(ts),
                    run.completed_at.map(ts),
                    ts(run.updated_at),
                ],
            )
            .context("Failed to update execution run")?;
        anyhow::ensure!(changed == 1, "Execution run {} not found", run.id);
        Ok(())
    }

    const RUN_COLUMNS: &'static str = "id, item_ids, status, current_wave, total_waves,
        branch_name, backup_branch, original_head, tokens_used, estimated_cost, error_message,
        pr_url, created_at, started_at, completed_at, updated_at";

    pub fn get_run(&self, id: &str) -> Result<Option<ExecutionRun>> {
        let sql = format!("SELECT {} FROM execution_runs WHERE id = ?1", Self::RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query execution run")?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn latest_run(&self) -> Result<Option<ExecutionRun>> {
        let sql = format!(
            "SELECT {} FROM execution_runs ORDER BY created_at DESC LIMIT 1",
            Self::RUN_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, [], RunRow::from_row)
            .optional()
            .context("Failed to query latest run")?;
        row.map(RunRow::into_run).transpose()
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn upsert_task(&self, task: &ExecutionTask) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO execution_tasks (id, run_id, item_id, wave, task_number,
                    subagent_type, description, status, output, error_message, tokens_used,
                    cost, attempts, created_at, started_at, completed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    output = excluded.output,
                    error_message = excluded.error_message,
                    tokens_used = excluded.tokens_used,
                    cost = excluded.cost,
                    attempts = excluded.attempts,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    updated_at = excluded.updated_at",
                params![
                    task.id,
                    task.run_id,
                    task.item_id,
                    task.wave,
                    task.task_number,
                    task.subagent_type.as_str(),
                    task.description,
                    task.status.as_str(),
                    task.output,
                    task.error_message,
                    task.tokens_used as i64,
                    task.cost,
                    task.attempts,
                    ts(task.created_at),
                    task.started_at.map(ts),
                    task.completed_at.map(ts),
                    ts(task.updated_at),
                ],
            )
            .context("Failed to upsert execution task")?;
        Ok(())
    }

    const TASK_COLUMNS: &'static str = "id, run_id, item_id, wave, task_number, subagent_type,
        description, status, output, error_message, tokens_used, cost, attempts, created_at,
        started_at, completed_at, updated_at";

    pub fn list_tasks(&self, run_id: &str) -> Result<Vec<ExecutionTask>> {
        let sql = format!(
            "SELECT {} FROM execution_tasks WHERE run_id = ?1 ORDER BY wave ASC, task_number ASC",
            Self::TASK_COLUMNS
        );
        self.query_tasks(&sql, params![run_id])
    }

    pub fn tasks_updated_since(
        &self,
        run_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutionTask>> {
        let sql = format!(
            "SELECT {} FROM execution_tasks WHERE run_id = ?1 AND updated_at > ?2
             ORDER BY updated_at ASC, wave ASC, task_number ASC",
            Self::TASK_COLUMNS
        );
        self.query_tasks(&sql, params![run_id, ts(since)])
    }

    fn query_tasks(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ExecutionTask>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params, TaskRow::from_row)
            .context("Failed to query execution tasks")?;
        rows.map(|row| row.context("Failed to read task row")?.into_task())
            .collect()
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

/// Intermediate row struct for backlog_items.
struct ItemRow {
    id: i64,
    title: String,
    problem: String,
    solution: String,
    impact_score: i64,
    effort_score: i64,
    priority_score: i64,
    domain: String,
    complexity: String,
    status: String,
    branch_name: Option<String>,
    prd_content: Option<String>,
    file_hashes: String,
    metadata: String,
    discovery_order: i64,
    discovered_at: String,
    updated_at: String,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            problem: row.get(2)?,
            solution: row.get(3)?,
            impact_score: row.get(4)?,
            effort_score: row.get(5)?,
            priority_score: row.get(6)?,
            domain: row.get(7)?,
            complexity: row.get(8)?,
            status: row.get(9)?,
            branch_name: row.get(10)?,
            prd_content: row.get(11)?,
            file_hashes: row.get(12)?,
            metadata: row.get(13)?,
            discovery_order: row.get(14)?,
            discovered_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    fn into_item(self) -> Result<BacklogItem> {
        Ok(BacklogItem {
            id: self.id,
            title: self.title,
            problem: self.problem,
            solution: self.solution,
            impact_score: self.impact_score,
            effort_score: self.effort_score,
            priority_score: self.priority_score,
            domain: self.domain,
            complexity: parse_enum(&self.complexity, "item complexity")?,
            status: parse_enum(&self.status, "item status")?,
            branch_name: self.branch_name,
            prd_content: self.prd_content,
            file_hashes: serde_json::from_str(&self.file_hashes)
                .context("Failed to parse item file_hashes JSON")?,
            metadata: serde_json::from_str(&self.metadata)
                .context("Failed to parse item metadata JSON")?,
            discovery_order: self.discovery_order,
            discovered_at: parse_ts(&self.discovered_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Intermediate row struct for execution_runs.
struct RunRow {
    id: String,
    item_ids: String,
    status: String,
    current_wave: u32,
    total_waves: u32,
    branch_name: Option<String>,
    backup_branch: Option<String>,
    original_head: Option<String>,
    tokens_used: i64,
    estimated_cost: f64,
    error_message: Option<String>,
    pr_url: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_ids: row.get(1)?,
            status: row.get(2)?,
            current_wave: row.get(3)?,
            total_waves: row.get(4)?,
            branch_name: row.get(5)?,
            backup_branch: row.get(6)?,
            original_head: row.get(7)?,
            tokens_used: row.get(8)?,
            estimated_cost: row.get(9)?,
            error_message: row.get(10)?,
            pr_url: row.get(11)?,
            created_at: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn into_run(self) -> Result<ExecutionRun> {
        Ok(ExecutionRun {
            id: self.id,
            item_ids: serde_json::from_str(&self.item_ids)
                .context("Failed to parse run item_ids JSON")?,
            status: parse_enum(&self.status, "run status")?,
            current_wave: self.current_wave,
            total_waves: self.total_waves,
            branch_name: self.branch_name,
            backup_branch: self.backup_branch,
            original_head: self.original_head,
            tokens_used: self.tokens_used.max(0) as u64,
            estimated_cost: self.estimated_cost,
            error_message: self.error_message,
            pr_url: self.pr_url,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Intermediate row struct for execution_tasks.
struct TaskRow {
    id: String,
    run_id: String,
    item_id: i64,
    wave: u32,
    task_number: u32,
    subagent_type: String,
    description: String,
    status: String,
    output: Option<String>,
    error_message: Option<String>,
    tokens_used: i64,
    cost: f64,
    attempts: u32,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            item_id: row.get(2)?,
            wave: row.get(3)?,
            task_number: row.get(4)?,
            subagent_type: row.get(5)?,
            description: row.get(6)?,
            status: row.get(7)?,
            output: row.get(8)?,
            error_message: row.get(9)?,
            tokens_used: row.get(10)?,
            cost: row.get(11)?,
            attempts: row.get(12)?,
            created_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }

    fn into_task(self) -> Result<ExecutionTask> {
        Ok(ExecutionTask {
            id: self.id,
            run_id: self.run_id,
            item_id: self.item_id,
            wave: self.wave,
            task_number: self.task_number,
            subagent_type: parse_enum(&self.subagent_type, "subagent type")?,
            description: self.description,
            status: parse_enum(&self.status, "task status")?,
            output: self.output,
            error_message: self.error_message,
            tokens_used: self.tokens_used.max(0) as u64,
            cost: self.cost,
            attempts: self.attempts,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

// ── Trait impls ───────────────────────────────────────────────────────

#[async_trait]
impl BacklogStore for DbHandle {
    async fn insert_items(&self, items: Vec<BacklogItem>) -> Result<Vec<i64>> {
        self.call(move |db| db.insert_items(&items)).await
    }

    async fn get_item(&self, id: i64) -> Result<Option<BacklogItem>> {
        self.call(move |db| db.get_item(id)).await
    }

    async fn list_items(&self, status: Option<ItemStatus>) -> Result<Vec<BacklogItem>> {
        self.call(move |db| db.list_items(status)).await
    }

    async fn update_item_status(&self, id: i64, status: ItemStatus) -> Result<()> {
        self.call(move |db| db.update_item_status(id, status)).await
    }

    async fn set_item_branch(&self, id: i64, branch_name: &str) -> Result<()> {
        let branch_name = branch_name.to_string();
        self.call(move |db| db.set_item_branch(id, &branch_name))
            .await
    }

    async fn next_discovery_order(&self) -> Result<i64> {
        self.call(|db| db.next_discovery_order()).await
    }
}

#[async_trait]
impl RunStore for DbHandle {
    async fn create_run(&self, run: &ExecutionRun) -> Result<()> {
        let run = run.clone();
        self.call(move |db| db.create_run(&run)).await
    }

    async fn update_run(&self, run: &ExecutionRun) -> Result<()> {
        let run = run.clone();
        self.call(move |db| db.update_run(&run)).await
    }

    async fn get_run(&self, id: &str) -> Result<Option<ExecutionRun>> {
        let id = id.to_string();
        self.call(move |db| db.get_run(&id)).await
    }

    async fn latest_run(&self) -> Result<Option<ExecutionRun>> {
        self.call(|db| db.latest_run()).await
    }

    async fn upsert_task(&self, task: &ExecutionTask) -> Result<()> {
        let task = task.clone();
        self.call(move |db| db.upsert_task(&task)).await
    }

    async fn list_tasks(&self, run_id: &str) -> Result<Vec<ExecutionTask>> {
        let run_id = run_id.to_string();
        self.call(move |db| db.list_tasks(&run_id)).await
    }

    async fn tasks_updated_since(
        &self,
        run_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutionTask>> {
        let run_id = run_id.to_string();
        self.call(move |db| db.tasks_updated_since(&run_id, since))
            .await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::findings::Improvement;
    use crate::review::fingerprint::FileHashes;
    use chrono::Duration;

    fn item(title: &str, impact: i64, effort: i64, order: i64) -> BacklogItem {
        BacklogItem::from_improvement(
            &Improvement::new(title, "security", impact, effort),
            &FileHashes::new(),
            order,
        )
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = MasonDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('backlog_items', 'execution_runs', 'execution_tasks')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 3);
        // re-running migrations is a no-op
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_insert_and_list_items_in_priority_order() -> Result<()> {
        let db = MasonDb::new_in_memory()?;
        let ids = db.insert_items(&[
            item("low", 3, 5, 0),
            item("high", 9, 2, 1),
            item("tie-later", 8, 3, 3),
            item("tie-earlier", 8, 3, 2),
        ])?;
        assert_eq!(ids.len(), 4);

        let titles: Vec<_> = db
            .list_items(None)?
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(titles, vec!["high", "tie-earlier", "tie-later", "low"]);
        assert_eq!(db.next_discovery_order()?, 4);
        Ok(())
    }

    #[test]
    fn test_item_status_and_branch_updates() -> Result<()> {
        let db = MasonDb::new_in_memory()?;
        let ids = db.insert_items(&[item("a", 5, 5, 0)])?;
        db.update_item_status(ids[0], ItemStatus::Approved)?;
        db.set_item_branch(ids[0], "mason/a")?;

        let stored = db.get_item(ids[0])?.unwrap();
        assert_eq!(stored.status, ItemStatus::Approved);
        assert_eq!(stored.branch_name.as_deref(), Some("mason/a"));
        assert_eq!(db.list_items(Some(ItemStatus::New))?.len(), 0);
        assert_eq!(db.list_items(Some(ItemStatus::Approved))?.len(), 1);

        assert!(db.update_item_status(999, ItemStatus::Approved).is_err());
        assert!(db.get_item(999)?.is_none());
        Ok(())
    }

    #[test]
    fn test_run_roundtrip() -> Result<()> {
        let db = MasonDb::new_in_memory()?;
        let mut run = ExecutionRun::new(vec![1, 2], 3);
        db.create_run(&run)?;

        run.status = RunStatus::Completed;
        run.pr_url = Some("https://github.com/o/r/pull/1".to_string());
        run.tokens_used = 4200;
        run.completed_at = Some(Utc::now());
        db.update_run(&run)?;

        let stored = db.get_run(&run.id)?.unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.item_ids, vec![1, 2]);
        assert_eq!(stored.pr_url, run.pr_url);
        assert_eq!(stored.tokens_used, 4200);
        assert_eq!(db.latest_run()?.unwrap().id, run.id);
        Ok(())
    }

    #[test]
    fn test_task_upsert_and_poll_by_timestamp() -> Result<()> {
        let db = MasonDb::new_in_memory()?;
        let run = ExecutionRun::new(vec![1], 1);
        db.create_run(&run)?;

        let base = Utc::now();
        let mut first = ExecutionTask::new(&run.id, 1, 1, 1, SubagentType::Explore, "look");
        first.updated_at = base;
        let mut second = ExecutionTask::new(&run.id, 1, 1, 2, SubagentType::Bash, "run");
        second.updated_at = base;
        db.upsert_task(&first)?;
        db.upsert_task(&second)?;

        second.status = TaskStatus::Completed;
        second.attempts = 1;
        second.updated_at = base + Duration::seconds(5);
        db.upsert_task(&second)?;

        assert_eq!(db.list_tasks(&run.id)?.len(), 2);
        let changed = db.tasks_updated_since(&run.id, base)?;
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, TaskStatus::Completed);
        assert_eq!(changed[0].subagent_type, SubagentType::Bash);
        assert_eq!(changed[0].attempts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_implements_stores() -> Result<()> {
        let handle = DbHandle::new(MasonDb::new_in_memory()?);
        let ids = BacklogStore::insert_items(&handle, vec![item("a", 6, 2, 0)]).await?;
        handle.update_item_status(ids[0], ItemStatus::Approved).await?;
        let approved = handle.list_items(Some(ItemStatus::Approved)).await?;
        assert_eq!(approved.len(), 1);

        let run = ExecutionRun::new(ids.clone(), 1);
        handle.create_run(&run).await?;
        assert!(handle.get_run(&run.id).await?.is_some());
        Ok(())
    }
}
