//! SQLite implementation of TaskStore — default, zero-config backend.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use medlar_core::error::{MedlarError, Result};
use medlar_core::traits::TaskStore;
use medlar_core::types::*;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::migrations::Migrator;

const TASK_COLUMNS: &str = "id, kind, status, description, shell_command, tool, args, generator, \
     subtasks, file_path, url, media_id, style, parent_id, template_id, schedule_id, is_template, \
     result_summary, artifact_path, error_message, retry_count, max_retries, retry_policy_id, \
     next_retry_at, last_retry_error, created_at, started_at, finished_at";

/// Dependencies are satisfied when every upstream task is completed.
const READY_FILTER: &str = "t.status = 'pending'
       AND t.is_template = 0
       AND (t.next_retry_at IS NULL OR t.next_retry_at <= ?1)
       AND NOT EXISTS (
           SELECT 1 FROM task_dependencies d
           JOIN tasks dt ON dt.id = d.depends_on
           WHERE d.task_id = t.id AND dt.status != 'completed')";

/// SQLite-backed task store. One handle per process; the connection is
/// serialized behind a mutex and never held across an await.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .map_err(|e| MedlarError::Database(format!("SQLite open: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| MedlarError::Database(format!("SQLite pragma: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MedlarError::Database(format!("SQLite in-memory: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| MedlarError::Database(format!("SQLite pragma: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn db(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn load_dependencies(conn: &Connection, task_id: i64) -> Result<Vec<i64>> {
        let mut stmt = conn
            .prepare("SELECT depends_on FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on")
            .map_err(|e| MedlarError::Database(format!("Load deps: {e}")))?;
        let ids = stmt
            .query_map(params![task_id], |row| row.get::<_, i64>(0))
            .map_err(|e| MedlarError::Database(format!("Load deps query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Database(format!("Load deps row: {e}")))?;
        Ok(ids)
    }

    fn insert_task_row(conn: &Connection, task: &Task) -> Result<i64> {
        conn.execute(
            "INSERT INTO tasks (kind, status, description, shell_command, tool, args, generator,
                 subtasks, file_path, url, media_id, style, parent_id, template_id, schedule_id,
                 is_template, result_summary, artifact_path, error_message, retry_count,
                 max_retries, retry_policy_id, next_retry_at, last_retry_error, created_at,
                 started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)",
            params![
                task.kind.as_str(),
                task.status.as_str(),
                task.description,
                task.shell_command,
                task.tool,
                task.args.as_ref().map(|v| v.to_string()),
                task.generator,
                task.subtasks.as_ref().map(|v| v.to_string()),
                task.file_path,
                task.url,
                task.media_id,
                task.style,
                task.parent_id,
                task.template_id,
                task.schedule_id,
                task.is_template as i32,
                task.result_summary,
                task.artifact_path,
                task.error_message,
                task.retry_count,
                task.max_retries,
                task.retry_policy_id,
                task.next_retry_at.map(fmt_ts),
                task.last_retry_error,
                fmt_ts(task.created_at),
                task.started_at.map(fmt_ts),
                task.finished_at.map(fmt_ts),
            ],
        )
        .map_err(|e| MedlarError::Database(format!("Insert task: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    fn insert_edges(conn: &Connection, task_id: i64, deps: &[i64]) -> Result<()> {
        for dep in deps {
            conn.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
                params![task_id, dep],
            )
            .map_err(|e| MedlarError::Database(format!("Insert edge {task_id}->{dep}: {e}")))?;
        }
        Ok(())
    }

    /// DFS over existing edges: would `task_id → depends_on` close a cycle?
    fn would_cycle(conn: &Connection, task_id: i64, depends_on: i64) -> Result<bool> {
        if task_id == depends_on {
            return Ok(true);
        }
        let mut stack = vec![depends_on];
        let mut visited = std::collections::HashSet::new();
        while let Some(node) = stack.pop() {
            if node == task_id {
                return Ok(true);
            }
            if !visited.insert(node) {
                continue;
            }
            for next in Self::load_dependencies(conn, node)? {
                stack.push(next);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    // ── Tasks ──────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<i64> {
        let mut conn = self.db();
        let tx = conn
            .transaction()
            .map_err(|e| MedlarError::Database(format!("Begin insert: {e}")))?;
        let id = Self::insert_task_row(&tx, task)?;
        Self::insert_edges(&tx, id, &task.dependencies)?;
        tx.commit()
            .map_err(|e| MedlarError::Database(format!("Commit insert: {e}")))?;
        Ok(id)
    }

    async fn insert_task_batch(
        &self,
        tasks: &[Task],
        sibling_deps: &[Vec<usize>],
    ) -> Result<Vec<i64>> {
        let mut conn = self.db();
        let tx = conn
            .transaction()
            .map_err(|e| MedlarError::Database(format!("Begin batch: {e}")))?;
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(Self::insert_task_row(&tx, task)?);
        }
        for (i, task) in tasks.iter().enumerate() {
            Self::insert_edges(&tx, ids[i], &task.dependencies)?;
            if let Some(siblings) = sibling_deps.get(i) {
                for &pos in siblings {
                    if pos >= i {
                        return Err(MedlarError::InvalidTask(format!(
                            "subtask {i} depends on sibling {pos} that does not precede it"
                        )));
                    }
                    Self::insert_edges(&tx, ids[i], &[ids[pos]])?;
                }
            }
        }
        tx.commit()
            .map_err(|e| MedlarError::Database(format!("Commit batch: {e}")))?;
        Ok(ids)
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.db();
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()
            .map_err(|e| MedlarError::Database(format!("Get task: {e}")))?;
        match task {
            Some(mut task) => {
                task.dependencies = Self::load_dependencies(&conn, task.id)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.db();
        let (sql, filter) = match status {
            Some(s) => (
                format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id DESC LIMIT ?2"
                ),
                Some(s),
            ),
            None => (
                format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC LIMIT ?1"),
                None,
            ),
        };
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MedlarError::Database(format!("List tasks: {e}")))?;
        let rows: Vec<Task> = match filter {
            Some(s) => stmt
                .query_map(params![s.as_str(), limit as i64], task_from_row)
                .map_err(|e| MedlarError::Database(format!("List tasks query: {e}")))?
                .collect::<std::result::Result<_, _>>(),
            None => stmt
                .query_map(params![limit as i64], task_from_row)
                .map_err(|e| MedlarError::Database(format!("List tasks query: {e}")))?
                .collect::<std::result::Result<_, _>>(),
        }
        .map_err(|e| MedlarError::Database(format!("List tasks row: {e}")))?;
        let mut tasks = rows;
        for task in &mut tasks {
            task.dependencies = Self::load_dependencies(&conn, task.id)?;
        }
        Ok(tasks)
    }

    async fn list_ready_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.db();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t WHERE {READY_FILTER} ORDER BY t.id LIMIT ?2"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MedlarError::Database(format!("Ready tasks: {e}")))?;
        let mut tasks: Vec<Task> = stmt
            .query_map(params![fmt_ts(now), limit as i64], task_from_row)
            .map_err(|e| MedlarError::Database(format!("Ready tasks query: {e}")))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| MedlarError::Database(format!("Ready tasks row: {e}")))?;
        for task in &mut tasks {
            task.dependencies = Self::load_dependencies(&conn, task.id)?;
        }
        Ok(tasks)
    }

    async fn list_pending_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.db();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' AND is_template = 0 ORDER BY id"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MedlarError::Database(format!("Pending tasks: {e}")))?;
        let mut tasks: Vec<Task> = stmt
            .query_map([], task_from_row)
            .map_err(|e| MedlarError::Database(format!("Pending tasks query: {e}")))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| MedlarError::Database(format!("Pending tasks row: {e}")))?;
        for task in &mut tasks {
            task.dependencies = Self::load_dependencies(&conn, task.id)?;
        }
        Ok(tasks)
    }

    async fn mark_running(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.db();
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, fmt_ts(now)],
            )
            .map_err(|e| MedlarError::Database(format!("Mark running: {e}")))?;
        Ok(changed > 0)
    }

    async fn complete_task(
        &self,
        id: i64,
        result_summary: Option<&str>,
        artifact_path: Option<&str>,
        follow_ups: &[Task],
    ) -> Result<Vec<i64>> {
        let mut conn = self.db();
        let tx = conn
            .transaction()
            .map_err(|e| MedlarError::Database(format!("Begin complete: {e}")))?;
        let changed = tx
            .execute(
                "UPDATE tasks SET status = 'completed', result_summary = ?2,
                     artifact_path = COALESCE(?3, artifact_path), finished_at = ?4
                 WHERE id = ?1 AND status = 'running'",
                params![id, result_summary, artifact_path, fmt_ts(Utc::now())],
            )
            .map_err(|e| MedlarError::Database(format!("Complete task: {e}")))?;
        if changed == 0 {
            return Err(MedlarError::InvalidTask(format!("task {id} is not running")));
        }
        let mut ids = Vec::with_capacity(follow_ups.len());
        for follow_up in follow_ups {
            let new_id = Self::insert_task_row(&tx, follow_up)?;
            Self::insert_edges(&tx, new_id, &follow_up.dependencies)?;
            ids.push(new_id);
        }
        tx.commit()
            .map_err(|e| MedlarError::Database(format!("Commit complete: {e}")))?;
        Ok(ids)
    }

    async fn fail_task(&self, id: i64, error_message: &str) -> Result<()> {
        let conn = self.db();
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'error', error_message = ?2, finished_at = ?3
                 WHERE id = ?1 AND status NOT IN ('completed', 'error', 'cancelled')",
                params![id, error_message, fmt_ts(Utc::now())],
            )
            .map_err(|e| MedlarError::Database(format!("Fail task: {e}")))?;
        if changed == 0 {
            tracing::warn!("fail_task: task {id} already terminal");
        }
        Ok(())
    }

    async fn cancel_task(&self, id: i64) -> Result<bool> {
        let conn = self.db();
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'cancelled', finished_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id, fmt_ts(Utc::now())],
            )
            .map_err(|e| MedlarError::Database(format!("Cancel task: {e}")))?;
        Ok(changed > 0)
    }

    async fn reschedule_task(
        &self,
        id: i64,
        next_retry_at: DateTime<Utc>,
        retry_count: u32,
        max_retries: u32,
        last_error: &str,
    ) -> Result<()> {
        let conn = self.db();
        conn.execute(
            "UPDATE tasks SET status = 'pending', retry_count = ?2, max_retries = ?3,
                 next_retry_at = ?4, last_retry_error = ?5, started_at = NULL
             WHERE id = ?1",
            params![id, retry_count, max_retries, fmt_ts(next_retry_at), last_error],
        )
        .map_err(|e| MedlarError::Database(format!("Reschedule task: {e}")))?;
        Ok(())
    }

    // ── Dependencies ───────────────────────────────────────

    async fn add_dependency(&self, task_id: i64, depends_on: i64) -> Result<()> {
        let conn = self.db();
        for id in [task_id, depends_on] {
            let exists: u32 = conn
                .query_row("SELECT COUNT(*) FROM tasks WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .map_err(|e| MedlarError::Database(format!("Probe task {id}: {e}")))?;
            if exists == 0 {
                return Err(MedlarError::TaskNotFound(id));
            }
        }
        if Self::would_cycle(&conn, task_id, depends_on)? {
            return Err(MedlarError::CyclicDependency(format!(
                "{task_id} -> {depends_on}"
            )));
        }
        Self::insert_edges(&conn, task_id, &[depends_on])
    }

    async fn dependencies_of(&self, task_id: i64) -> Result<Vec<i64>> {
        let conn = self.db();
        Self::load_dependencies(&conn, task_id)
    }

    async fn dependents_of(&self, task_id: i64) -> Result<Vec<i64>> {
        let conn = self.db();
        let mut stmt = conn
            .prepare("SELECT task_id FROM task_dependencies WHERE depends_on = ?1 ORDER BY task_id")
            .map_err(|e| MedlarError::Database(format!("Dependents: {e}")))?;
        let ids = stmt
            .query_map(params![task_id], |row| row.get::<_, i64>(0))
            .map_err(|e| MedlarError::Database(format!("Dependents query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Database(format!("Dependents row: {e}")))?;
        Ok(ids)
    }

    // ── Retry ──────────────────────────────────────────────

    async fn record_retry_attempt(&self, attempt: &RetryAttempt) -> Result<i64> {
        let conn = self.db();
        conn.execute(
            "INSERT INTO retry_history (task_id, attempt_number, attempted_at, error_message,
                 error_type, delay_ms, success, execution_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attempt.task_id,
                attempt.attempt_number,
                fmt_ts(attempt.attempted_at),
                attempt.error_message,
                attempt.error_type,
                attempt.delay_ms as i64,
                attempt.success as i32,
                attempt.execution_time_ms.map(|v| v as i64),
            ],
        )
        .map_err(|e| MedlarError::Database(format!("Record attempt: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    async fn list_retry_attempts(&self, task_id: i64) -> Result<Vec<RetryAttempt>> {
        let conn = self.db();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, attempt_number, attempted_at, error_message, error_type,
                        delay_ms, success, execution_time_ms
                 FROM retry_history WHERE task_id = ?1 ORDER BY attempt_number, id",
            )
            .map_err(|e| MedlarError::Database(format!("List attempts: {e}")))?;
        let attempts = stmt
            .query_map(params![task_id], |row| {
                Ok(RetryAttempt {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    attempt_number: row.get(2)?,
                    attempted_at: parse_ts(&row.get::<_, String>(3)?),
                    error_message: row.get(4)?,
                    error_type: row.get(5)?,
                    delay_ms: row.get::<_, i64>(6)? as u64,
                    success: row.get::<_, i32>(7)? != 0,
                    execution_time_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
                })
            })
            .map_err(|e| MedlarError::Database(format!("List attempts query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Database(format!("List attempts row: {e}")))?;
        Ok(attempts)
    }

    async fn upsert_policy(&self, policy: &RetryPolicy) -> Result<i64> {
        let conn = self.db();
        let retryable = serde_json::to_string(&policy.retryable_errors).unwrap_or_default();
        let non_retryable = serde_json::to_string(&policy.non_retryable_errors).unwrap_or_default();
        conn.execute(
            "INSERT INTO retry_policies (task_kind, max_retries, backoff_strategy, base_delay_ms,
                 max_delay_ms, multiplier, retryable_errors, non_retryable_errors, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(task_kind) DO UPDATE SET
                 max_retries = excluded.max_retries,
                 backoff_strategy = excluded.backoff_strategy,
                 base_delay_ms = excluded.base_delay_ms,
                 max_delay_ms = excluded.max_delay_ms,
                 multiplier = excluded.multiplier,
                 retryable_errors = excluded.retryable_errors,
                 non_retryable_errors = excluded.non_retryable_errors,
                 enabled = excluded.enabled",
            params![
                policy.task_kind.as_str(),
                policy.max_retries,
                policy.backoff_strategy.as_str(),
                policy.base_delay_ms as i64,
                policy.max_delay_ms as i64,
                policy.multiplier,
                retryable,
                non_retryable,
                policy.enabled as i32,
            ],
        )
        .map_err(|e| MedlarError::Database(format!("Upsert policy: {e}")))?;
        let id: i64 = conn
            .query_row(
                "SELECT id FROM retry_policies WHERE task_kind = ?1",
                params![policy.task_kind.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| MedlarError::Database(format!("Upsert policy id: {e}")))?;
        Ok(id)
    }

    async fn get_policy_by_kind(&self, kind: TaskKind) -> Result<Option<RetryPolicy>> {
        let conn = self.db();
        let policy = conn
            .query_row(
                "SELECT id, task_kind, max_retries, backoff_strategy, base_delay_ms, max_delay_ms,
                        multiplier, retryable_errors, non_retryable_errors, enabled
                 FROM retry_policies WHERE task_kind = ?1",
                params![kind.as_str()],
                policy_from_row,
            )
            .optional()
            .map_err(|e| MedlarError::Database(format!("Get policy: {e}")))?;
        Ok(policy)
    }

    async fn list_policies(&self) -> Result<Vec<RetryPolicy>> {
        let conn = self.db();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_kind, max_retries, backoff_strategy, base_delay_ms, max_delay_ms,
                        multiplier, retryable_errors, non_retryable_errors, enabled
                 FROM retry_policies ORDER BY task_kind",
            )
            .map_err(|e| MedlarError::Database(format!("List policies: {e}")))?;
        let policies = stmt
            .query_map([], policy_from_row)
            .map_err(|e| MedlarError::Database(format!("List policies query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Database(format!("List policies row: {e}")))?;
        Ok(policies)
    }

    // ── Schedules ──────────────────────────────────────────

    async fn create_schedule(&self, schedule: &Schedule) -> Result<i64> {
        let conn = self.db();
        conn.execute(
            "INSERT INTO task_schedules (template_task_id, cron_expression, timezone, enabled,
                 max_instances, overlap_policy, next_run_at, last_run_at, execution_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                schedule.template_task_id,
                schedule.cron_expression,
                schedule.timezone,
                schedule.enabled as i32,
                schedule.max_instances,
                schedule.overlap_policy.as_str(),
                schedule.next_run_at.map(fmt_ts),
                schedule.last_run_at.map(fmt_ts),
                schedule.execution_count as i64,
                fmt_ts(schedule.created_at),
            ],
        )
        .map_err(|e| MedlarError::Database(format!("Create schedule: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>> {
        let conn = self.db();
        let schedule = conn
            .query_row(
                "SELECT id, template_task_id, cron_expression, timezone, enabled, max_instances,
                        overlap_policy, next_run_at, last_run_at, execution_count, created_at
                 FROM task_schedules WHERE id = ?1",
                params![id],
                schedule_from_row,
            )
            .optional()
            .map_err(|e| MedlarError::Database(format!("Get schedule: {e}")))?;
        Ok(schedule)
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.db();
        let mut stmt = conn
            .prepare(
                "SELECT id, template_task_id, cron_expression, timezone, enabled, max_instances,
                        overlap_policy, next_run_at, last_run_at, execution_count, created_at
                 FROM task_schedules ORDER BY id",
            )
            .map_err(|e| MedlarError::Database(format!("List schedules: {e}")))?;
        let schedules = stmt
            .query_map([], schedule_from_row)
            .map_err(|e| MedlarError::Database(format!("List schedules query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Database(format!("List schedules row: {e}")))?;
        Ok(schedules)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let conn = self.db();
        let mut stmt = conn
            .prepare(
                "SELECT id, template_task_id, cron_expression, timezone, enabled, max_instances,
                        overlap_policy, next_run_at, last_run_at, execution_count, created_at
                 FROM task_schedules
                 WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY id",
            )
            .map_err(|e| MedlarError::Database(format!("Due schedules: {e}")))?;
        let schedules = stmt
            .query_map(params![fmt_ts(now)], schedule_from_row)
            .map_err(|e| MedlarError::Database(format!("Due schedules query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Database(format!("Due schedules row: {e}")))?;
        Ok(schedules)
    }

    async fn update_schedule_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db();
        conn.execute(
            "UPDATE task_schedules SET next_run_at = ?2, last_run_at = ?3,
                 execution_count = execution_count + 1
             WHERE id = ?1",
            params![id, next_run_at.map(fmt_ts), fmt_ts(last_run_at)],
        )
        .map_err(|e| MedlarError::Database(format!("Update schedule: {e}")))?;
        Ok(())
    }

    async fn set_schedule_next_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.db();
        conn.execute(
            "UPDATE task_schedules SET next_run_at = ?2 WHERE id = ?1",
            params![id, next_run_at.map(fmt_ts)],
        )
        .map_err(|e| MedlarError::Database(format!("Set next run: {e}")))?;
        Ok(())
    }

    async fn instantiate_template(&self, schedule: &Schedule) -> Result<i64> {
        let mut conn = self.db();
        let tx = conn
            .transaction()
            .map_err(|e| MedlarError::Database(format!("Begin instantiate: {e}")))?;
        let template = tx
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![schedule.template_task_id],
                task_from_row,
            )
            .optional()
            .map_err(|e| MedlarError::Database(format!("Load template: {e}")))?
            .ok_or(MedlarError::TaskNotFound(schedule.template_task_id))?;
        if !template.is_template {
            return Err(MedlarError::InvalidTask(format!(
                "task {} is not a template",
                template.id
            )));
        }
        let instance = template.instantiate(schedule.id);
        let task_id = Self::insert_task_row(&tx, &instance)?;
        tx.execute(
            "INSERT INTO task_instances (schedule_id, task_id, run_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                schedule.id,
                task_id,
                uuid::Uuid::new_v4().to_string(),
                fmt_ts(Utc::now()),
            ],
        )
        .map_err(|e| MedlarError::Database(format!("Record instance: {e}")))?;
        tx.commit()
            .map_err(|e| MedlarError::Database(format!("Commit instantiate: {e}")))?;
        Ok(task_id)
    }

    async fn count_active_instances(&self, schedule_id: i64) -> Result<u32> {
        let conn = self.db();
        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM tasks
                 WHERE schedule_id = ?1 AND is_template = 0 AND status IN ('pending', 'running')",
                params![schedule_id],
                |row| row.get(0),
            )
            .map_err(|e| MedlarError::Database(format!("Active instances: {e}")))?;
        Ok(count)
    }

    async fn cancel_active_instances(&self, schedule_id: i64) -> Result<u32> {
        let conn = self.db();
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'cancelled', finished_at = ?2
                 WHERE schedule_id = ?1 AND is_template = 0 AND status IN ('pending', 'running')",
                params![schedule_id, fmt_ts(Utc::now())],
            )
            .map_err(|e| MedlarError::Database(format!("Cancel instances: {e}")))?;
        Ok(changed as u32)
    }

    // ── Analytics ──────────────────────────────────────────

    async fn log_event(&self, event: &TaskEvent) -> Result<i64> {
        let conn = self.db();
        conn.execute(
            "INSERT INTO task_logs (task_id, task_type, status, duration_ms, retries, error_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.task_id,
                event.task_kind.as_str(),
                event.status,
                event.duration_ms.map(|v| v as i64),
                event.retries,
                event.error_reason,
                fmt_ts(event.created_at),
            ],
        )
        .map_err(|e| MedlarError::Database(format!("Log event: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    async fn list_events(&self, task_id: i64) -> Result<Vec<TaskEvent>> {
        let conn = self.db();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, task_type, status, duration_ms, retries, error_reason, created_at
                 FROM task_logs WHERE task_id = ?1 ORDER BY id",
            )
            .map_err(|e| MedlarError::Database(format!("List events: {e}")))?;
        let events = stmt
            .query_map(params![task_id], event_from_row)
            .map_err(|e| MedlarError::Database(format!("List events query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Database(format!("List events row: {e}")))?;
        Ok(events)
    }

    async fn event_stats(&self) -> Result<Vec<TaskTypeStats>> {
        let conn = self.db();
        let mut stmt = conn
            .prepare(
                "SELECT task_type,
                        COUNT(*),
                        SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END),
                        COALESCE(AVG(duration_ms), 0.0),
                        COALESCE(MAX(duration_ms), 0)
                 FROM task_logs
                 WHERE status IN ('completed', 'error')
                 GROUP BY task_type ORDER BY task_type",
            )
            .map_err(|e| MedlarError::Database(format!("Event stats: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(|e| MedlarError::Database(format!("Event stats query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Database(format!("Event stats row: {e}")))?;
        let mut stats = Vec::new();
        for (kind, total, completed, failed, avg, max) in rows {
            let Ok(task_kind) = kind.parse::<TaskKind>() else {
                continue;
            };
            stats.push(TaskTypeStats {
                task_kind,
                total: total as u64,
                completed: completed as u64,
                failed: failed as u64,
                avg_duration_ms: avg,
                max_duration_ms: max as u64,
            });
        }
        Ok(stats)
    }

    async fn ready_queue_depth(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.db();
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM tasks t WHERE {READY_FILTER}"),
                params![fmt_ts(now)],
                |row| row.get(0),
            )
            .map_err(|e| MedlarError::Database(format!("Queue depth: {e}")))?;
        Ok(count as u64)
    }

    // ── Planner ────────────────────────────────────────────

    async fn record_planner_result(&self, result: &PlannerResult) -> Result<i64> {
        let conn = self.db();
        let context = serde_json::to_string(&result.context_task_ids).unwrap_or_default();
        conn.execute(
            "INSERT INTO planner_results (task_id, goal, model, context_task_ids, subtask_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.task_id,
                result.goal,
                result.model,
                context,
                result.subtask_count,
                fmt_ts(result.created_at),
            ],
        )
        .map_err(|e| MedlarError::Database(format!("Record planner result: {e}")))?;
        Ok(conn.last_insert_rowid())
    }
}

impl SqliteStore {
    /// Run all pending migrations (also seeds default policies).
    pub async fn migrate(&self) -> Result<()> {
        let mut conn = self.db();
        Migrator::up(&mut conn)?;
        tracing::info!("SQLite task schema migrated");
        Ok(())
    }
}

// ── Parsing helpers ────────────────────────────────────────

/// Fixed-width UTC timestamps so string comparison orders correctly.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|raw| serde_json::from_str(&raw).ok())
}

fn invalid_text(idx: usize, err: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
    )
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let kind: TaskKind = row
        .get::<_, String>(1)?
        .parse()
        .map_err(|e: String| invalid_text(1, e))?;
    let status: TaskStatus = row
        .get::<_, String>(2)?
        .parse()
        .map_err(|e: String| invalid_text(2, e))?;
    Ok(Task {
        id: row.get(0)?,
        kind,
        status,
        description: row.get(3)?,
        shell_command: row.get(4)?,
        tool: row.get(5)?,
        args: parse_json(row.get(6)?),
        generator: row.get(7)?,
        subtasks: parse_json(row.get(8)?),
        file_path: row.get(9)?,
        url: row.get(10)?,
        media_id: row.get(11)?,
        style: row.get(12)?,
        parent_id: row.get(13)?,
        template_id: row.get(14)?,
        schedule_id: row.get(15)?,
        is_template: row.get::<_, i32>(16)? != 0,
        result_summary: row.get(17)?,
        artifact_path: row.get(18)?,
        error_message: row.get(19)?,
        retry_count: row.get(20)?,
        max_retries: row.get(21)?,
        retry_policy_id: row.get(22)?,
        next_retry_at: row.get::<_, Option<String>>(23)?.map(|s| parse_ts(&s)),
        last_retry_error: row.get(24)?,
        created_at: parse_ts(&row.get::<_, String>(25)?),
        started_at: row.get::<_, Option<String>>(26)?.map(|s| parse_ts(&s)),
        finished_at: row.get::<_, Option<String>>(27)?.map(|s| parse_ts(&s)),
        dependencies: Vec::new(),
    })
}

fn policy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetryPolicy> {
    let kind: TaskKind = row
        .get::<_, String>(1)?
        .parse()
        .map_err(|e: String| invalid_text(1, e))?;
    let strategy: BackoffStrategy = row
        .get::<_, String>(3)?
        .parse()
        .map_err(|e: String| invalid_text(3, e))?;
    Ok(RetryPolicy {
        id: row.get(0)?,
        task_kind: kind,
        max_retries: row.get(2)?,
        backoff_strategy: strategy,
        base_delay_ms: row.get::<_, i64>(4)? as u64,
        max_delay_ms: row.get::<_, i64>(5)? as u64,
        multiplier: row.get(6)?,
        retryable_errors: serde_json::from_str(&row.get::<_, String>(7).unwrap_or_default())
            .unwrap_or_default(),
        non_retryable_errors: serde_json::from_str(&row.get::<_, String>(8).unwrap_or_default())
            .unwrap_or_default(),
        enabled: row.get::<_, i32>(9)? != 0,
    })
}

fn schedule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    let policy: OverlapPolicy = row
        .get::<_, String>(6)?
        .parse()
        .map_err(|e: String| invalid_text(6, e))?;
    Ok(Schedule {
        id: row.get(0)?,
        template_task_id: row.get(1)?,
        cron_expression: row.get(2)?,
        timezone: row.get(3)?,
        enabled: row.get::<_, i32>(4)? != 0,
        max_instances: row.get(5)?,
        overlap_policy: policy,
        next_run_at: row.get::<_, Option<String>>(7)?.map(|s| parse_ts(&s)),
        last_run_at: row.get::<_, Option<String>>(8)?.map(|s| parse_ts(&s)),
        execution_count: row.get::<_, i64>(9)? as u64,
        created_at: parse_ts(&row.get::<_, String>(10)?),
    })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskEvent> {
    let kind: TaskKind = row
        .get::<_, String>(2)?
        .parse()
        .map_err(|e: String| invalid_text(2, e))?;
    Ok(TaskEvent {
        id: row.get(0)?,
        task_id: row.get(1)?,
        task_kind: kind,
        status: row.get(3)?,
        duration_ms: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        retries: row.get(5)?,
        error_reason: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?),
    })
}
