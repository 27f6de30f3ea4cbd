//! Persistent store trait — the single owner of all engine state.
//!
//! Every write touching more than one row (insert with dependencies, subtask
//! expansion, completion with follow-ups, template instantiation) happens in
//! one transaction; failure rolls back the whole batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    PlannerResult, RetryAttempt, RetryPolicy, Schedule, Task, TaskEvent, TaskStatus, TaskTypeStats,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    // ── Tasks ──────────────────────────────────────────────

    /// Insert a task (and its dependency edges) in one transaction.
    /// Returns the assigned id.
    async fn insert_task(&self, task: &Task) -> Result<i64>;

    /// Insert a batch of sibling tasks in one transaction. `sibling_deps[i]`
    /// lists 0-based positions of earlier batch members task `i` depends on,
    /// resolved to fresh ids; absolute ids in `tasks[i].dependencies` are
    /// kept as-is. Returns the assigned ids in input order.
    async fn insert_task_batch(
        &self,
        tasks: &[Task],
        sibling_deps: &[Vec<usize>],
    ) -> Result<Vec<i64>>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>>;

    async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>>;

    /// Tasks that are pending, retry-due, not templates, and whose
    /// dependencies are all completed.
    async fn list_ready_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>>;

    /// All non-template pending tasks (resolver rebuild on startup).
    async fn list_pending_tasks(&self) -> Result<Vec<Task>>;

    /// Compare-and-set `pending → running`, stamping `started_at`.
    /// Returns false when another worker won the claim.
    async fn mark_running(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Transition `running → completed`, set `result_summary`/`artifact_path`
    /// and `finished_at`, and insert `follow_ups` — all in one transaction so
    /// a crash can never leave orphaned follow-ups. Returns follow-up ids.
    async fn complete_task(
        &self,
        id: i64,
        result_summary: Option<&str>,
        artifact_path: Option<&str>,
        follow_ups: &[Task],
    ) -> Result<Vec<i64>>;

    /// Transition to terminal `error` with `error_message` and `finished_at`.
    async fn fail_task(&self, id: i64, error_message: &str) -> Result<()>;

    /// Cancel a pending or running task. Returns false when already terminal.
    async fn cancel_task(&self, id: i64) -> Result<bool>;

    /// Return a failed task to `pending` for a later attempt: bump
    /// `retry_count`, stamp the effective `max_retries` budget, set
    /// `next_retry_at` and `last_retry_error`.
    async fn reschedule_task(
        &self,
        id: i64,
        next_retry_at: DateTime<Utc>,
        retry_count: u32,
        max_retries: u32,
        last_error: &str,
    ) -> Result<()>;

    // ── Dependencies ───────────────────────────────────────

    /// Add an edge `task_id → depends_on`. Rejects edges that would close a
    /// cycle with `MedlarError::CyclicDependency`, leaving the graph unchanged.
    async fn add_dependency(&self, task_id: i64, depends_on: i64) -> Result<()>;

    async fn dependencies_of(&self, task_id: i64) -> Result<Vec<i64>>;

    async fn dependents_of(&self, task_id: i64) -> Result<Vec<i64>>;

    // ── Retry ──────────────────────────────────────────────

    async fn record_retry_attempt(&self, attempt: &RetryAttempt) -> Result<i64>;

    async fn list_retry_attempts(&self, task_id: i64) -> Result<Vec<RetryAttempt>>;

    async fn upsert_policy(&self, policy: &RetryPolicy) -> Result<i64>;

    async fn get_policy_by_kind(&self, kind: crate::types::TaskKind) -> Result<Option<RetryPolicy>>;

    async fn list_policies(&self) -> Result<Vec<RetryPolicy>>;

    // ── Schedules ──────────────────────────────────────────

    async fn create_schedule(&self, schedule: &Schedule) -> Result<i64>;

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;

    /// Advance bookkeeping after a fire: `next_run_at`, `last_run_at`,
    /// `execution_count`.
    async fn update_schedule_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Set `next_run_at` without touching run bookkeeping (initial priming).
    async fn set_schedule_next_run(
        &self,
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Deep-copy the schedule's template into a fresh pending instance and
    /// record the `task_instances` row, in one transaction. Returns the new id.
    async fn instantiate_template(&self, schedule: &Schedule) -> Result<i64>;

    /// Count non-terminal instances spawned from this schedule.
    async fn count_active_instances(&self, schedule_id: i64) -> Result<u32>;

    /// Cancel all non-terminal instances of this schedule. Returns the count.
    async fn cancel_active_instances(&self, schedule_id: i64) -> Result<u32>;

    // ── Analytics ──────────────────────────────────────────

    async fn log_event(&self, event: &TaskEvent) -> Result<i64>;

    async fn list_events(&self, task_id: i64) -> Result<Vec<TaskEvent>>;

    async fn event_stats(&self) -> Result<Vec<TaskTypeStats>>;

    /// Current depth of the ready queue (backpressure signal).
    async fn ready_queue_depth(&self, now: DateTime<Utc>) -> Result<u64>;

    // ── Planner ────────────────────────────────────────────

    async fn record_planner_result(&self, result: &PlannerResult) -> Result<i64>;
}
