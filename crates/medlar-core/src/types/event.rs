//! Append-only analytics rows, one per state transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskKind;

/// One row per task state transition. Used for bottleneck detection and
/// success-rate reporting; events for a single task are totally ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: i64,
    pub task_kind: TaskKind,
    /// Status the task transitioned into (`running`, `completed`, `error`, `cancelled`).
    pub status: String,
    pub duration_ms: Option<u64>,
    pub retries: u32,
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn started(task_id: i64, task_kind: TaskKind, retries: u32) -> Self {
        Self {
            id: 0,
            task_id,
            task_kind,
            status: "running".to_string(),
            duration_ms: None,
            retries,
            error_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn completed(task_id: i64, task_kind: TaskKind, duration_ms: u64, retries: u32) -> Self {
        Self {
            id: 0,
            task_id,
            task_kind,
            status: "completed".to_string(),
            duration_ms: Some(duration_ms),
            retries,
            error_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(
        task_id: i64,
        task_kind: TaskKind,
        duration_ms: u64,
        retries: u32,
        error_reason: &str,
    ) -> Self {
        Self {
            id: 0,
            task_id,
            task_kind,
            status: "error".to_string(),
            duration_ms: Some(duration_ms),
            retries,
            error_reason: Some(error_reason.to_string()),
            created_at: Utc::now(),
        }
    }

    pub fn cancelled(task_id: i64, task_kind: TaskKind) -> Self {
        Self {
            id: 0,
            task_id,
            task_kind,
            status: "cancelled".to_string(),
            duration_ms: None,
            retries: 0,
            error_reason: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-kind aggregate over the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTypeStats {
    pub task_kind: TaskKind,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
}

impl TaskTypeStats {
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return 0.0;
        }
        self.completed as f64 / finished as f64
    }
}
