//! Retry audit rows and manager decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable audit record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: i64,
    pub task_id: i64,
    /// 1-based attempt number.
    pub attempt_number: u32,
    pub attempted_at: DateTime<Utc>,
    pub error_message: Option<String>,
    /// Classified error type (`timeout`, `network`, `permanent`, ...).
    pub error_type: Option<String>,
    /// Delay scheduled before the next attempt (0 when none).
    pub delay_ms: u64,
    pub success: bool,
    pub execution_time_ms: Option<u64>,
}

impl RetryAttempt {
    pub fn success(task_id: i64, attempt_number: u32, execution_time_ms: u64) -> Self {
        Self {
            id: 0,
            task_id,
            attempt_number,
            attempted_at: Utc::now(),
            error_message: None,
            error_type: None,
            delay_ms: 0,
            success: true,
            execution_time_ms: Some(execution_time_ms),
        }
    }

    pub fn failure(
        task_id: i64,
        attempt_number: u32,
        error_message: &str,
        error_type: &str,
        delay_ms: u64,
    ) -> Self {
        Self {
            id: 0,
            task_id,
            attempt_number,
            attempted_at: Utc::now(),
            error_message: Some(error_message.to_string()),
            error_type: Some(error_type.to_string()),
            delay_ms,
            success: false,
            execution_time_ms: None,
        }
    }
}

/// What the retry manager needs to know about a failed task.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryContext {
    pub task_id: i64,
    pub task_kind: super::task::TaskKind,
    /// Retries already performed (the task's `retry_count`).
    pub current_attempt: u32,
    /// Per-task budget override; None defers to the kind's policy.
    pub max_retries_override: Option<u32>,
}

impl From<&super::task::Task> for RetryContext {
    fn from(task: &super::task::Task) -> Self {
        Self {
            task_id: task.id,
            task_kind: task.kind,
            current_attempt: task.retry_count,
            max_retries_override: (task.max_retries > 0).then_some(task.max_retries),
        }
    }
}

/// Outcome of `RetryManager::should_retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay_ms: u64,
    pub reason: String,
    /// 1-based number of the attempt this decision schedules (or refused).
    pub next_attempt: u32,
}

impl RetryDecision {
    pub fn retry(delay_ms: u64, reason: impl Into<String>, next_attempt: u32) -> Self {
        Self {
            should_retry: true,
            delay_ms,
            reason: reason.into(),
            next_attempt,
        }
    }

    pub fn refuse(reason: impl Into<String>, next_attempt: u32) -> Self {
        Self {
            should_retry: false,
            delay_ms: 0,
            reason: reason.into(),
            next_attempt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_constructors() {
        let ok = RetryAttempt::success(5, 2, 120);
        assert!(ok.success);
        assert_eq!(ok.execution_time_ms, Some(120));
        assert_eq!(ok.delay_ms, 0);

        let bad = RetryAttempt::failure(5, 1, "connection timeout", "timeout", 1000);
        assert!(!bad.success);
        assert_eq!(bad.error_type.as_deref(), Some("timeout"));
        assert_eq!(bad.delay_ms, 1000);
    }

    #[test]
    fn test_context_from_task() {
        use super::super::task::{Task, TaskKind};
        let mut task = Task::shell("true");
        task.id = 4;
        task.retry_count = 1;
        let ctx = RetryContext::from(&task);
        assert_eq!(ctx.task_id, 4);
        assert_eq!(ctx.task_kind, TaskKind::Shell);
        assert_eq!(ctx.current_attempt, 1);
        // max_retries 0 means the policy's budget governs.
        assert_eq!(ctx.max_retries_override, None);

        task.max_retries = 5;
        assert_eq!(RetryContext::from(&task).max_retries_override, Some(5));
    }

    #[test]
    fn test_decision_constructors() {
        let d = RetryDecision::retry(500, "transient network error", 2);
        assert!(d.should_retry);
        assert_eq!(d.delay_ms, 500);

        let r = RetryDecision::refuse("Maximum retries exceeded", 4);
        assert!(!r.should_retry);
        assert_eq!(r.delay_ms, 0);
    }
}
