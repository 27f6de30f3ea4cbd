//! Planner observability rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per planner expansion — what was asked, what came back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerResult {
    pub id: i64,
    pub task_id: i64,
    pub goal: String,
    pub model: String,
    /// Similar prior tasks fed into the prompt as context.
    #[serde(default)]
    pub context_task_ids: Vec<i64>,
    pub subtask_count: u32,
    pub created_at: DateTime<Utc>,
}

impl PlannerResult {
    pub fn new(task_id: i64, goal: &str, model: &str, context_task_ids: Vec<i64>, subtask_count: u32) -> Self {
        Self {
            id: 0,
            task_id,
            goal: goal.to_string(),
            model: model.to_string(),
            context_task_ids,
            subtask_count,
            created_at: Utc::now(),
        }
    }
}
