//! Cron schedules bound to template tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the scheduler does when a prior instance is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Log and drop the tick when `max_instances` are already active.
    Skip,
    /// Always instantiate.
    Queue,
    /// Cancel active instances, then instantiate.
    Replace,
}

impl OverlapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlapPolicy::Skip => "skip",
            OverlapPolicy::Queue => "queue",
            OverlapPolicy::Replace => "replace",
        }
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(OverlapPolicy::Skip),
            "queue" => Ok(OverlapPolicy::Queue),
            "replace" => Ok(OverlapPolicy::Replace),
            other => Err(format!("unknown overlap policy: {other}")),
        }
    }
}

/// A cron rule pointing at a template task (`is_template = true`, never
/// executed directly). Each fire deep-copies the template into a fresh
/// pending instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub template_task_id: i64,
    pub cron_expression: String,
    /// IANA timezone name the cron fields are evaluated in.
    pub timezone: String,
    pub enabled: bool,
    pub max_instances: u32,
    pub overlap_policy: OverlapPolicy,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(template_task_id: i64, cron_expression: &str) -> Self {
        Self {
            id: 0,
            template_task_id,
            cron_expression: cron_expression.to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
            max_instances: 1,
            overlap_policy: OverlapPolicy::Skip,
            next_run_at: None,
            last_run_at: None,
            execution_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_timezone(mut self, tz: &str) -> Self {
        self.timezone = tz.to_string();
        self
    }

    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    pub fn with_max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|at| at <= now)
    }
}
