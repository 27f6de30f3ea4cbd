//! Retry policies — per-kind configuration governing retry decisions.

use serde::{Deserialize, Serialize};

use super::task::TaskKind;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Fixed => "fixed",
        }
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            "fixed" => Ok(BackoffStrategy::Fixed),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Per-kind retry policy, unique on `task_kind`. Seeded at migration time,
/// mutable through the admin surface, cached in memory with a short TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub id: i64,
    pub task_kind: TaskKind,
    pub max_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Substring patterns forcing a retry (matched lower-cased).
    #[serde(default)]
    pub retryable_errors: Vec<String>,
    /// Substring patterns refusing a retry (matched lower-cased, win over retryable).
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
    pub enabled: bool,
}

impl RetryPolicy {
    /// Built-in fallback used when no row exists for a kind.
    pub fn default_for(kind: TaskKind) -> Self {
        Self {
            id: 0,
            task_kind: kind,
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
            enabled: true,
        }
    }

    /// Pre-jitter delay for a 1-based attempt number, clamped to `max_delay_ms`.
    ///
    /// - exponential: `base · multiplier^(attempt-1)`
    /// - linear:      `base · attempt · multiplier`
    /// - fixed:       `base`
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let raw = match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1)
            }
            BackoffStrategy::Linear => self.base_delay_ms as f64 * attempt as f64 * self.multiplier,
            BackoffStrategy::Fixed => self.base_delay_ms as f64,
        };
        (raw as u64).min(self.max_delay_ms)
    }
}
