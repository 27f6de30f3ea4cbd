//! Retry manager — policy lookup, error classification, backoff.
//!
//! Policies are cached per kind with a short TTL so the hot failure path
//! stays off the store. Classification scans the lower-cased error text
//! against policy patterns first (confidence 0.9), then built-in heuristics
//! (0.7). Anything below the 0.5 confidence threshold is refused — unknown
//! errors must not loop forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;

use medlar_core::error::Result;
use medlar_core::traits::TaskStore;
use medlar_core::types::{RetryContext, RetryDecision, RetryPolicy, TaskKind};

const CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Built-in transient markers: (patterns, label).
const TRANSIENT_HEURISTICS: &[(&[&str], &str)] = &[
    (&["timeout", "timed out"], "timeout"),
    (&["network", "connection", "dns"], "network"),
    (&["rate limit", "too many requests"], "rate_limit"),
    (&["server error", "internal server", "502", "503", "504"], "server_error"),
];

/// Built-in permanent markers: (patterns, label).
const PERMANENT_HEURISTICS: &[(&[&str], &str)] = &[
    (&["syntax", "parse"], "syntax"),
    (&["permission", "unauthorized", "forbidden"], "permission"),
    (&["not found", "404"], "not_found"),
];

/// Classification outcome for one error string.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClass {
    pub retryable: bool,
    pub confidence: f64,
    pub error_type: String,
}

/// Classify an error message against a policy's patterns and the built-in
/// heuristics. Non-retryable patterns win over retryable ones.
pub fn classify_error(error: &str, policy: &RetryPolicy) -> ErrorClass {
    let haystack = error.to_lowercase();

    for pattern in &policy.non_retryable_errors {
        if !pattern.is_empty() && haystack.contains(&pattern.to_lowercase()) {
            return ErrorClass {
                retryable: false,
                confidence: 0.9,
                error_type: "non_retryable_pattern".to_string(),
            };
        }
    }
    for pattern in &policy.retryable_errors {
        if !pattern.is_empty() && haystack.contains(&pattern.to_lowercase()) {
            return ErrorClass {
                retryable: true,
                confidence: 0.9,
                error_type: "retryable_pattern".to_string(),
            };
        }
    }
    for (patterns, label) in PERMANENT_HEURISTICS {
        if patterns.iter().any(|p| haystack.contains(p)) {
            return ErrorClass {
                retryable: false,
                confidence: 0.7,
                error_type: (*label).to_string(),
            };
        }
    }
    for (patterns, label) in TRANSIENT_HEURISTICS {
        if patterns.iter().any(|p| haystack.contains(p)) {
            return ErrorClass {
                retryable: true,
                confidence: 0.7,
                error_type: (*label).to_string(),
            };
        }
    }
    ErrorClass {
        retryable: false,
        confidence: 0.3,
        error_type: "unknown".to_string(),
    }
}

struct CachedPolicy {
    policy: RetryPolicy,
    fetched_at: Instant,
}

/// Decides whether a failed task gets another attempt, and when.
pub struct RetryManager {
    store: Arc<dyn TaskStore>,
    cache: RwLock<HashMap<TaskKind, CachedPolicy>>,
    ttl: Duration,
}

impl RetryManager {
    pub fn new(store: Arc<dyn TaskStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached policy for a kind; falls back to the built-in default when no
    /// row exists or the store is unreachable.
    pub async fn policy_for(&self, kind: TaskKind) -> RetryPolicy {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&kind)
                && cached.fetched_at.elapsed() < self.ttl
            {
                return cached.policy.clone();
            }
        }

        let policy = match self.store.get_policy_by_kind(kind).await {
            Ok(Some(policy)) => policy,
            Ok(None) => RetryPolicy::default_for(kind),
            Err(e) => {
                tracing::warn!("policy lookup for {kind} failed, using default: {e}");
                RetryPolicy::default_for(kind)
            }
        };

        let mut cache = self.cache.write().await;
        cache.insert(
            kind,
            CachedPolicy {
                policy: policy.clone(),
                fetched_at: Instant::now(),
            },
        );
        policy
    }

    /// Drop the cached entry for a kind (admin just updated it).
    pub async fn invalidate(&self, kind: TaskKind) {
        self.cache.write().await.remove(&kind);
    }

    /// Classify an error under the kind's current policy.
    pub async fn classify(&self, kind: TaskKind, error: &str) -> ErrorClass {
        let policy = self.policy_for(kind).await;
        classify_error(error, &policy)
    }

    /// Decide retry vs terminal for a failure. The context's
    /// `current_attempt` is the number of retries already performed; a
    /// task-level `max_retries_override` wins over the policy's budget.
    pub async fn should_retry(&self, ctx: &RetryContext, error: &str) -> Result<RetryDecision> {
        let policy = self.policy_for(ctx.task_kind).await;
        // The attempt that just failed, 1-based.
        let failed_attempt = ctx.current_attempt + 1;
        let next_attempt = failed_attempt + 1;
        let max_retries = ctx.max_retries_override.unwrap_or(policy.max_retries);

        if !policy.enabled {
            return Ok(RetryDecision::refuse("Retry policy disabled", next_attempt));
        }
        if ctx.current_attempt >= max_retries {
            return Ok(RetryDecision::refuse("Maximum retries exceeded", next_attempt));
        }

        let class = classify_error(error, &policy);
        if !class.retryable || class.confidence < CONFIDENCE_THRESHOLD {
            return Ok(RetryDecision::refuse(
                format!(
                    "Error classified as {} (confidence {:.1})",
                    class.error_type, class.confidence
                ),
                next_attempt,
            ));
        }

        let delay_ms = jittered_delay(&policy, failed_attempt);
        Ok(RetryDecision::retry(
            delay_ms,
            format!(
                "Transient {} error (confidence {:.1}), attempt {next_attempt}/{}",
                class.error_type,
                class.confidence,
                max_retries + 1
            ),
            next_attempt,
        ))
    }
}

/// Strategy delay for the failed attempt with ±10% symmetric jitter,
/// clamped to `[0, max_delay_ms]`.
fn jittered_delay(policy: &RetryPolicy, failed_attempt: u32) -> u64 {
    let base = policy.delay_for_attempt(failed_attempt) as f64;
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    ((base * factor) as u64).min(policy.max_delay_ms)
}
