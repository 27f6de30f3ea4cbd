//! Dispatcher — routes a task to its executor and brackets the call with
//! analytics. Stateless with respect to persistence; the task loop owns all
//! store transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, Task, TaskKind};

use crate::analytics::Analytics;

/// Static kind → executor map, built once at startup.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        let kind = executor.kind();
        if self.executors.insert(kind, executor).is_some() {
            tracing::warn!("executor for {kind} replaced");
        }
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.executors.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

pub struct Dispatcher {
    registry: ExecutorRegistry,
    analytics: Analytics,
}

impl Dispatcher {
    pub fn new(registry: ExecutorRegistry, analytics: Analytics) -> Self {
        Self {
            registry,
            analytics,
        }
    }

    /// Execute one task and return its result. Never panics and never
    /// returns an executor error — every failure becomes an `error` result.
    /// The wall-clock budget cancels the context token and reports a
    /// retryable timeout.
    pub async fn dispatch(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        budget: Duration,
    ) -> ExecutionResult {
        self.analytics.task_started(task).await;
        tracing::info!("task {} ({}) running", task.id, task.kind);
        let started = Instant::now();

        let result = match self.registry.get(task.kind) {
            Some(executor) => {
                // Spawned so a panicking executor surfaces as a JoinError
                // instead of tearing down the worker.
                let owned_task = task.clone();
                let owned_ctx = ctx.clone();
                let handle = tokio::spawn(async move {
                    executor.execute(&owned_task, &owned_ctx).await
                });
                match tokio::time::timeout(budget, handle).await {
                    Ok(Ok(Ok(result))) => result,
                    Ok(Ok(Err(e))) => ExecutionResult::failure(e.to_string()),
                    Ok(Err(join_err)) => {
                        ExecutionResult::failure(format!("executor panicked: {join_err}"))
                    }
                    Err(_) => {
                        ctx.cancel.cancel();
                        ExecutionResult::failure(format!(
                            "timeout: execution exceeded {}s wall-clock budget",
                            budget.as_secs()
                        ))
                    }
                }
            }
            None => ExecutionResult::failure(format!("Unknown task type: {}", task.kind)),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if result.success {
            self.analytics.task_completed(task, duration_ms).await;
            tracing::info!("task {} ({}) completed in {duration_ms}ms", task.id, task.kind);
        } else {
            let reason = result.error.as_deref().unwrap_or("unknown error");
            self.analytics.task_failed(task, duration_ms, reason).await;
            tracing::warn!(
                "task {} ({}) failed after {duration_ms}ms: {reason}",
                task.id,
                task.kind
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use medlar_core::config::MedlarConfig;
    use medlar_core::error::{MedlarError, Result};
    use medlar_core::traits::TaskStore;
    use medlar_db::SqliteStore;

    struct OkExecutor;

    #[async_trait]
    impl Executor for OkExecutor {
        fn kind(&self) -> TaskKind {
            TaskKind::Shell
        }
        async fn execute(&self, _task: &Task, _ctx: &ExecutionContext) -> Result<ExecutionResult> {
            Ok(ExecutionResult::ok_with_summary("done"))
        }
    }

    struct ErrExecutor;

    #[async_trait]
    impl Executor for ErrExecutor {
        fn kind(&self) -> TaskKind {
            TaskKind::Llm
        }
        async fn execute(&self, _task: &Task, _ctx: &ExecutionContext) -> Result<ExecutionResult> {
            Err(MedlarError::Provider("server error 503".into()))
        }
    }

    struct PanicExecutor;

    #[async_trait]
    impl Executor for PanicExecutor {
        fn kind(&self) -> TaskKind {
            TaskKind::Code
        }
        async fn execute(&self, _task: &Task, _ctx: &ExecutionContext) -> Result<ExecutionResult> {
            panic!("boom");
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl Executor for SlowExecutor {
        fn kind(&self) -> TaskKind {
            TaskKind::Review
        }
        async fn execute(&self, _task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(ExecutionResult::ok()),
                _ = ctx.cancel.cancelled() => Ok(ExecutionResult::failure("cancelled")),
            }
        }
    }

    async fn harness() -> (Arc<SqliteStore>, Dispatcher, ExecutionContext) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.migrate().await.unwrap();
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(OkExecutor));
        registry.register(Arc::new(ErrExecutor));
        registry.register(Arc::new(PanicExecutor));
        registry.register(Arc::new(SlowExecutor));
        let analytics = Analytics::new(store.clone() as Arc<dyn TaskStore>);
        let dispatcher = Dispatcher::new(registry, analytics);
        let ctx = ExecutionContext::new(
            store.clone() as Arc<dyn TaskStore>,
            Arc::new(MedlarConfig::default()),
        );
        (store, dispatcher, ctx)
    }

    fn budget() -> Duration {
        Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_dispatch_success_brackets_analytics() {
        let (store, dispatcher, ctx) = harness().await;
        let mut task = Task::shell("echo hi");
        task.id = store.insert_task(&task).await.unwrap();

        let result = dispatcher.dispatch(&task, &ctx, budget()).await;
        assert!(result.success);
        assert_eq!(result.summary.as_deref(), Some("done"));

        let events = store.list_events(task.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, "running");
        assert_eq!(events[1].status, "completed");
    }

    #[tokio::test]
    async fn test_unknown_kind_synthesizes_error() {
        let (store, _dispatcher, ctx) = harness().await;
        // Registry without a planner executor.
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(OkExecutor));
        let dispatcher = Dispatcher::new(
            registry,
            Analytics::new(store.clone() as Arc<dyn TaskStore>),
        );

        let mut task = Task::planner("goal");
        task.id = store.insert_task(&task).await.unwrap();
        let result = dispatcher.dispatch(&task, &ctx, budget()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unknown task type: planner"));

        let events = store.list_events(task.id).await.unwrap();
        assert_eq!(events[1].status, "error");
    }

    #[tokio::test]
    async fn test_executor_error_converted() {
        let (store, dispatcher, ctx) = harness().await;
        let mut task = Task::llm("prompt");
        task.id = store.insert_task(&task).await.unwrap();

        let result = dispatcher.dispatch(&task, &ctx, budget()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("server error 503"));
    }

    #[tokio::test]
    async fn test_executor_panic_converted() {
        let (store, dispatcher, ctx) = harness().await;
        let mut task = Task::new(TaskKind::Code);
        task.id = store.insert_task(&task).await.unwrap();

        let result = dispatcher.dispatch(&task, &ctx, budget()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_reports() {
        let (store, dispatcher, ctx) = harness().await;
        let mut task = Task::new(TaskKind::Review);
        task.id = store.insert_task(&task).await.unwrap();

        let result = dispatcher
            .dispatch(&task, &ctx, Duration::from_millis(50))
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().starts_with("timeout"));
        assert!(ctx.cancel.is_cancelled());
    }
}
