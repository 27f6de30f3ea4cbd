//! The task loop — drives tasks from pending to terminal.
//!
//! Each pass: fetch a bounded batch of ready tasks, claim each with a
//! `pending → running` CAS (losers skip), dispatch, then settle: success
//! completes the task and inserts its follow-ups in the same transaction;
//! failure consults the retry manager and either re-queues with
//! `next_retry_at` or lands terminal `error`. The resolver wakes dependents
//! on completion; a terminal error never releases them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use medlar_core::config::MedlarConfig;
use medlar_core::error::Result;
use medlar_core::traits::{ExecutionContext, TaskStore};
use medlar_core::types::{ExecutionResult, RetryAttempt, RetryContext, Task, TaskKind};

use crate::dispatcher::Dispatcher;
use crate::resolver::DependencyResolver;
use crate::retry::RetryManager;

pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    config: Arc<MedlarConfig>,
    dispatcher: Arc<Dispatcher>,
    retry: Arc<RetryManager>,
    resolver: Mutex<DependencyResolver>,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        config: Arc<MedlarConfig>,
        dispatcher: Arc<Dispatcher>,
        retry: Arc<RetryManager>,
    ) -> Self {
        Self {
            store,
            config,
            dispatcher,
            retry,
            resolver: Mutex::new(DependencyResolver::new()),
        }
    }

    /// Rebuild the resolver's in-memory maps from the store (startup).
    pub async fn rebuild_resolver(&self) -> Result<()> {
        let pending = self.store.list_pending_tasks().await?;
        let mut completed = Vec::new();
        // Upstreams outside the pending set count as completed only if they
        // actually are — anything else keeps the dependent blocked.
        let mut seen = std::collections::HashSet::new();
        for task in &pending {
            for &dep in &task.dependencies {
                if seen.insert(dep)
                    && let Some(upstream) = self.store.get_task(dep).await?
                    && upstream.status == medlar_core::types::TaskStatus::Completed
                {
                    completed.push(dep);
                }
            }
        }
        let mut resolver = self.resolver.lock().await;
        resolver.rebuild(
            pending.iter().map(|t| (t.id, t.dependencies.as_slice())),
            completed,
        );
        tracing::info!("resolver rebuilt: {} pending task(s) tracked", resolver.tracked());
        Ok(())
    }

    /// One poll: fetch ready work and process it on the worker pool.
    /// Returns how many tasks were claimed.
    pub async fn poll_once(&self) -> Result<usize> {
        let now = Utc::now();
        let batch = self
            .store
            .list_ready_tasks(now, self.config.engine.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let depth = self.store.ready_queue_depth(now).await?;
        if depth > self.config.engine.ready_queue_warn_depth {
            tracing::warn!(
                "ready queue depth {depth} exceeds threshold {}",
                self.config.engine.ready_queue_warn_depth
            );
        }

        let workers = self.config.engine.effective_workers();
        let claimed = futures::stream::iter(batch)
            .map(|task| self.process(task))
            .buffer_unordered(workers)
            .fold(0usize, |acc, claimed| async move {
                acc + usize::from(claimed)
            })
            .await;
        Ok(claimed)
    }

    /// Claim and drive one task. Returns false when another worker won the
    /// claim.
    async fn process(&self, task: Task) -> bool {
        let now = Utc::now();
        match self.store.mark_running(task.id, now).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::error!("claim of task {} failed: {e}", task.id);
                return false;
            }
        }

        let ctx = ExecutionContext::new(Arc::clone(&self.store), Arc::clone(&self.config));
        let budget = Duration::from_secs(self.config.engine.task_timeout_secs.max(1));
        let started = std::time::Instant::now();
        let result = self.dispatcher.dispatch(&task, &ctx, budget).await;
        let execution_ms = started.elapsed().as_millis() as u64;

        if result.success {
            self.settle_success(&task, &result, execution_ms).await;
        } else {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            self.settle_failure(&task, &error).await;
        }
        true
    }

    async fn settle_success(&self, task: &Task, result: &ExecutionResult, execution_ms: u64) {
        let summary = result.summary_text();
        let artifact = result
            .output_path
            .clone()
            .or_else(|| result.file_path.clone());
        let follow_ups = follow_ups_for(task, result);

        match self
            .store
            .complete_task(task.id, summary.as_deref(), artifact.as_deref(), &follow_ups)
            .await
        {
            Ok(follow_up_ids) => {
                if !follow_up_ids.is_empty() {
                    tracing::info!(
                        "task {} spawned follow-up(s): {follow_up_ids:?}",
                        task.id
                    );
                }
            }
            Err(e) => {
                tracing::error!("completing task {} failed: {e}", task.id);
                return;
            }
        }

        // A recovered task closes its attempt history with a success row.
        if task.retry_count > 0 {
            let attempt = RetryAttempt::success(task.id, task.retry_count + 1, execution_ms);
            if let Err(e) = self.store.record_retry_attempt(&attempt).await {
                tracing::warn!("attempt row for task {} dropped: {e}", task.id);
            }
        }

        let woken = self.resolver.lock().await.mark_completed(task.id);
        if !woken.is_empty() {
            tracing::debug!("task {} completion unblocked {woken:?}", task.id);
        }
    }

    async fn settle_failure(&self, task: &Task, error: &str) {
        let class = self.retry.classify(task.kind, error).await;
        let retry_ctx = RetryContext::from(task);
        let decision = match self.retry.should_retry(&retry_ctx, error).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!("retry decision for task {} failed: {e}", task.id);
                let _ = self.store.fail_task(task.id, error).await;
                return;
            }
        };

        let attempt = RetryAttempt::failure(
            task.id,
            task.retry_count + 1,
            error,
            &class.error_type,
            decision.delay_ms,
        );
        if let Err(e) = self.store.record_retry_attempt(&attempt).await {
            tracing::warn!("attempt row for task {} dropped: {e}", task.id);
        }

        if decision.should_retry {
            let next_retry_at = Utc::now() + chrono::Duration::milliseconds(decision.delay_ms as i64);
            // Stamp the effective budget on the row so retry_count can never
            // outgrow max_retries there.
            let max_retries = match retry_ctx.max_retries_override {
                Some(max_retries) => max_retries,
                None => self.retry.policy_for(task.kind).await.max_retries,
            };
            tracing::info!(
                "task {} retry {} in {}ms: {}",
                task.id,
                decision.next_attempt,
                decision.delay_ms,
                decision.reason
            );
            if let Err(e) = self
                .store
                .reschedule_task(task.id, next_retry_at, task.retry_count + 1, max_retries, error)
                .await
            {
                tracing::error!("rescheduling task {} failed: {e}", task.id);
            }
        } else {
            tracing::warn!("task {} terminal: {}", task.id, decision.reason);
            if let Err(e) = self.store.fail_task(task.id, error).await {
                tracing::error!("failing task {} failed: {e}", task.id);
            }
            // Dependents stay blocked; just stop tracking the task.
            self.resolver.lock().await.forget(task.id);
        }
    }
}

/// Media pipeline fan-out: which tasks a completed task spawns. Inserted in
/// the same transaction that marks the parent completed.
pub fn follow_ups_for(task: &Task, result: &ExecutionResult) -> Vec<Task> {
    let artifact = result
        .file_path
        .clone()
        .or_else(|| result.output_path.clone())
        .or_else(|| task.file_path.clone());

    let mut follow_ups = Vec::new();
    let mut push = |kind: TaskKind| {
        let mut t = Task::new(kind);
        t.parent_id = Some(task.id);
        t.file_path = artifact.clone();
        t.media_id = task.media_id;
        t.url = task.url.clone();
        follow_ups.push(t);
    };

    match task.kind {
        TaskKind::Youtube | TaskKind::MediaDownload => {
            if artifact.is_some() {
                push(TaskKind::MediaIngest);
            }
        }
        TaskKind::MediaIngest => {
            push(TaskKind::MediaOrganize);
            push(TaskKind::MediaTranscribe);
        }
        TaskKind::MediaTranscribe => push(TaskKind::MediaTag),
        TaskKind::MediaTag => {
            push(TaskKind::IndexMeili);
            push(TaskKind::IndexChroma);
        }
        _ => {}
    }
    follow_ups
}

/// Run the task loop until cancelled.
pub async fn spawn_runner(runner: Arc<TaskRunner>, cancel: CancellationToken) {
    tracing::info!("task loop started");
    if let Err(e) = runner.rebuild_resolver().await {
        tracing::error!("resolver rebuild failed: {e}");
    }
    let idle = Duration::from_millis(runner.config.engine.poll_interval_ms.max(10));
    loop {
        if cancel.is_cancelled() {
            tracing::info!("task loop stopped");
            return;
        }
        match runner.poll_once().await {
            Ok(0) => {
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("poll failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use medlar_core::error::Result;
    use medlar_core::traits::Executor;
    use medlar_core::types::{RetryPolicy, TaskStatus};
    use medlar_db::SqliteStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::analytics::Analytics;
    use crate::dispatcher::ExecutorRegistry;

    /// Executor whose first N calls fail with a fixed error.
    struct FlakyExecutor {
        kind: TaskKind,
        failures: AtomicU32,
        error: String,
        summary: String,
    }

    impl FlakyExecutor {
        fn new(kind: TaskKind, failures: u32, error: &str, summary: &str) -> Self {
            Self {
                kind,
                failures: AtomicU32::new(failures),
                error: error.to_string(),
                summary: summary.to_string(),
            }
        }

        fn reliable(kind: TaskKind, summary: &str) -> Self {
            Self::new(kind, 0, "", summary)
        }
    }

    #[async_trait]
    impl Executor for FlakyExecutor {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn execute(&self, task: &Task, _ctx: &ExecutionContext) -> Result<ExecutionResult> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Ok(ExecutionResult::failure(self.error.clone()));
            }
            // Shell-style: stdout lands in the summary.
            let summary = if self.summary.is_empty() {
                task.shell_command.clone().unwrap_or_default()
            } else {
                self.summary.clone()
            };
            Ok(ExecutionResult::ok_with_summary(summary))
        }
    }

    struct Harness {
        store: Arc<SqliteStore>,
        runner: Arc<TaskRunner>,
    }

    async fn harness(executors: Vec<Arc<dyn Executor>>) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.migrate().await.unwrap();
        let dyn_store = store.clone() as Arc<dyn TaskStore>;

        let mut config = MedlarConfig::default();
        config.engine.workers = 2;
        config.engine.poll_interval_ms = 10;
        let config = Arc::new(config);

        let mut registry = ExecutorRegistry::new();
        for executor in executors {
            registry.register(executor);
        }
        let dispatcher = Arc::new(Dispatcher::new(registry, Analytics::new(dyn_store.clone())));
        let retry = Arc::new(RetryManager::new(
            dyn_store.clone(),
            Duration::from_secs(60),
        ));
        let runner = Arc::new(TaskRunner::new(dyn_store, config, dispatcher, retry));
        runner.rebuild_resolver().await.unwrap();
        Harness { store, runner }
    }

    /// Poll until nothing is ready or the deadline passes.
    async fn drain(h: &Harness, max_ms: u64) {
        let deadline = std::time::Instant::now() + Duration::from_millis(max_ms);
        loop {
            let claimed = h.runner.poll_once().await.unwrap();
            if claimed == 0 {
                let depth = h.store.ready_queue_depth(Utc::now()).await.unwrap();
                let pending = h.store.list_pending_tasks().await.unwrap();
                if depth == 0 && pending.iter().all(|t| t.next_retry_at.is_none()) {
                    return;
                }
            }
            if std::time::Instant::now() > deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_happy_path_chain() {
        // Scenario: shell task, then a review depending on it. Both complete;
        // analytics shows one start and one complete per task.
        let h = harness(vec![
            Arc::new(FlakyExecutor::reliable(TaskKind::Shell, "hi")),
            Arc::new(FlakyExecutor::reliable(TaskKind::Review, "looks good")),
        ])
        .await;

        let shell_id = h.store.insert_task(&Task::shell("echo hi")).await.unwrap();
        let review_id = h
            .store
            .insert_task(
                &Task::new(TaskKind::Review).with_dependencies(vec![shell_id]),
            )
            .await
            .unwrap();

        // First poll: only the shell task is ready.
        let ready: Vec<i64> = h
            .store
            .list_ready_tasks(Utc::now(), 10)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![shell_id]);

        drain(&h, 2_000).await;

        let shell = h.store.get_task(shell_id).await.unwrap().unwrap();
        assert_eq!(shell.status, TaskStatus::Completed);
        assert!(shell.result_summary.unwrap().contains("hi"));

        let review = h.store.get_task(review_id).await.unwrap().unwrap();
        assert_eq!(review.status, TaskStatus::Completed);

        for id in [shell_id, review_id] {
            let events = h.store.list_events(id).await.unwrap();
            let starts = events.iter().filter(|e| e.status == "running").count();
            let completes = events.iter().filter(|e| e.status == "completed").count();
            assert_eq!((starts, completes), (1, 1), "task {id}");
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retry_then_success() {
        // Scenario: shell policy max_retries=2, exponential, base=10ms.
        // First attempt fails with a connection timeout, second succeeds.
        let h = harness(vec![Arc::new(FlakyExecutor::new(
            TaskKind::Shell,
            1,
            "connection timeout",
            "recovered",
        ))])
        .await;

        let mut policy = RetryPolicy::default_for(TaskKind::Shell);
        policy.max_retries = 2;
        policy.base_delay_ms = 10;
        policy.max_delay_ms = 1_000;
        h.store.upsert_policy(&policy).await.unwrap();
        h.runner.retry.invalidate(TaskKind::Shell).await;

        let id = h.store.insert_task(&Task::shell("flaky")).await.unwrap();
        drain(&h, 3_000).await;

        let task = h.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_retry_error.as_deref(), Some("connection timeout"));

        let attempts = h.store.list_retry_attempts(id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].error_type.as_deref(), Some("timeout"));
        assert!(attempts[1].success);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let h = harness(vec![Arc::new(FlakyExecutor::new(
            TaskKind::Shell,
            99,
            "syntax error near X",
            "",
        ))])
        .await;

        let id = h.store.insert_task(&Task::shell("bad")).await.unwrap();
        drain(&h, 1_000).await;

        let task = h.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.error_message.as_deref(), Some("syntax error near X"));

        let attempts = h.store.list_retry_attempts(id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].success);
    }

    #[tokio::test]
    async fn test_zero_max_retries_fails_immediately() {
        let h = harness(vec![Arc::new(FlakyExecutor::new(
            TaskKind::Shell,
            99,
            "connection timeout",
            "",
        ))])
        .await;

        let mut policy = RetryPolicy::default_for(TaskKind::Shell);
        policy.max_retries = 0;
        h.store.upsert_policy(&policy).await.unwrap();
        h.runner.retry.invalidate(TaskKind::Shell).await;

        let id = h.store.insert_task(&Task::shell("flaky")).await.unwrap();
        drain(&h, 1_000).await;

        let task = h.store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependent() {
        let h = harness(vec![
            Arc::new(FlakyExecutor::new(TaskKind::Shell, 99, "syntax error", "")),
            Arc::new(FlakyExecutor::reliable(TaskKind::Review, "ok")),
        ])
        .await;

        let shell_id = h.store.insert_task(&Task::shell("bad")).await.unwrap();
        let review_id = h
            .store
            .insert_task(&Task::new(TaskKind::Review).with_dependencies(vec![shell_id]))
            .await
            .unwrap();

        drain(&h, 1_000).await;

        let shell = h.store.get_task(shell_id).await.unwrap().unwrap();
        assert_eq!(shell.status, TaskStatus::Error);
        // The dependent is still pending and not ready.
        let review = h.store.get_task(review_id).await.unwrap().unwrap();
        assert_eq!(review.status, TaskStatus::Pending);
        assert!(h.store.list_ready_tasks(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_media_pipeline_follow_ups() {
        // The executor reports the downloaded file path; completion inserts
        // the ingest follow-up in the same transaction.
        struct DownloadExecutor;
        #[async_trait]
        impl Executor for DownloadExecutor {
            fn kind(&self) -> TaskKind {
                TaskKind::MediaDownload
            }
            async fn execute(&self, _t: &Task, _c: &ExecutionContext) -> Result<ExecutionResult> {
                Ok(ExecutionResult::ok().with_file_path("/media/v.mp4"))
            }
        }
        let h = harness(vec![Arc::new(DownloadExecutor)]).await;

        let id = h
            .store
            .insert_task(&Task::media_download("http://x/v"))
            .await
            .unwrap();
        h.runner.poll_once().await.unwrap();

        let pending = h
            .store
            .list_tasks(Some(TaskStatus::Pending), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TaskKind::MediaIngest);
        assert_eq!(pending[0].parent_id, Some(id));
        assert_eq!(pending[0].file_path.as_deref(), Some("/media/v.mp4"));
    }

    #[test]
    fn test_follow_up_table() {
        let mut download = Task::media_download("http://x/v");
        download.id = 1;
        let result = ExecutionResult::ok().with_file_path("/media/v.mp4");
        let f = follow_ups_for(&download, &result);
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].kind, TaskKind::MediaIngest);

        let mut ingest = Task::new(TaskKind::MediaIngest);
        ingest.id = 2;
        ingest.file_path = Some("/media/v.mp4".into());
        let f = follow_ups_for(&ingest, &ExecutionResult::ok());
        let kinds: Vec<TaskKind> = f.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TaskKind::MediaOrganize, TaskKind::MediaTranscribe]);

        let mut tag = Task::new(TaskKind::MediaTag);
        tag.id = 3;
        let f = follow_ups_for(&tag, &ExecutionResult::ok());
        let kinds: Vec<TaskKind> = f.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TaskKind::IndexMeili, TaskKind::IndexChroma]);

        // Shell tasks never fan out.
        let shell = Task::shell("echo hi");
        assert!(follow_ups_for(&shell, &ExecutionResult::ok()).is_empty());

        // No artifact, no ingest.
        let f = follow_ups_for(&download, &ExecutionResult::ok());
        assert!(f.is_empty());
    }

    #[tokio::test]
    async fn test_cas_claims_once() {
        let h = harness(vec![Arc::new(FlakyExecutor::reliable(TaskKind::Shell, "x"))]).await;
        let id = h.store.insert_task(&Task::shell("echo x")).await.unwrap();
        let task = h.store.get_task(id).await.unwrap().unwrap();

        // Claim out from under the runner; process() must bow out.
        assert!(h.store.mark_running(id, Utc::now()).await.unwrap());
        let claimed = h.runner.process(task).await;
        assert!(!claimed);
    }
}
