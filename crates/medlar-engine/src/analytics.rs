//! Analytics — append-only event log plus the aggregates behind
//! `dashboard render`. Event writes never fail the pipeline; a store error
//! here is logged and swallowed.

use std::sync::Arc;

use medlar_core::error::Result;
use medlar_core::traits::TaskStore;
use medlar_core::types::{Task, TaskEvent, TaskTypeStats};

#[derive(Clone)]
pub struct Analytics {
    store: Arc<dyn TaskStore>,
}

impl Analytics {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn task_started(&self, task: &Task) {
        self.record(TaskEvent::started(task.id, task.kind, task.retry_count))
            .await;
    }

    pub async fn task_completed(&self, task: &Task, duration_ms: u64) {
        self.record(TaskEvent::completed(
            task.id,
            task.kind,
            duration_ms,
            task.retry_count,
        ))
        .await;
    }

    pub async fn task_failed(&self, task: &Task, duration_ms: u64, reason: &str) {
        self.record(TaskEvent::failed(
            task.id,
            task.kind,
            duration_ms,
            task.retry_count,
            reason,
        ))
        .await;
    }

    pub async fn task_cancelled(&self, task_id: i64, kind: medlar_core::types::TaskKind) {
        self.record(TaskEvent::cancelled(task_id, kind)).await;
    }

    async fn record(&self, event: TaskEvent) {
        if let Err(e) = self.store.log_event(&event).await {
            tracing::warn!(
                "analytics event dropped for task {} ({}): {e}",
                event.task_id,
                event.status
            );
        }
    }

    pub async fn stats(&self) -> Result<Vec<TaskTypeStats>> {
        self.store.event_stats().await
    }

    /// Static HTML report: per-kind success rate and durations, slowest
    /// kinds first so bottlenecks lead.
    pub fn render_dashboard(stats: &[TaskTypeStats]) -> String {
        let mut rows = stats.to_vec();
        rows.sort_by(|a, b| {
            b.avg_duration_ms
                .partial_cmp(&a.avg_duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut html = String::from(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Medlar — task analytics</title>\n\
             <style>body{font-family:sans-serif;margin:2rem}table{border-collapse:collapse}\n\
             td,th{border:1px solid #ccc;padding:.4rem .8rem;text-align:right}\n\
             th{background:#f4f4f4}td:first-child,th:first-child{text-align:left}</style></head>\n\
             <body><h1>Task analytics</h1>\n<table>\n\
             <tr><th>kind</th><th>finished</th><th>completed</th><th>failed</th>\
             <th>success rate</th><th>avg ms</th><th>max ms</th></tr>\n",
        );
        for s in &rows {
            html.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.1}%</td><td>{:.0}</td><td>{}</td></tr>\n",
                s.task_kind,
                s.total,
                s.completed,
                s.failed,
                s.success_rate() * 100.0,
                s.avg_duration_ms,
                s.max_duration_ms,
            ));
        }
        html.push_str("</table></body></html>\n");
        html
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medlar_core::types::TaskKind;
    use medlar_db::SqliteStore;

    #[tokio::test]
    async fn test_events_bracket_lifecycle() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.migrate().await.unwrap();
        let analytics = Analytics::new(store.clone() as Arc<dyn TaskStore>);

        let mut task = Task::shell("echo hi");
        task.id = store.insert_task(&task).await.unwrap();

        analytics.task_started(&task).await;
        analytics.task_completed(&task, 42).await;

        let events = store.list_events(task.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, "running");
        assert_eq!(events[1].status, "completed");
        assert_eq!(events[1].duration_ms, Some(42));
    }

    #[tokio::test]
    async fn test_dashboard_orders_slowest_first() {
        let stats = vec![
            TaskTypeStats {
                task_kind: TaskKind::Shell,
                total: 4,
                completed: 4,
                failed: 0,
                avg_duration_ms: 10.0,
                max_duration_ms: 12,
            },
            TaskTypeStats {
                task_kind: TaskKind::MediaTranscribe,
                total: 2,
                completed: 1,
                failed: 1,
                avg_duration_ms: 9_000.0,
                max_duration_ms: 15_000,
            },
        ];
        let html = Analytics::render_dashboard(&stats);
        let transcribe = html.find("media_transcribe").unwrap();
        let shell = html.find("<td>shell</td>").unwrap();
        assert!(transcribe < shell, "slowest kind must lead the table");
        assert!(html.contains("50.0%"));
    }
}
