//! Execute a code artifact produced by a dependency. The interpreter is
//! chosen by file extension and invoked with an explicit argument vector.

use async_trait::async_trait;

use medlar_core::error::Result;
use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, Task, TaskKind};
use medlar_core::util::truncate;

use crate::util::{artifact_path, run_argv, write_artifact};

pub struct RunCodeExecutor;

impl RunCodeExecutor {
    /// The artifact to run: the task's own `file_path`, or the first
    /// dependency that produced one.
    async fn resolve_artifact(task: &Task, ctx: &ExecutionContext) -> Result<Option<String>> {
        if let Some(path) = &task.file_path {
            return Ok(Some(path.clone()));
        }
        for &dep in &task.dependencies {
            if let Some(upstream) = ctx.store.get_task(dep).await?
                && let Some(path) = upstream.artifact_path
            {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Executor for RunCodeExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::RunCode
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let Some(path) = Self::resolve_artifact(task, ctx).await? else {
            return Ok(ExecutionResult::failure(
                "run_code: no artifact to execute (dependency produced none)",
            ));
        };
        let Some(interpreter) = interpreter_for(&path) else {
            return Ok(ExecutionResult::failure(format!(
                "run_code: no interpreter for {path}"
            )));
        };

        let out = run_argv(interpreter, &[path.as_str()], &ctx.cancel).await?;

        let log_path = artifact_path(&ctx.config, task, "run.log");
        let log = format!(
            "$ {interpreter} {path}\nexit: {}\n--- stdout ---\n{}\n--- stderr ---\n{}",
            out.exit_code, out.stdout, out.stderr
        );
        write_artifact(&log_path, &log)?;

        if out.success {
            Ok(
                ExecutionResult::ok_with_summary(truncate(out.stdout.trim(), 500))
                    .with_output_path(log_path.display().to_string()),
            )
        } else {
            Ok(ExecutionResult::failure(format!(
                "exit {}: {}",
                out.exit_code,
                truncate(out.stderr.trim(), 200)
            )))
        }
    }
}

fn interpreter_for(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    match ext {
        "py" => Some("python3"),
        "sh" => Some("sh"),
        "js" => Some("node"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medlar_core::MedlarConfig;
    use medlar_core::traits::TaskStore;
    use medlar_db::SqliteStore;
    use std::sync::Arc;

    #[test]
    fn test_interpreter_mapping() {
        assert_eq!(interpreter_for("/a/b.py"), Some("python3"));
        assert_eq!(interpreter_for("/a/b.sh"), Some("sh"));
        assert_eq!(interpreter_for("/a/b.js"), Some("node"));
        assert_eq!(interpreter_for("/a/b.exe"), None);
    }

    #[tokio::test]
    async fn test_runs_dependency_artifact() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.migrate().await.unwrap();

        let base = std::env::temp_dir().join("medlar-test-runcode");
        std::fs::create_dir_all(&base).unwrap();
        let script = base.join("hello.sh");
        std::fs::write(&script, "echo from-script\n").unwrap();

        // Upstream code task finished with an artifact.
        let code_id = {
            let id = store.insert_task(&medlar_core::types::Task::new(TaskKind::Code)).await.unwrap();
            store.mark_running(id, chrono::Utc::now()).await.unwrap();
            store
                .complete_task(id, None, Some(&script.display().to_string()), &[])
                .await
                .unwrap();
            id
        };

        let mut config = MedlarConfig::default();
        config.paths.base_path = base.display().to_string();
        let ctx = ExecutionContext::new(store.clone() as Arc<dyn TaskStore>, Arc::new(config));

        let mut task = Task::new(TaskKind::RunCode).with_dependencies(vec![code_id]);
        task.id = 99;
        let result = RunCodeExecutor.execute(&task, &ctx).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert!(result.summary.unwrap().contains("from-script"));
        std::fs::remove_dir_all(&base).ok();
    }

    #[tokio::test]
    async fn test_missing_artifact_is_failure() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.migrate().await.unwrap();
        let ctx = ExecutionContext::new(
            store as Arc<dyn TaskStore>,
            Arc::new(MedlarConfig::default()),
        );
        let mut task = Task::new(TaskKind::RunCode);
        task.id = 1;
        let result = RunCodeExecutor.execute(&task, &ctx).await.unwrap();
        assert!(!result.success);
    }
}
