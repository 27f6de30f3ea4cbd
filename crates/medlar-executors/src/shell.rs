//! Shell command execution — the one kind that runs through a shell.

use async_trait::async_trait;

use medlar_core::error::Result;
use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, Task, TaskKind};
use medlar_core::util::truncate;

use crate::util::{artifact_path, run_argv, write_artifact};

pub struct ShellExecutor;

#[async_trait]
impl Executor for ShellExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Shell
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let Some(command) = task.shell_command.as_deref() else {
            return Ok(ExecutionResult::failure("shell task missing command"));
        };

        let out = run_argv("sh", &["-c", command], &ctx.cancel).await?;

        let log_path = artifact_path(&ctx.config, task, "shell.log");
        let log = format!(
            "$ {command}\nexit: {}\n--- stdout ---\n{}\n--- stderr ---\n{}",
            out.exit_code, out.stdout, out.stderr
        );
        write_artifact(&log_path, &log)?;

        if out.success {
            Ok(
                ExecutionResult::ok_with_summary(truncate(out.stdout.trim(), 500))
                    .with_output_path(log_path.display().to_string()),
            )
        } else {
            let stderr = out.stderr.trim();
            let detail = if stderr.is_empty() {
                truncate(out.stdout.trim(), 200)
            } else {
                truncate(stderr, 200)
            };
            Ok(ExecutionResult::failure(format!(
                "exit {}: {detail}",
                out.exit_code
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medlar_core::MedlarConfig;
    use medlar_core::traits::TaskStore;
    use medlar_db::SqliteStore;
    use std::sync::Arc;

    async fn ctx() -> ExecutionContext {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.migrate().await.unwrap();
        let mut config = MedlarConfig::default();
        config.paths.base_path = std::env::temp_dir()
            .join("medlar-test-shell")
            .display()
            .to_string();
        ExecutionContext::new(store as Arc<dyn TaskStore>, Arc::new(config))
    }

    #[tokio::test]
    async fn test_echo_lands_in_summary() {
        let ctx = ctx().await;
        let mut task = Task::shell("echo hi");
        task.id = 1;
        let result = ShellExecutor.execute(&task, &ctx).await.unwrap();
        assert!(result.success);
        assert!(result.summary.unwrap().contains("hi"));
        assert!(result.output_path.is_some());
        std::fs::remove_dir_all(ctx.config.base_path()).ok();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let ctx = ctx().await;
        let mut task = Task::shell("echo nope >&2; exit 2");
        task.id = 2;
        let result = ShellExecutor.execute(&task, &ctx).await.unwrap();
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("exit 2"));
        assert!(error.contains("nope"));
        std::fs::remove_dir_all(ctx.config.base_path()).ok();
    }

    #[tokio::test]
    async fn test_missing_command_is_failure() {
        let ctx = ctx().await;
        let mut task = Task::new(TaskKind::Shell);
        task.id = 3;
        let result = ShellExecutor.execute(&task, &ctx).await.unwrap();
        assert!(!result.success);
    }
}
