//! Shared executor plumbing: artifact paths and argv subprocess invocation.

use std::path::PathBuf;
use std::process::Stdio;

use tokio_util::sync::CancellationToken;

use medlar_core::error::{MedlarError, Result};
use medlar_core::types::Task;
use medlar_core::MedlarConfig;

/// Captured subprocess output.
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

/// Run a program with an explicit argument vector. The child is killed when
/// the cancellation token fires or this future is dropped.
pub async fn run_argv(
    program: &str,
    args: &[&str],
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::select! {
        output = cmd.output() => {
            output.map_err(|e| MedlarError::Executor(format!("{program} spawn: {e}")))?
        }
        _ = cancel.cancelled() => {
            return Err(MedlarError::Executor(format!("{program} cancelled")));
        }
    };

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Canonical artifact location for one task: `outputs/task-<id>-<suffix>`.
pub fn artifact_path(config: &MedlarConfig, task: &Task, suffix: &str) -> PathBuf {
    config.outputs_dir().join(format!("task-{}-{suffix}", task.id))
}

/// Write an artifact, creating the outputs directory on demand.
pub fn write_artifact(path: &PathBuf, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| MedlarError::Executor(format!("create {}: {e}", parent.display())))?;
    }
    std::fs::write(path, content)
        .map_err(|e| MedlarError::Executor(format!("write {}: {e}", path.display())))?;
    Ok(())
}
