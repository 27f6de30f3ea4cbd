//! Batch fan-out — static subtask lists and named generators.
//!
//! Generators are a small, closed registry; adding one is a code change.
//!   - `folder_rename`: one rename per directory entry, slugified.
//!   - `media_scan`: one `media_ingest` per media file in a directory.

use async_trait::async_trait;

use medlar_core::error::Result;
use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, SubtaskSpec, Task, TaskKind};

pub struct BatchExecutor;

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "avi", "mov", "mp3", "flac", "wav", "m4a", "ogg",
];

#[async_trait]
impl Executor for BatchExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Batch
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let specs = if let Some(generator) = task.generator.as_deref() {
            match run_generator(generator, task) {
                Ok(specs) => specs,
                Err(e) => return Ok(ExecutionResult::failure(e)),
            }
        } else if let Some(raw) = &task.subtasks {
            match serde_json::from_value::<Vec<SubtaskSpec>>(raw.clone()) {
                Ok(specs) => specs,
                Err(e) => {
                    return Ok(ExecutionResult::failure(format!(
                        "batch subtasks parse error: {e}"
                    )))
                }
            }
        } else {
            return Ok(ExecutionResult::failure(
                "batch task has neither subtasks nor generator",
            ));
        };

        if specs.is_empty() {
            return Ok(ExecutionResult::ok_with_summary("batch expanded 0 subtasks"));
        }

        // Static lists are inserted verbatim: explicit sibling deps only.
        let mut sibling_deps = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let explicit = spec.dependencies.clone().unwrap_or_default();
            if explicit.iter().any(|&pos| pos >= i) {
                return Ok(ExecutionResult::failure(format!(
                    "batch subtask {i} depends on a later sibling"
                )));
            }
            sibling_deps.push(explicit);
        }

        let subtasks: Vec<Task> = specs.iter().map(|spec| spec.to_task(task.id)).collect();
        let ids = ctx.store.insert_task_batch(&subtasks, &sibling_deps).await?;
        tracing::info!("batch task {} expanded into {} subtask(s)", task.id, ids.len());

        Ok(
            ExecutionResult::ok_with_summary(format!("batch expanded {} subtasks", ids.len()))
                .with_subtask_ids(ids),
        )
    }
}

/// Run a named generator against the task's payload.
fn run_generator(name: &str, task: &Task) -> std::result::Result<Vec<SubtaskSpec>, String> {
    let dir = task
        .file_path
        .as_deref()
        .or_else(|| {
            task.args
                .as_ref()
                .and_then(|a| a.get("path"))
                .and_then(|p| p.as_str())
        })
        .ok_or_else(|| format!("generator {name} needs a directory (file_path or args.path)"))?;

    let entries = list_dir(dir)?;
    match name {
        "folder_rename" => Ok(folder_rename(dir, &entries)),
        "media_scan" => Ok(media_scan(dir, &entries)),
        other => Err(format!("unknown generator: {other}")),
    }
}

fn list_dir(dir: &str) -> std::result::Result<Vec<String>, String> {
    let mut names = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| format!("read {dir}: {e}"))?;
    for entry in entries {
        let entry = entry.map_err(|e| format!("read {dir}: {e}"))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn folder_rename(dir: &str, entries: &[String]) -> Vec<SubtaskSpec> {
    entries
        .iter()
        .filter_map(|name| {
            let slug = slugify_filename(name);
            if slug == *name {
                return None;
            }
            Some(SubtaskSpec {
                kind: TaskKind::Shell,
                description: Some(format!("rename {name} to {slug}")),
                shell_command: Some(format!(
                    "mv {} {}",
                    shell_quote(&format!("{dir}/{name}")),
                    shell_quote(&format!("{dir}/{slug}")),
                )),
                tool: None,
                args: None,
                generator: None,
                file_path: None,
                url: None,
                dependencies: None,
            })
        })
        .collect()
}

fn media_scan(dir: &str, entries: &[String]) -> Vec<SubtaskSpec> {
    entries
        .iter()
        .filter(|name| {
            name.rsplit('.')
                .next()
                .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|name| SubtaskSpec {
            kind: TaskKind::MediaIngest,
            description: Some(format!("ingest {name}")),
            shell_command: None,
            tool: None,
            args: None,
            generator: None,
            file_path: Some(format!("{dir}/{name}")),
            url: None,
            dependencies: None,
        })
        .collect()
}

/// Lowercase, spaces to dashes, strip anything outside `[a-z0-9._-]`.
fn slugify_filename(name: &str) -> String {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name, None),
    };
    let mut slug = String::with_capacity(stem.len());
    let mut last_dash = false;
    for c in stem.to_lowercase().chars() {
        let mapped = match c {
            'a'..='z' | '0'..='9' | '.' | '_' => Some(c),
            ' ' | '-' => Some('-'),
            _ => None,
        };
        match mapped {
            Some('-') if last_dash => {}
            Some(c) => {
                last_dash = c == '-';
                slug.push(c);
            }
            None => {}
        }
    }
    let slug = slug.trim_matches('-').to_string();
    match ext {
        Some(ext) => format!("{slug}.{}", ext.to_lowercase()),
        None => slug,
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use medlar_core::MedlarConfig;
    use medlar_core::traits::TaskStore;
    use medlar_core::types::TaskStatus;
    use medlar_db::SqliteStore;
    use std::sync::Arc;

    async fn ctx() -> ExecutionContext {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.migrate().await.unwrap();
        ExecutionContext::new(
            store as Arc<dyn TaskStore>,
            Arc::new(MedlarConfig::default()),
        )
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify_filename("My Movie (2024).MKV"), "my-movie-2024.mkv");
        assert_eq!(slugify_filename("already-clean.mp4"), "already-clean.mp4");
        assert_eq!(slugify_filename("Weird  name!!"), "weird-name");
        assert_eq!(slugify_filename("a_b.c.txt"), "a_b.c.txt");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn test_static_expansion() {
        let ctx = ctx().await;
        let mut task = Task::new(TaskKind::Batch);
        task.id = ctx.store.insert_task(&task).await.unwrap();
        ctx.store.mark_running(task.id, chrono::Utc::now()).await.unwrap();
        task.subtasks = Some(serde_json::json!([
            {"type": "shell", "description": "a", "shell_command": "echo a"},
            {"type": "shell", "description": "b", "shell_command": "echo b", "dependencies": [0]},
        ]));

        let result = BatchExecutor.execute(&task, &ctx).await.unwrap();
        assert!(result.success);
        let ids = result.subtask_ids.unwrap();
        assert_eq!(ids.len(), 2);

        let second = ctx.store.get_task(ids[1]).await.unwrap().unwrap();
        assert_eq!(second.parent_id, Some(task.id));
        assert_eq!(second.dependencies, vec![ids[0]]);
        assert_eq!(second.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_static_parse_failure_no_side_effects() {
        let ctx = ctx().await;
        let mut task = Task::new(TaskKind::Batch);
        task.id = ctx.store.insert_task(&task).await.unwrap();
        task.subtasks = Some(serde_json::json!({"not": "an array"}));

        let result = BatchExecutor.execute(&task, &ctx).await.unwrap();
        assert!(!result.success);
        // Only the batch task itself exists.
        assert_eq!(ctx.store.list_tasks(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_folder_rename_generator() {
        let dir = std::env::temp_dir().join("medlar-test-rename");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("My File.TXT"), "x").unwrap();
        std::fs::write(dir.join("clean.txt"), "x").unwrap();

        let ctx = ctx().await;
        let mut task = Task::new(TaskKind::Batch);
        task.generator = Some("folder_rename".into());
        task.file_path = Some(dir.display().to_string());
        task.id = ctx.store.insert_task(&task).await.unwrap();

        let result = BatchExecutor.execute(&task, &ctx).await.unwrap();
        assert!(result.success);
        // Only the messy name needs a rename task.
        let ids = result.subtask_ids.unwrap();
        assert_eq!(ids.len(), 1);
        let rename = ctx.store.get_task(ids[0]).await.unwrap().unwrap();
        assert!(rename.shell_command.unwrap().contains("my-file.txt"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_media_scan_generator() {
        let dir = std::env::temp_dir().join("medlar-test-scan");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("clip.mp4"), "x").unwrap();
        std::fs::write(dir.join("notes.txt"), "x").unwrap();

        let ctx = ctx().await;
        let mut task = Task::new(TaskKind::Batch);
        task.generator = Some("media_scan".into());
        task.args = Some(serde_json::json!({"path": dir.display().to_string()}));
        task.id = ctx.store.insert_task(&task).await.unwrap();

        let result = BatchExecutor.execute(&task, &ctx).await.unwrap();
        assert!(result.success);
        let ids = result.subtask_ids.unwrap();
        assert_eq!(ids.len(), 1);
        let ingest = ctx.store.get_task(ids[0]).await.unwrap().unwrap();
        assert_eq!(ingest.kind, TaskKind::MediaIngest);
        assert!(ingest.file_path.unwrap().ends_with("clip.mp4"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_unknown_generator_is_failure() {
        let ctx = ctx().await;
        let mut task = Task::new(TaskKind::Batch);
        task.generator = Some("mystery".into());
        task.file_path = Some("/tmp".into());
        task.id = ctx.store.insert_task(&task).await.unwrap();

        let result = BatchExecutor.execute(&task, &ctx).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown generator"));
    }
}
