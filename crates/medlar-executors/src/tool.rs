//! Tool invocation — named tools with structured JSON arguments.
//! The registry is closed; every tool validates its own args.

use std::collections::HashMap;

use async_trait::async_trait;

use medlar_core::error::{MedlarError, Result};
use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, Task, TaskKind};
use medlar_core::util::truncate;

/// One callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, args: &serde_json::Value, ctx: &ExecutionContext) -> Result<String>;
}

/// Closed registry of built-in tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ReadFileTool));
        registry.register(Box::new(WriteFileTool));
        registry.register(Box::new(ListDirTool));
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn str_arg<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| MedlarError::Executor(format!("missing '{key}' argument")))
}

struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    async fn run(&self, args: &serde_json::Value, _ctx: &ExecutionContext) -> Result<String> {
        let path = str_arg(args, "path")?;
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MedlarError::Executor(format!("read {path}: {e}")))?;
        Ok(content)
    }
}

struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    async fn run(&self, args: &serde_json::Value, _ctx: &ExecutionContext) -> Result<String> {
        let path = str_arg(args, "path")?;
        let content = str_arg(args, "content")?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| MedlarError::Executor(format!("write {path}: {e}")))?;
        Ok(format!("wrote {} bytes to {path}", content.len()))
    }
}

struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    async fn run(&self, args: &serde_json::Value, _ctx: &ExecutionContext) -> Result<String> {
        let path = str_arg(args, "path")?;
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| MedlarError::Executor(format!("list {path}: {e}")))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MedlarError::Executor(format!("list {path}: {e}")))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names.join("\n"))
    }
}

pub struct ToolExecutor {
    registry: ToolRegistry,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn with_defaults() -> Self {
        Self::new(ToolRegistry::with_defaults())
    }
}

#[async_trait]
impl Executor for ToolExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Tool
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let Some(name) = task.tool.as_deref() else {
            return Ok(ExecutionResult::failure("tool task missing tool name"));
        };
        let Some(tool) = self.registry.get(name) else {
            return Ok(ExecutionResult::failure(format!("tool not found: {name}")));
        };
        let args = task.args.clone().unwrap_or(serde_json::Value::Null);

        match tool.run(&args, ctx).await {
            Ok(output) => Ok(ExecutionResult::ok_with_summary(truncate(&output, 500))),
            Err(e) => Ok(ExecutionResult::failure(e.to_string())),
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
        ExecutionContext::new(
            store as Arc<dyn TaskStore>,
            Arc::new(MedlarConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let ctx = ctx().await;
        let path = std::env::temp_dir().join("medlar-test-tool.txt");
        let path_str = path.display().to_string();

        let mut write = Task::tool(
            "write_file",
            serde_json::json!({"path": path_str, "content": "hello tools"}),
        );
        write.id = 1;
        let result = ToolExecutor::with_defaults().execute(&write, &ctx).await.unwrap();
        assert!(result.success);

        let mut read = Task::tool("read_file", serde_json::json!({"path": path_str}));
        read.id = 2;
        let result = ToolExecutor::with_defaults().execute(&read, &ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.summary.as_deref(), Some("hello tools"));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_unknown_tool_is_failure() {
        let ctx = ctx().await;
        let mut task = Task::tool("levitate", serde_json::json!({}));
        task.id = 1;
        let result = ToolExecutor::with_defaults().execute(&task, &ctx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("tool not found: levitate"));
    }

    #[tokio::test]
    async fn test_missing_args_is_failure() {
        let ctx = ctx().await;
        let mut task = Task::tool("read_file", serde_json::json!({}));
        task.id = 1;
        let result = ToolExecutor::with_defaults().execute(&task, &ctx).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("missing 'path'"));
    }
}
