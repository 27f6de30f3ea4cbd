//! LLM prompt execution.

use async_trait::async_trait;

use medlar_core::error::Result;
use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, Task, TaskKind};
use medlar_core::util::truncate;
use medlar_providers::TextGenClient;

use crate::util::{artifact_path, write_artifact};

pub struct LlmExecutor {
    textgen: TextGenClient,
}

impl LlmExecutor {
    pub fn new(textgen: TextGenClient) -> Self {
        Self { textgen }
    }
}

#[async_trait]
impl Executor for LlmExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Llm
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let Some(prompt) = task.description.as_deref() else {
            return Ok(ExecutionResult::failure("llm task missing prompt"));
        };

        let response = match self.textgen.generate(prompt).await {
            Ok(response) => response,
            Err(e) => return Ok(ExecutionResult::failure(e.to_string())),
        };

        let path = artifact_path(&ctx.config, task, "llm.md");
        write_artifact(&path, &response)?;

        Ok(
            ExecutionResult::ok_with_summary(truncate(response.trim(), 500))
                .with_output_path(path.display().to_string()),
        )
    }
}
