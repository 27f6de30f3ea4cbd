//! Review — LLM assessment of what the dependencies produced.

use async_trait::async_trait;

use medlar_core::error::Result;
use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, Task, TaskKind};
use medlar_core::util::truncate;
use medlar_providers::TextGenClient;

use crate::util::{artifact_path, write_artifact};

pub struct ReviewExecutor {
    textgen: TextGenClient,
}

impl ReviewExecutor {
    pub fn new(textgen: TextGenClient) -> Self {
        Self { textgen }
    }

    /// Collect the upstream results to review: summaries plus artifact
    /// contents where readable.
    async fn gather_context(task: &Task, ctx: &ExecutionContext) -> Result<String> {
        let mut sections = Vec::new();
        for &dep in &task.dependencies {
            let Some(upstream) = ctx.store.get_task(dep).await? else {
                continue;
            };
            let mut section = format!("## task {} ({})\n", upstream.id, upstream.kind);
            if let Some(summary) = &upstream.result_summary {
                section.push_str(&format!("summary: {}\n", truncate(summary, 500)));
            }
            if let Some(path) = &upstream.artifact_path
                && let Ok(content) = std::fs::read_to_string(path)
            {
                section.push_str(&format!("artifact:\n{}\n", truncate(&content, 4_000)));
            }
            sections.push(section);
        }
        Ok(sections.join("\n"))
    }
}

#[async_trait]
impl Executor for ReviewExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Review
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let criteria = task
            .description
            .as_deref()
            .unwrap_or("correctness and completeness");
        let context = Self::gather_context(task, ctx).await?;
        if context.is_empty() {
            return Ok(ExecutionResult::failure(
                "review task has no dependency output to review",
            ));
        }

        let prompt = format!(
            "Review the following results against these criteria: {criteria}.\n\
             Start your reply with PASS or FAIL on its own line, then explain.\n\n{context}"
        );
        let response = match self.textgen.generate(&prompt).await {
            Ok(response) => response,
            Err(e) => return Ok(ExecutionResult::failure(e.to_string())),
        };

        let path = artifact_path(&ctx.config, task, "review.md");
        write_artifact(&path, &response)?;

        let verdict = response.lines().next().unwrap_or("").trim().to_string();
        Ok(
            ExecutionResult::ok_with_summary(truncate(&verdict, 200))
                .with_output_path(path.display().to_string()),
        )
    }
}
