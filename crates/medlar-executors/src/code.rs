//! Code generation — prompt the model, extract the fenced block, write the
//! artifact that `run_code` later executes.

use async_trait::async_trait;

use medlar_core::error::Result;
use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, Task, TaskKind};
use medlar_providers::TextGenClient;

use crate::util::{artifact_path, write_artifact};

pub struct CodeExecutor {
    textgen: TextGenClient,
}

impl CodeExecutor {
    pub fn new(textgen: TextGenClient) -> Self {
        Self { textgen }
    }
}

#[async_trait]
impl Executor for CodeExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Code
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let Some(description) = task.description.as_deref() else {
            return Ok(ExecutionResult::failure("code task missing description"));
        };

        let prompt = format!(
            "Write a small program for the following task. Reply with exactly one \
             fenced code block and nothing else.\n\nTask: {description}\n"
        );
        let response = match self.textgen.generate(&prompt).await {
            Ok(response) => response,
            Err(e) => return Ok(ExecutionResult::failure(e.to_string())),
        };

        let Some((lang, body)) = extract_fenced_block(&response) else {
            return Ok(ExecutionResult::failure(
                "model response contained no code block",
            ));
        };

        let path = artifact_path(&ctx.config, task, &format!("code.{}", extension_for(&lang)));
        write_artifact(&path, &body)?;
        let path = path.display().to_string();
        Ok(ExecutionResult::ok_with_summary(path.clone()).with_output_path(path))
    }
}

/// First fenced block in a response: (language tag, body).
pub fn extract_fenced_block(text: &str) -> Option<(String, String)> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let newline = after.find('\n')?;
    let lang = after[..newline].trim().to_string();
    let body = &after[newline + 1..];
    let end = body.find("```")?;
    let body = body[..end].trim_end().to_string();
    if body.is_empty() {
        return None;
    }
    Some((lang, body))
}

fn extension_for(lang: &str) -> &'static str {
    match lang {
        "python" | "py" => "py",
        "bash" | "sh" | "shell" => "sh",
        "javascript" | "js" | "node" => "js",
        "rust" | "rs" => "rs",
        _ => "py",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here you go:\n```python\nprint('hi')\n```\nEnjoy!";
        let (lang, body) = extract_fenced_block(text).unwrap();
        assert_eq!(lang, "python");
        assert_eq!(body, "print('hi')");
    }

    #[test]
    fn test_extract_without_lang_tag() {
        let text = "```\necho hi\n```";
        let (lang, body) = extract_fenced_block(text).unwrap();
        assert_eq!(lang, "");
        assert_eq!(body, "echo hi");
    }

    #[test]
    fn test_no_block_is_none() {
        assert!(extract_fenced_block("no code here").is_none());
        assert!(extract_fenced_block("``` ```").is_none());
    }

    #[test]
    fn test_extension_mapping() {
        assert_eq!(extension_for("python"), "py");
        assert_eq!(extension_for("bash"), "sh");
        assert_eq!(extension_for("js"), "js");
        assert_eq!(extension_for("mystery"), "py");
    }
}
