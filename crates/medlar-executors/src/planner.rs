//! Planner expansion — an LLM decomposes a goal into a subtask DAG fragment
//! that is materialized into the store in one transaction.
//!
//! Dependency rule: a descriptor's explicit `dependencies` (sibling
//! positions) win; otherwise `review` and `run_code` subtasks attach to the
//! nearest preceding `code` subtask, and anything else to its immediate
//! predecessor.

use std::sync::Arc;

use async_trait::async_trait;

use medlar_core::error::Result;
use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, PlannerResult, SubtaskSpec, Task, TaskKind};
use medlar_core::util::truncate;
use medlar_providers::{TextGenClient, VectorIndex};

/// How many similar prior tasks feed the prompt.
const CONTEXT_K: usize = 5;

pub struct PlannerExecutor {
    textgen: TextGenClient,
    similarity: Arc<dyn VectorIndex>,
}

impl PlannerExecutor {
    pub fn new(textgen: TextGenClient, similarity: Arc<dyn VectorIndex>) -> Self {
        Self {
            textgen,
            similarity,
        }
    }

    /// Similar prior completed tasks, summarized for the prompt.
    /// Retrieval failure is non-fatal — the planner proceeds without context.
    async fn context_tasks(&self, goal: &str, ctx: &ExecutionContext) -> (Vec<i64>, String) {
        let similar = match self.similarity.find_similar(goal, CONTEXT_K).await {
            Ok(similar) => similar,
            Err(e) => {
                tracing::warn!("similarity lookup failed, planning without context: {e}");
                return (Vec::new(), String::new());
            }
        };

        let mut ids = Vec::new();
        let mut lines = Vec::new();
        for hit in similar {
            let Ok(Some(prior)) = ctx.store.get_task(hit.task_id).await else {
                continue;
            };
            ids.push(prior.id);
            lines.push(format!(
                "- [{}] {} → {}",
                prior.kind,
                truncate(prior.description.as_deref().unwrap_or("(no description)"), 120),
                truncate(prior.result_summary.as_deref().unwrap_or("(no result)"), 120),
            ));
        }
        (ids, lines.join("\n"))
    }

    fn build_prompt(goal: &str, context: &str) -> String {
        let mut prompt = format!(
            "Decompose the following goal into a short ordered list of subtasks.\n\
             Reply with a JSON array only. Each element: {{\"type\": <kind>, \
             \"description\": <what to do>}}, optionally \"shell_command\", \"args\", \
             \"dependencies\" (indexes of earlier subtasks).\n\
             Allowed kinds: shell, llm, code, review, run_code, tool.\n\n\
             Goal: {goal}\n"
        );
        if !context.is_empty() {
            prompt.push_str(&format!("\nSimilar completed tasks for reference:\n{context}\n"));
        }
        prompt
    }
}

/// Parse the model response into subtask descriptors. Strict: anything that
/// is not a JSON array of specs is a parse failure with no side effects.
pub fn parse_response(raw: &str) -> std::result::Result<Vec<SubtaskSpec>, String> {
    let trimmed = strip_fences(raw.trim());
    let specs: Vec<SubtaskSpec> =
        serde_json::from_str(trimmed).map_err(|e| format!("planner response parse error: {e}"))?;
    if specs.is_empty() {
        return Err("planner response contained no subtasks".to_string());
    }
    Ok(specs)
}

fn strip_fences(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest).trim()
}

/// Sibling dependency positions for each descriptor, per the planner rule.
pub fn assign_dependencies(specs: &[SubtaskSpec]) -> std::result::Result<Vec<Vec<usize>>, String> {
    let mut all = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        if let Some(explicit) = &spec.dependencies {
            for &pos in explicit {
                if pos >= i {
                    return Err(format!(
                        "subtask {i} declares dependency on {pos}, which does not precede it"
                    ));
                }
            }
            all.push(explicit.clone());
            continue;
        }
        let implied = match spec.kind {
            TaskKind::Review | TaskKind::RunCode => specs[..i]
                .iter()
                .rposition(|s| s.kind == TaskKind::Code)
                .map(|pos| vec![pos])
                .unwrap_or_else(|| if i > 0 { vec![i - 1] } else { Vec::new() }),
            _ => {
                if i > 0 {
                    vec![i - 1]
                } else {
                    Vec::new()
                }
            }
        };
        all.push(implied);
    }
    Ok(all)
}

#[async_trait]
impl Executor for PlannerExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::Planner
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let Some(goal) = task.description.as_deref() else {
            return Ok(ExecutionResult::failure("planner task missing goal"));
        };

        let (context_ids, context) = self.context_tasks(goal, ctx).await;
        let prompt = Self::build_prompt(goal, &context);
        let raw = match self.textgen.generate(&prompt).await {
            Ok(raw) => raw,
            Err(e) => return Ok(ExecutionResult::failure(e.to_string())),
        };

        let specs = match parse_response(&raw) {
            Ok(specs) => specs,
            Err(e) => return Ok(ExecutionResult::failure(e)),
        };
        let sibling_deps = match assign_dependencies(&specs) {
            Ok(deps) => deps,
            Err(e) => return Ok(ExecutionResult::failure(e)),
        };

        let subtasks: Vec<Task> = specs.iter().map(|spec| spec.to_task(task.id)).collect();
        let ids = ctx.store.insert_task_batch(&subtasks, &sibling_deps).await?;

        ctx.store
            .record_planner_result(&PlannerResult::new(
                task.id,
                goal,
                self.textgen.model(),
                context_ids,
                ids.len() as u32,
            ))
            .await?;

        tracing::info!(
            "planner task {} expanded into {} subtask(s): {ids:?}",
            task.id,
            ids.len()
        );
        Ok(ExecutionResult::ok_with_summary(raw).with_subtask_ids(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: TaskKind) -> SubtaskSpec {
        SubtaskSpec {
            kind,
            description: Some(format!("{kind} step")),
            shell_command: None,
            tool: None,
            args: None,
            generator: None,
            file_path: None,
            url: None,
            dependencies: None,
        }
    }

    #[test]
    fn test_parse_plain_array() {
        let raw = r#"[{"type": "code", "description": "write it"},
                      {"type": "review", "description": "check it"}]"#;
        let specs = parse_response(raw).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].kind, TaskKind::Code);
    }

    #[test]
    fn test_parse_fenced_array() {
        let raw = "```json\n[{\"type\": \"shell\", \"description\": \"x\", \"shell_command\": \"ls\"}]\n```";
        let specs = parse_response(raw).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].shell_command.as_deref(), Some("ls"));
    }

    #[test]
    fn test_parse_failures() {
        assert!(parse_response("not json at all").is_err());
        assert!(parse_response("[]").is_err());
        assert!(parse_response(r#"[{"description": "kindless"}]"#).is_err());
        assert!(parse_response(r#"[{"type": "mystery_kind", "description": "x"}]"#).is_err());
    }

    #[test]
    fn test_planner_rule_code_review_run() {
        // [code, review, run_code] → [], [code], [code].
        let specs = vec![spec(TaskKind::Code), spec(TaskKind::Review), spec(TaskKind::RunCode)];
        let deps = assign_dependencies(&specs).unwrap();
        assert_eq!(deps, vec![vec![], vec![0], vec![0]]);
    }

    #[test]
    fn test_planner_rule_sequential_default() {
        let specs = vec![spec(TaskKind::Shell), spec(TaskKind::Llm), spec(TaskKind::Shell)];
        let deps = assign_dependencies(&specs).unwrap();
        assert_eq!(deps, vec![vec![], vec![0], vec![1]]);
    }

    #[test]
    fn test_planner_rule_nearest_code_wins() {
        // [code, shell, code, review] → review attaches to the second code.
        let specs = vec![
            spec(TaskKind::Code),
            spec(TaskKind::Shell),
            spec(TaskKind::Code),
            spec(TaskKind::Review),
        ];
        let deps = assign_dependencies(&specs).unwrap();
        assert_eq!(deps[3], vec![2]);
    }

    #[test]
    fn test_planner_rule_review_without_code_falls_back() {
        let specs = vec![spec(TaskKind::Shell), spec(TaskKind::Review)];
        let deps = assign_dependencies(&specs).unwrap();
        assert_eq!(deps, vec![vec![], vec![0]]);
    }

    #[test]
    fn test_explicit_dependencies_win() {
        let mut third = spec(TaskKind::RunCode);
        third.dependencies = Some(vec![0, 1]);
        let specs = vec![spec(TaskKind::Code), spec(TaskKind::Shell), third];
        let deps = assign_dependencies(&specs).unwrap();
        assert_eq!(deps[2], vec![0, 1]);
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let mut first = spec(TaskKind::Shell);
        first.dependencies = Some(vec![1]);
        let specs = vec![first, spec(TaskKind::Shell)];
        assert!(assign_dependencies(&specs).is_err());
    }

    #[test]
    fn test_shape_is_deterministic() {
        // The same response yields the same dependency structure.
        let raw = r#"[{"type": "code", "description": "a"},
                      {"type": "review", "description": "b"},
                      {"type": "run_code", "description": "c"}]"#;
        let a = assign_dependencies(&parse_response(raw).unwrap()).unwrap();
        let b = assign_dependencies(&parse_response(raw).unwrap()).unwrap();
        assert_eq!(a, b);
    }
}
