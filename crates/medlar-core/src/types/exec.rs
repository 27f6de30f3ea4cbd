//! Executor output and subtask descriptors.

use serde::{Deserialize, Serialize};

use super::task::{Task, TaskKind};

/// What an executor hands back to the dispatcher.
///
/// `summary` feeds the task's `result_summary` (a short note, by convention
/// the artifact path when `output_path` is absent). Expected failures come
/// back as `success = false` with `error` set — executors do not bubble
/// errors for those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub summary: Option<String>,
    pub output_path: Option<String>,
    pub file_path: Option<String>,
    pub subtask_ids: Option<Vec<i64>>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with_summary(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: Some(summary.into()),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_subtask_ids(mut self, ids: Vec<i64>) -> Self {
        self.subtask_ids = Some(ids);
        self
    }

    /// The value the task loop writes into `result_summary`.
    pub fn summary_text(&self) -> Option<String> {
        self.summary
            .clone()
            .or_else(|| self.output_path.clone())
            .or_else(|| self.file_path.clone())
    }
}

/// A subtask descriptor produced by planner expansion or batch recipes.
///
/// `dependencies` are positions of earlier descriptors in the same expansion
/// (0-based); absolute task ids are resolved at insert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    #[serde(rename = "type", alias = "kind")]
    pub kind: TaskKind,
    pub description: Option<String>,
    #[serde(default)]
    pub shell_command: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub args: Option<serde_json::Value>,
    #[serde(default)]
    pub generator: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dependencies: Option<Vec<usize>>,
}

impl SubtaskSpec {
    /// Materialize into a task under `parent_id`. Sibling dependencies are
    /// attached by the store at insert time.
    pub fn to_task(&self, parent_id: i64) -> Task {
        let mut t = Task::new(self.kind);
        t.parent_id = Some(parent_id);
        t.description = self.description.clone();
        t.shell_command = self.shell_command.clone();
        t.tool = self.tool.clone();
        t.args = self.args.clone();
        t.generator = self.generator.clone();
        t.file_path = self.file_path.clone();
        t.url = self.url.clone();
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_precedence() {
        let r = ExecutionResult::ok_with_summary("hi").with_output_path("/out/a.txt");
        assert_eq!(r.summary_text().as_deref(), Some("hi"));

        let r = ExecutionResult::ok().with_output_path("/out/a.txt");
        assert_eq!(r.summary_text().as_deref(), Some("/out/a.txt"));

        let r = ExecutionResult::ok().with_file_path("/media/b.mp4");
        assert_eq!(r.summary_text().as_deref(), Some("/media/b.mp4"));

        assert_eq!(ExecutionResult::ok().summary_text(), None);
    }

    #[test]
    fn test_failure() {
        let r = ExecutionResult::failure("boom");
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_spec_parses_type_field() {
        let raw = r#"{"type": "code", "description": "write a parser"}"#;
        let spec: SubtaskSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.kind, TaskKind::Code);
        assert_eq!(spec.description.as_deref(), Some("write a parser"));
        assert_eq!(spec.dependencies, None);
    }

    #[test]
    fn test_spec_accepts_kind_alias_and_deps() {
        let raw = r#"{"kind": "review", "description": "check it", "dependencies": [0]}"#;
        let spec: SubtaskSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.kind, TaskKind::Review);
        assert_eq!(spec.dependencies, Some(vec![0]));
    }

    #[test]
    fn test_spec_to_task() {
        let spec = SubtaskSpec {
            kind: TaskKind::Shell,
            description: Some("list".into()),
            shell_command: Some("ls".into()),
            tool: None,
            args: None,
            generator: None,
            file_path: None,
            url: None,
            dependencies: None,
        };
        let t = spec.to_task(9);
        assert_eq!(t.kind, TaskKind::Shell);
        assert_eq!(t.parent_id, Some(9));
        assert_eq!(t.shell_command.as_deref(), Some("ls"));
    }
}
