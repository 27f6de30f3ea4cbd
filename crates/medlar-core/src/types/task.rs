//! Task — the central persistent unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of task kinds the dispatcher routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Shell,
    Llm,
    Planner,
    Code,
    Review,
    RunCode,
    Batch,
    Tool,
    Youtube,
    MediaIngest,
    MediaOrganize,
    MediaTranscribe,
    MediaTag,
    IndexMeili,
    IndexChroma,
    MediaSummarize,
    MediaRecommend,
    VideoSceneDetect,
    VideoObjectDetect,
    AudioAnalyze,
    MediaDownload,
}

impl TaskKind {
    /// Wire/database name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Shell => "shell",
            TaskKind::Llm => "llm",
            TaskKind::Planner => "planner",
            TaskKind::Code => "code",
            TaskKind::Review => "review",
            TaskKind::RunCode => "run_code",
            TaskKind::Batch => "batch",
            TaskKind::Tool => "tool",
            TaskKind::Youtube => "youtube",
            TaskKind::MediaIngest => "media_ingest",
            TaskKind::MediaOrganize => "media_organize",
            TaskKind::MediaTranscribe => "media_transcribe",
            TaskKind::MediaTag => "media_tag",
            TaskKind::IndexMeili => "index_meili",
            TaskKind::IndexChroma => "index_chroma",
            TaskKind::MediaSummarize => "media_summarize",
            TaskKind::MediaRecommend => "media_recommend",
            TaskKind::VideoSceneDetect => "video_scene_detect",
            TaskKind::VideoObjectDetect => "video_object_detect",
            TaskKind::AudioAnalyze => "audio_analyze",
            TaskKind::MediaDownload => "media_download",
        }
    }

    /// All kinds, in registry order.
    pub fn all() -> &'static [TaskKind] {
        &[
            TaskKind::Shell,
            TaskKind::Llm,
            TaskKind::Planner,
            TaskKind::Code,
            TaskKind::Review,
            TaskKind::RunCode,
            TaskKind::Batch,
            TaskKind::Tool,
            TaskKind::Youtube,
            TaskKind::MediaIngest,
            TaskKind::MediaOrganize,
            TaskKind::MediaTranscribe,
            TaskKind::MediaTag,
            TaskKind::IndexMeili,
            TaskKind::IndexChroma,
            TaskKind::MediaSummarize,
            TaskKind::MediaRecommend,
            TaskKind::VideoSceneDetect,
            TaskKind::VideoObjectDetect,
            TaskKind::AudioAnalyze,
            TaskKind::MediaDownload,
        ]
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TaskKind::all()
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown task kind: {s}"))
    }
}

/// Lifecycle state. `pending → running → (completed | error | cancelled)`;
/// a retryable failure returns the task to `pending` with `next_retry_at` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Error) => true,
            (TaskStatus::Running, TaskStatus::Cancelled) => true,
            // Retryable failure re-queues the task.
            (TaskStatus::Running, TaskStatus::Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "error" => Ok(TaskStatus::Error),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persistent unit of work.
///
/// Kind-specific payload fields are plain optionals; free-form structured
/// arguments live in `args` as an opaque JSON value. Dependencies are
/// normalized edges in the store — the vector here is the loaded view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned id; 0 until inserted.
    pub id: i64,
    pub kind: TaskKind,
    pub status: TaskStatus,

    // Payload
    pub description: Option<String>,
    pub shell_command: Option<String>,
    pub tool: Option<String>,
    pub args: Option<serde_json::Value>,
    pub generator: Option<String>,
    /// Static subtask list for `batch` tasks (opaque JSON array of specs).
    pub subtasks: Option<serde_json::Value>,
    pub file_path: Option<String>,
    pub url: Option<String>,
    pub media_id: Option<i64>,
    pub style: Option<String>,

    // Relations
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<i64>,
    pub template_id: Option<i64>,
    pub schedule_id: Option<i64>,
    #[serde(default)]
    pub is_template: bool,

    // Result
    pub result_summary: Option<String>,
    pub artifact_path: Option<String>,
    pub error_message: Option<String>,

    // Retry
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    pub retry_policy_id: Option<i64>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_retry_error: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Blank task of a kind, pending, no payload.
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: 0,
            kind,
            status: TaskStatus::Pending,
            description: None,
            shell_command: None,
            tool: None,
            args: None,
            generator: None,
            subtasks: None,
            file_path: None,
            url: None,
            media_id: None,
            style: None,
            parent_id: None,
            dependencies: Vec::new(),
            template_id: None,
            schedule_id: None,
            is_template: false,
            result_summary: None,
            artifact_path: None,
            error_message: None,
            retry_count: 0,
            max_retries: 0,
            retry_policy_id: None,
            next_retry_at: None,
            last_retry_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn shell(command: &str) -> Self {
        let mut t = Self::new(TaskKind::Shell);
        t.shell_command = Some(command.to_string());
        t
    }

    pub fn llm(prompt: &str) -> Self {
        let mut t = Self::new(TaskKind::Llm);
        t.description = Some(prompt.to_string());
        t
    }

    pub fn planner(goal: &str) -> Self {
        let mut t = Self::new(TaskKind::Planner);
        t.description = Some(goal.to_string());
        t
    }

    pub fn tool(tool: &str, args: serde_json::Value) -> Self {
        let mut t = Self::new(TaskKind::Tool);
        t.tool = Some(tool.to_string());
        t.args = Some(args);
        t
    }

    pub fn media_download(url: &str) -> Self {
        let mut t = Self::new(TaskKind::MediaDownload);
        t.url = Some(url.to_string());
        t
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<i64>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Local readiness check — dependency completion is the store's call.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_retry_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// Deep-copy this template into a fresh pending instance.
    /// Keeps payload, drops identity/state/results.
    pub fn instantiate(&self, schedule_id: i64) -> Task {
        let mut t = self.clone();
        t.id = 0;
        t.status = TaskStatus::Pending;
        t.is_template = false;
        t.template_id = Some(self.id);
        t.schedule_id = Some(schedule_id);
        t.parent_id = None;
        t.dependencies = Vec::new();
        t.result_summary = None;
        t.artifact_path = None;
        t.error_message = None;
        t.retry_count = 0;
        t.next_retry_at = None;
        t.last_retry_error = None;
        t.created_at = Utc::now();
        t.started_at = None;
        t.finished_at = None;
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in TaskKind::all() {
            let parsed: TaskKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, *kind);
        }
        assert!("definitely_not_a_kind".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_kind_serde_names() {
        assert_eq!(
            serde_json::to_string(&TaskKind::RunCode).unwrap(),
            "\"run_code\""
        );
        assert_eq!(
            serde_json::to_string(&TaskKind::IndexMeili).unwrap(),
            "\"index_meili\""
        );
        let k: TaskKind = serde_json::from_str("\"media_transcribe\"").unwrap();
        assert_eq!(k, TaskKind::MediaTranscribe);
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Error));
        assert!(Running.can_transition_to(Pending)); // retry re-queue
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Error.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_instantiate_template() {
        let mut template = Task::shell("echo hi");
        template.id = 7;
        template.is_template = true;
        template.result_summary = Some("stale".into());
        template.retry_count = 2;

        let instance = template.instantiate(3);
        assert_eq!(instance.id, 0);
        assert_eq!(instance.status, TaskStatus::Pending);
        assert!(!instance.is_template);
        assert_eq!(instance.template_id, Some(7));
        assert_eq!(instance.schedule_id, Some(3));
        assert_eq!(instance.parent_id, None);
        assert_eq!(instance.result_summary, None);
        assert_eq!(instance.retry_count, 0);
        assert_eq!(instance.shell_command.as_deref(), Some("echo hi"));
    }

    #[test]
    fn test_retry_due() {
        let mut t = Task::shell("true");
        let now = Utc::now();
        assert!(t.retry_due(now));
        t.next_retry_at = Some(now + chrono::Duration::seconds(30));
        assert!(!t.retry_due(now));
        t.next_retry_at = Some(now - chrono::Duration::seconds(1));
        assert!(t.retry_due(now));
    }
}
