//! Media pipeline executors — thin bodies over the external tool contracts
//! (yt-dlp, ffprobe, ffmpeg, whisper) and the index services. Every
//! subprocess gets an explicit argument vector.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use medlar_core::error::Result;
use medlar_core::traits::{ExecutionContext, Executor};
use medlar_core::types::{ExecutionResult, Task, TaskKind};
use medlar_core::util::truncate;
use medlar_providers::{SearchClient, TextGenClient, VectorIndex};

use crate::util::{artifact_path, run_argv, write_artifact};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "avi", "mov"];

fn require_file(task: &Task) -> std::result::Result<&str, ExecutionResult> {
    match task.file_path.as_deref() {
        Some(path) => Ok(path),
        None => Err(ExecutionResult::failure(format!(
            "{} task missing file_path",
            task.kind
        ))),
    }
}

// ── Download ───────────────────────────────────────────────

/// yt-dlp download, registered for both `youtube` and `media_download`.
pub struct MediaDownloadExecutor {
    kind: TaskKind,
}

impl MediaDownloadExecutor {
    pub fn youtube() -> Self {
        Self {
            kind: TaskKind::Youtube,
        }
    }

    pub fn download() -> Self {
        Self {
            kind: TaskKind::MediaDownload,
        }
    }
}

#[async_trait]
impl Executor for MediaDownloadExecutor {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let Some(url) = task.url.as_deref() else {
            return Ok(ExecutionResult::failure(format!(
                "{} task missing url",
                self.kind
            )));
        };

        let template = ctx
            .config
            .media_dir()
            .join("%(title)s.%(ext)s")
            .display()
            .to_string();
        let out = run_argv(
            "yt-dlp",
            &[
                "--no-playlist",
                "--no-simulate",
                "--print",
                "after_move:filepath",
                "-o",
                &template,
                url,
            ],
            &ctx.cancel,
        )
        .await?;

        if !out.success {
            return Ok(ExecutionResult::failure(format!(
                "yt-dlp exit {}: {}",
                out.exit_code,
                truncate(out.stderr.trim(), 300)
            )));
        }

        // `--print after_move:filepath` emits the final path on stdout.
        let Some(path) = out.stdout.lines().rev().find(|l| !l.trim().is_empty()) else {
            return Ok(ExecutionResult::failure("yt-dlp reported no output file"));
        };
        let path = path.trim().to_string();
        Ok(ExecutionResult::ok_with_summary(path.clone()).with_file_path(path))
    }
}

// ── Ingest ─────────────────────────────────────────────────

/// ffprobe metadata extraction.
pub struct MediaIngestExecutor;

#[async_trait]
impl Executor for MediaIngestExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::MediaIngest
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let file = match require_file(task) {
            Ok(file) => file,
            Err(result) => return Ok(result),
        };

        let out = run_argv(
            "ffprobe",
            &[
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                file,
            ],
            &ctx.cancel,
        )
        .await?;

        if !out.success {
            return Ok(ExecutionResult::failure(format!(
                "ffprobe exit {}: {}",
                out.exit_code,
                truncate(out.stderr.trim(), 300)
            )));
        }

        let path = artifact_path(&ctx.config, task, "ingest.json");
        write_artifact(&path, &out.stdout)?;

        let summary = summarize_probe(&out.stdout);
        Ok(ExecutionResult::ok_with_summary(summary)
            .with_output_path(path.display().to_string())
            .with_file_path(file.to_string()))
    }
}

/// "container=..., duration=...s, streams=N" from ffprobe JSON.
fn summarize_probe(raw: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(raw) else {
        return "probed (unparsed metadata)".to_string();
    };
    let container = parsed["format"]["format_name"].as_str().unwrap_or("unknown");
    let duration = parsed["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let streams = parsed["streams"].as_array().map(|s| s.len()).unwrap_or(0);
    format!("container={container}, duration={duration:.1}s, streams={streams}")
}

// ── Organize ───────────────────────────────────────────────

/// Move a file into the media library, bucketed by type.
pub struct MediaOrganizeExecutor;

#[async_trait]
impl Executor for MediaOrganizeExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::MediaOrganize
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let file = match require_file(task) {
            Ok(file) => file,
            Err(result) => return Ok(result),
        };
        let source = Path::new(file);
        let Some(name) = source.file_name() else {
            return Ok(ExecutionResult::failure(format!("bad file path: {file}")));
        };

        let bucket = match source.extension().and_then(|e| e.to_str()) {
            Some(ext) if VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()) => "video",
            _ => "audio",
        };
        let dest_dir = ctx.config.media_dir().join(bucket);
        std::fs::create_dir_all(&dest_dir).map_err(|e| {
            medlar_core::MedlarError::Executor(format!("create {}: {e}", dest_dir.display()))
        })?;
        let dest = dest_dir.join(name);

        if dest == source {
            let dest = dest.display().to_string();
            return Ok(ExecutionResult::ok_with_summary(dest.clone()).with_file_path(dest));
        }
        if let Err(e) = std::fs::rename(source, &dest) {
            return Ok(ExecutionResult::failure(format!(
                "move {file} -> {}: {e}",
                dest.display()
            )));
        }
        let dest = dest.display().to_string();
        Ok(ExecutionResult::ok_with_summary(dest.clone()).with_file_path(dest))
    }
}

// ── Transcribe ─────────────────────────────────────────────

/// Whisper transcription to a text artifact.
pub struct MediaTranscribeExecutor;

#[async_trait]
impl Executor for MediaTranscribeExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::MediaTranscribe
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let file = match require_file(task) {
            Ok(file) => file,
            Err(result) => return Ok(result),
        };
        let out_dir = ctx.config.outputs_dir().display().to_string();

        let out = run_argv(
            "whisper",
            &[
                file,
                "--model",
                "base",
                "--output_format",
                "txt",
                "--output_dir",
                &out_dir,
            ],
            &ctx.cancel,
        )
        .await?;

        if !out.success {
            return Ok(ExecutionResult::failure(format!(
                "whisper exit {}: {}",
                out.exit_code,
                truncate(out.stderr.trim(), 300)
            )));
        }

        let stem = Path::new(file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "transcript".to_string());
        let transcript = ctx.config.outputs_dir().join(format!("{stem}.txt"));
        let transcript = transcript.display().to_string();
        Ok(ExecutionResult::ok_with_summary(transcript.clone()).with_output_path(transcript))
    }
}

// ── Tag ────────────────────────────────────────────────────

/// LLM tagging over the transcript (or file name when none exists).
pub struct MediaTagExecutor {
    textgen: TextGenClient,
}

impl MediaTagExecutor {
    pub fn new(textgen: TextGenClient) -> Self {
        Self { textgen }
    }
}

#[async_trait]
impl Executor for MediaTagExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::MediaTag
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let subject = transcript_or_name(task);
        if subject.is_empty() {
            return Ok(ExecutionResult::failure("media_tag task has nothing to tag"));
        }

        let prompt = format!(
            "Produce 5-10 short lowercase tags for this media item, as a single \
             comma-separated line and nothing else.\n\n{subject}"
        );
        let tags = match self.textgen.generate(&prompt).await {
            Ok(tags) => tags,
            Err(e) => return Ok(ExecutionResult::failure(e.to_string())),
        };
        let tags = tags.lines().next().unwrap_or("").trim().to_string();

        let path = artifact_path(&ctx.config, task, "tags.txt");
        write_artifact(&path, &tags)?;
        Ok(ExecutionResult::ok_with_summary(tags)
            .with_output_path(path.display().to_string()))
    }
}

fn transcript_or_name(task: &Task) -> String {
    if let Some(path) = &task.file_path {
        if let Ok(content) = std::fs::read_to_string(path) {
            return truncate(&content, 4_000).to_string();
        }
        return Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
    }
    task.description.clone().unwrap_or_default()
}

// ── Indexing ───────────────────────────────────────────────

pub struct IndexMeiliExecutor {
    search: Arc<SearchClient>,
    index: String,
}

impl IndexMeiliExecutor {
    pub fn new(search: Arc<SearchClient>, index: String) -> Self {
        Self { search, index }
    }
}

#[async_trait]
impl Executor for IndexMeiliExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::IndexMeili
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let doc = index_document(task, ctx).await;
        match self.search.index_document(&self.index, &doc).await {
            Ok(()) => Ok(ExecutionResult::ok_with_summary(format!(
                "indexed into '{}'",
                self.index
            ))),
            Err(e) => Ok(ExecutionResult::failure(e.to_string())),
        }
    }
}

pub struct IndexChromaExecutor {
    similarity: Arc<dyn VectorIndex>,
}

impl IndexChromaExecutor {
    pub fn new(similarity: Arc<dyn VectorIndex>) -> Self {
        Self { similarity }
    }
}

#[async_trait]
impl Executor for IndexChromaExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::IndexChroma
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let doc = index_document(task, ctx).await;
        let text = doc["text"].as_str().unwrap_or_default().to_string();
        let subject = task.media_id.unwrap_or(task.id);
        match self.similarity.index_task(subject, &text).await {
            Ok(()) => Ok(ExecutionResult::ok_with_summary("indexed into vector store")),
            Err(e) => Ok(ExecutionResult::failure(e.to_string())),
        }
    }
}

/// The document both indexes share: id, path, and whatever text the parent
/// chain produced (tags, transcript summary).
async fn index_document(task: &Task, ctx: &ExecutionContext) -> serde_json::Value {
    let mut text = task.description.clone().unwrap_or_default();
    if let Some(parent_id) = task.parent_id
        && let Ok(Some(parent)) = ctx.store.get_task(parent_id).await
        && let Some(summary) = parent.result_summary
    {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&summary);
    }
    serde_json::json!({
        "id": task.media_id.unwrap_or(task.id),
        "path": task.file_path,
        "text": text,
    })
}

// ── Summarize / recommend ──────────────────────────────────

pub struct MediaSummarizeExecutor {
    textgen: TextGenClient,
    search: Arc<SearchClient>,
    index: String,
}

impl MediaSummarizeExecutor {
    pub fn new(textgen: TextGenClient, search: Arc<SearchClient>, index: String) -> Self {
        Self {
            textgen,
            search,
            index,
        }
    }
}

#[async_trait]
impl Executor for MediaSummarizeExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::MediaSummarize
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let subject = transcript_or_name(task);
        if subject.is_empty() {
            return Ok(ExecutionResult::failure(
                "media_summarize task has nothing to summarize",
            ));
        }

        let style = task.style.as_deref().unwrap_or("a short paragraph");
        let prompt = format!("Summarize this media item as {style}:\n\n{subject}");
        let summary = match self.textgen.generate(&prompt).await {
            Ok(summary) => summary,
            Err(e) => return Ok(ExecutionResult::failure(e.to_string())),
        };

        let path = artifact_path(&ctx.config, task, "summary.md");
        write_artifact(&path, &summary)?;

        // Index failure is logged, never fatal to the summarize task.
        let doc = serde_json::json!({
            "id": task.media_id.unwrap_or(task.id),
            "path": task.file_path,
            "text": summary,
        });
        if let Err(e) = self.search.index_document(&self.index, &doc).await {
            tracing::warn!("summary index for task {} failed: {e}", task.id);
        }

        Ok(
            ExecutionResult::ok_with_summary(truncate(summary.trim(), 500))
                .with_output_path(path.display().to_string()),
        )
    }
}

pub struct MediaRecommendExecutor {
    textgen: TextGenClient,
}

impl MediaRecommendExecutor {
    pub fn new(textgen: TextGenClient) -> Self {
        Self { textgen }
    }
}

#[async_trait]
impl Executor for MediaRecommendExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::MediaRecommend
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let subject = transcript_or_name(task);
        if subject.is_empty() {
            return Ok(ExecutionResult::failure(
                "media_recommend task has nothing to work from",
            ));
        }

        let prompt = format!(
            "Given this media item, recommend 5 related topics or items the \
             viewer may want next, one per line:\n\n{subject}"
        );
        let recommendations = match self.textgen.generate(&prompt).await {
            Ok(recommendations) => recommendations,
            Err(e) => return Ok(ExecutionResult::failure(e.to_string())),
        };

        let path = artifact_path(&ctx.config, task, "recommendations.md");
        write_artifact(&path, &recommendations)?;
        Ok(
            ExecutionResult::ok_with_summary(truncate(recommendations.trim(), 300))
                .with_output_path(path.display().to_string()),
        )
    }
}

// ── Video / audio analysis ─────────────────────────────────

/// ffmpeg scene-change detection; showinfo timestamps land on stderr.
pub struct VideoSceneDetectExecutor;

#[async_trait]
impl Executor for VideoSceneDetectExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::VideoSceneDetect
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let file = match require_file(task) {
            Ok(file) => file,
            Err(result) => return Ok(result),
        };

        let out = run_argv(
            "ffmpeg",
            &[
                "-i",
                file,
                "-filter:v",
                "select='gt(scene,0.4)',showinfo",
                "-f",
                "null",
                "-",
            ],
            &ctx.cancel,
        )
        .await?;

        if !out.success {
            return Ok(ExecutionResult::failure(format!(
                "ffmpeg exit {}: {}",
                out.exit_code,
                truncate(out.stderr.trim(), 300)
            )));
        }

        let timestamps = parse_showinfo_timestamps(&out.stderr);
        let path = artifact_path(&ctx.config, task, "scenes.json");
        write_artifact(&path, &serde_json::json!({ "scene_changes": timestamps }).to_string())?;
        Ok(
            ExecutionResult::ok_with_summary(format!("{} scene change(s)", timestamps.len()))
                .with_output_path(path.display().to_string()),
        )
    }
}

/// `pts_time:` values from ffmpeg showinfo output.
fn parse_showinfo_timestamps(stderr: &str) -> Vec<f64> {
    let mut timestamps = Vec::new();
    for line in stderr.lines() {
        if let Some(idx) = line.find("pts_time:") {
            let rest = &line[idx + "pts_time:".len()..];
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            if let Ok(ts) = token.parse::<f64>() {
                timestamps.push(ts);
            }
        }
    }
    timestamps
}

/// Stage one frame per second for a downstream detector.
pub struct VideoObjectDetectExecutor;

#[async_trait]
impl Executor for VideoObjectDetectExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::VideoObjectDetect
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let file = match require_file(task) {
            Ok(file) => file,
            Err(result) => return Ok(result),
        };

        let frames_dir = ctx
            .config
            .processing_dir()
            .join(format!("task-{}-frames", task.id));
        std::fs::create_dir_all(&frames_dir).map_err(|e| {
            medlar_core::MedlarError::Executor(format!("create {}: {e}", frames_dir.display()))
        })?;
        let pattern = frames_dir.join("frame-%05d.jpg").display().to_string();

        let out = run_argv(
            "ffmpeg",
            &["-i", file, "-vf", "fps=1", "-hide_banner", &pattern],
            &ctx.cancel,
        )
        .await?;

        if !out.success {
            return Ok(ExecutionResult::failure(format!(
                "ffmpeg exit {}: {}",
                out.exit_code,
                truncate(out.stderr.trim(), 300)
            )));
        }

        let frame_count = std::fs::read_dir(&frames_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        let path = artifact_path(&ctx.config, task, "frames.json");
        write_artifact(
            &path,
            &serde_json::json!({
                "frames_dir": frames_dir.display().to_string(),
                "frame_count": frame_count,
            })
            .to_string(),
        )?;
        Ok(
            ExecutionResult::ok_with_summary(format!("staged {frame_count} frame(s) for detection"))
                .with_output_path(path.display().to_string()),
        )
    }
}

/// ffmpeg volumedetect loudness stats.
pub struct AudioAnalyzeExecutor;

#[async_trait]
impl Executor for AudioAnalyzeExecutor {
    fn kind(&self) -> TaskKind {
        TaskKind::AudioAnalyze
    }

    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let file = match require_file(task) {
            Ok(file) => file,
            Err(result) => return Ok(result),
        };

        let out = run_argv(
            "ffmpeg",
            &["-i", file, "-af", "volumedetect", "-f", "null", "-"],
            &ctx.cancel,
        )
        .await?;

        if !out.success {
            return Ok(ExecutionResult::failure(format!(
                "ffmpeg exit {}: {}",
                out.exit_code,
                truncate(out.stderr.trim(), 300)
            )));
        }

        let stats = parse_volumedetect(&out.stderr);
        let path = artifact_path(&ctx.config, task, "audio.json");
        write_artifact(&path, &stats.to_string())?;
        let mean = stats["mean_volume_db"].as_f64().unwrap_or(0.0);
        let max = stats["max_volume_db"].as_f64().unwrap_or(0.0);
        Ok(
            ExecutionResult::ok_with_summary(format!("mean {mean:.1} dB, max {max:.1} dB"))
                .with_output_path(path.display().to_string()),
        )
    }
}

/// `mean_volume` / `max_volume` lines from volumedetect output.
fn parse_volumedetect(stderr: &str) -> serde_json::Value {
    let mut mean = None;
    let mut max = None;
    for line in stderr.lines() {
        if let Some(rest) = line.split("mean_volume:").nth(1) {
            mean = rest.trim().trim_end_matches(" dB").parse::<f64>().ok();
        }
        if let Some(rest) = line.split("max_volume:").nth(1) {
            max = rest.trim().trim_end_matches(" dB").parse::<f64>().ok();
        }
    }
    serde_json::json!({
        "mean_volume_db": mean,
        "max_volume_db": max,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_probe() {
        let raw = r#"{"format": {"format_name": "matroska,webm", "duration": "61.5"},
                      "streams": [{}, {}]}"#;
        let summary = summarize_probe(raw);
        assert!(summary.contains("matroska"));
        assert!(summary.contains("61.5s"));
        assert!(summary.contains("streams=2"));
        assert_eq!(summarize_probe("garbage"), "probed (unparsed metadata)");
    }

    #[test]
    fn test_parse_showinfo_timestamps() {
        let stderr = "\
[Parsed_showinfo_1 @ 0x1] n:0 pts:512 pts_time:1.28 duration:0.04\n\
some unrelated line\n\
[Parsed_showinfo_1 @ 0x1] n:1 pts:2048 pts_time:5.12 duration:0.04\n";
        let ts = parse_showinfo_timestamps(stderr);
        assert_eq!(ts, vec![1.28, 5.12]);
        assert!(parse_showinfo_timestamps("no matches").is_empty());
    }

    #[test]
    fn test_parse_volumedetect() {
        let stderr = "\
[Parsed_volumedetect_0 @ 0x2] mean_volume: -23.4 dB\n\
[Parsed_volumedetect_0 @ 0x2] max_volume: -4.0 dB\n";
        let stats = parse_volumedetect(stderr);
        assert_eq!(stats["mean_volume_db"], -23.4);
        assert_eq!(stats["max_volume_db"], -4.0);
    }

    #[test]
    fn test_transcript_or_name_falls_back() {
        let mut task = Task::new(TaskKind::MediaTag);
        task.file_path = Some("/nonexistent/dir/My Clip.mp4".into());
        assert_eq!(transcript_or_name(&task), "My Clip.mp4");

        let mut task = Task::new(TaskKind::MediaTag);
        task.description = Some("a cooking stream".into());
        assert_eq!(transcript_or_name(&task), "a cooking stream");
    }

    #[test]
    fn test_require_file() {
        let task = Task::new(TaskKind::MediaIngest);
        assert!(require_file(&task).is_err());
        let mut task = Task::new(TaskKind::MediaIngest);
        task.file_path = Some("/media/x.mp4".into());
        assert_eq!(require_file(&task).unwrap(), "/media/x.mp4");
    }
}
