//! Process configuration — loaded once at startup, immutable for the
//! process lifetime. `BASE_PATH` in the environment overrides the file value.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MedlarError, Result};

/// Top-level configuration for the Medlar engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MedlarConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub textgen: TextGenConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for all derived directories and the database file.
    pub base_path: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_path: "~/.medlar".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextGenConfig {
    /// Base URL of the text-generation service.
    pub endpoint: String,
    /// Model name sent with every generate request.
    pub model: String,
}

impl Default for TextGenConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "qwen2.5:7b".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub url: String,
    pub index: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:7700".to_string(),
            index: "media".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub url: String,
    pub collection: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            collection: "tasks".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size. 0 = match CPU count.
    pub workers: usize,
    /// How often the task loop polls for ready work.
    pub poll_interval_ms: u64,
    /// Wall-clock budget per task execution.
    pub task_timeout_secs: u64,
    /// Warn (and throttle producers) when the ready queue grows past this.
    pub ready_queue_warn_depth: u64,
    /// Max ready tasks fetched per poll.
    pub batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            poll_interval_ms: 500,
            task_timeout_secs: 3600,
            ready_queue_warn_depth: 200,
            batch_size: 16,
        }
    }
}

impl EngineConfig {
    /// Effective worker count — `workers` or the CPU count when 0.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between schedule ticks.
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// TTL of the in-memory retry-policy cache.
    pub policy_cache_ttl_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy_cache_ttl_secs: 60,
        }
    }
}

impl MedlarConfig {
    /// Load configuration. Search order: explicit path, `$BASE_PATH/medlar.toml`,
    /// `~/.medlar/config.toml`, built-in defaults. A `BASE_PATH` env var always
    /// wins over the file's `paths.base_path`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::config_file(explicit) {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| MedlarError::Config(format!("read {}: {e}", path.display())))?;
                toml::from_str(&raw)
                    .map_err(|e| MedlarError::Config(format!("parse {}: {e}", path.display())))?
            }
            None => Self::default(),
        };
        if let Ok(base) = std::env::var("BASE_PATH")
            && !base.is_empty()
        {
            config.paths.base_path = base;
        }
        Ok(config)
    }

    fn config_file(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = explicit {
            return Some(p.to_path_buf());
        }
        if let Ok(base) = std::env::var("BASE_PATH") {
            let candidate = PathBuf::from(shellexpand::tilde(&base).into_owned()).join("medlar.toml");
            if candidate.exists() {
                return Some(candidate);
            }
        }
        let home = dirs::home_dir()?;
        let candidate = home.join(".medlar").join("config.toml");
        candidate.exists().then_some(candidate)
    }

    /// Expanded base path.
    pub fn base_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.paths.base_path).into_owned())
    }

    /// Path of the embedded database file.
    pub fn database_path(&self) -> PathBuf {
        self.base_path().join("medlar.db")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.base_path().join("outputs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_path().join("logs")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.base_path().join("tasks")
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.base_path().join("incoming")
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.base_path().join("processing")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.base_path().join("archive")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.base_path().join("error")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.base_path().join("media")
    }

    /// Marker file the scheduler loop polls for a stop request.
    pub fn stop_marker(&self) -> PathBuf {
        self.base_path().join("scheduler.stop")
    }

    /// Create every derived directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.base_path(),
            self.outputs_dir(),
            self.logs_dir(),
            self.tasks_dir(),
            self.incoming_dir(),
            self.processing_dir(),
            self.archive_dir(),
            self.error_dir(),
            self.media_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| MedlarError::Config(format!("create {}: {e}", dir.display())))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MedlarConfig::default();
        assert_eq!(config.scheduler.tick_secs, 60);
        assert_eq!(config.retry.policy_cache_ttl_secs, 60);
        assert!(config.engine.effective_workers() >= 1);
    }

    #[test]
    fn test_parse_partial_toml() {
        let raw = r#"
            [paths]
            base_path = "/tmp/medlar-test"

            [engine]
            workers = 2
            poll_interval_ms = 100
            task_timeout_secs = 30
            ready_queue_warn_depth = 10
            batch_size = 4
        "#;
        let config: MedlarConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.paths.base_path, "/tmp/medlar-test");
        assert_eq!(config.engine.workers, 2);
        // Missing sections fall back to defaults
        assert_eq!(config.textgen.endpoint, "http://localhost:11434");
    }

    #[test]
    fn test_derived_dirs() {
        let config: MedlarConfig = toml::from_str("[paths]\nbase_path = \"/data/medlar\"").unwrap();
        assert_eq!(config.outputs_dir(), PathBuf::from("/data/medlar/outputs"));
        assert_eq!(config.media_dir(), PathBuf::from("/data/medlar/media"));
        assert_eq!(config.database_path(), PathBuf::from("/data/medlar/medlar.db"));
    }
}
