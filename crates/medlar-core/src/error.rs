//! Unified error types for Medlar.

use thiserror::Error;

/// Result type alias using MedlarError.
pub type Result<T> = std::result::Result<T, MedlarError>;

#[derive(Error, Debug)]
pub enum MedlarError {
    // Store errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("cyclic_dependency: {0}")]
    CyclicDependency(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    // Dispatch errors
    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Unknown task type: {0}")]
    UnknownTaskKind(String),

    // Outbound service errors
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Cron error: {0}")]
    Cron(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MedlarError {
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn executor(msg: impl Into<String>) -> Self {
        Self::Executor(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn cron(msg: impl Into<String>) -> Self {
        Self::Cron(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MedlarError::Provider("timeout".into());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_cyclic_dependency_display() {
        // Callers match on the stable `cyclic_dependency` prefix.
        let err = MedlarError::CyclicDependency("4 -> 2".into());
        assert!(err.to_string().starts_with("cyclic_dependency"));
    }

    #[test]
    fn test_error_constructors() {
        let e1 = MedlarError::database("test");
        assert!(matches!(e1, MedlarError::Database(_)));

        let e2 = MedlarError::executor("test");
        assert!(matches!(e2, MedlarError::Executor(_)));

        let e3 = MedlarError::provider("test");
        assert!(matches!(e3, MedlarError::Provider(_)));

        let e4 = MedlarError::cron("test");
        assert!(matches!(e4, MedlarError::Cron(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MedlarError = io_err.into();
        assert!(matches!(err, MedlarError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: MedlarError = json_err.into();
        assert!(matches!(err, MedlarError::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }
        fn returns_err() -> Result<i32> {
            Err(MedlarError::Other("fail".into()))
        }
        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
