//! # Medlar CLI
//!
//! Task-orchestration engine for a local media/automation platform.
//!
//! Usage:
//!   medlar migrate up                      # Apply schema migrations
//!   medlar scheduler start                 # Run the engine + cron scheduler
//!   medlar task submit shell '{"shell_command": "echo hi"}'
//!   medlar task status 42
//!   medlar policy set shell '{"max_retries": 5}'
//!   medlar dashboard render
//!
//! Exit codes: 0 success, 1 generic failure, 2 invalid arguments,
//! 3 verification failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use medlar_core::traits::TaskStore;
use medlar_core::types::{RetryPolicy, Task, TaskKind};
use medlar_core::{MedlarConfig, MedlarError};
use medlar_db::{Migrator, SqliteStore};
use medlar_engine::{spawn_runner, Analytics, Dispatcher, RetryManager, TaskRunner};
use medlar_scheduler::{spawn_scheduler, Scheduler};

const EXIT_FAILURE: i32 = 1;
const EXIT_INVALID_ARGS: i32 = 2;
const EXIT_VERIFY_FAILED: i32 = 3;

#[derive(Parser)]
#[command(
    name = "medlar",
    version,
    about = "Medlar — task orchestration for a local media/automation platform"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Engine + cron scheduler process
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },

    /// Submit and inspect tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Retry policy administration
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Analytics dashboard
    Dashboard {
        #[command(subcommand)]
        action: DashboardAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Revert the most recent migration
    Down,
    /// Check the schema matches a fully migrated state
    Verify,
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// Run the task loop and scheduler until stopped
    Start,
    /// Ask a running scheduler process to shut down
    Stop,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Insert a task: medlar task submit <kind> <json-payload>
    Submit { kind: String, payload: String },
    /// Show a task with its retry history and events
    Status { id: i64 },
    /// Cancel a pending or running task
    Cancel { id: i64 },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Create or update the retry policy for a kind
    Set { kind: String, payload: String },
}

#[derive(Subcommand)]
enum DashboardAction {
    /// Write a static HTML report under outputs/
    Render,
}

/// Payload accepted by `task submit` — any subset of the task's fields.
#[derive(serde::Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SubmitPayload {
    description: Option<String>,
    shell_command: Option<String>,
    tool: Option<String>,
    args: Option<serde_json::Value>,
    generator: Option<String>,
    subtasks: Option<serde_json::Value>,
    file_path: Option<String>,
    url: Option<String>,
    media_id: Option<i64>,
    style: Option<String>,
    parent_id: Option<i64>,
    #[serde(default)]
    dependencies: Vec<i64>,
    max_retries: Option<u32>,
    #[serde(default)]
    is_template: bool,
}

/// Payload accepted by `policy set` — fields to overwrite.
#[derive(serde::Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PolicyPayload {
    max_retries: Option<u32>,
    backoff_strategy: Option<String>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    retryable_errors: Option<Vec<String>>,
    non_retryable_errors: Option<Vec<String>>,
    enabled: Option<bool>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match MedlarConfig::load(cli.config.as_deref().map(Path::new)) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(EXIT_INVALID_ARGS);
        }
    };

    let code = run(cli.command, config).await;
    std::process::exit(code);
}

async fn run(command: Commands, config: Arc<MedlarConfig>) -> i32 {
    match command {
        Commands::Migrate { action } => migrate(action, &config),
        Commands::Scheduler { action } => scheduler(action, config).await,
        Commands::Task { action } => task(action, config).await,
        Commands::Policy { action } => policy(action, config).await,
        Commands::Dashboard { action } => dashboard(action, config).await,
    }
}

fn open_store(config: &MedlarConfig) -> Result<Arc<SqliteStore>, i32> {
    if let Err(e) = config.ensure_dirs() {
        eprintln!("setup error: {e}");
        return Err(EXIT_FAILURE);
    }
    match SqliteStore::open(&config.database_path()) {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            eprintln!("store error: {e}");
            Err(EXIT_FAILURE)
        }
    }
}

fn migrate(action: MigrateAction, config: &MedlarConfig) -> i32 {
    if let Err(e) = config.ensure_dirs() {
        eprintln!("setup error: {e}");
        return EXIT_FAILURE;
    }
    let mut conn = match rusqlite::Connection::open(config.database_path()) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("store error: {e}");
            return EXIT_FAILURE;
        }
    };
    if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;") {
        eprintln!("store error: {e}");
        return EXIT_FAILURE;
    }

    match action {
        MigrateAction::Up => match Migrator::up(&mut conn) {
            Ok(applied) if applied.is_empty() => {
                println!("schema up to date");
                0
            }
            Ok(applied) => {
                println!("applied migration(s): {applied:?}");
                0
            }
            Err(e) => {
                eprintln!("migration error: {e}");
                EXIT_FAILURE
            }
        },
        MigrateAction::Down => match Migrator::down(&mut conn) {
            Ok(Some(version)) => {
                println!("reverted migration v{version}");
                0
            }
            Ok(None) => {
                println!("nothing to revert");
                0
            }
            Err(e) => {
                eprintln!("migration error: {e}");
                EXIT_FAILURE
            }
        },
        MigrateAction::Verify => match Migrator::verify(&conn) {
            Ok(report) if report.is_ok() => {
                println!(
                    "schema verified: {} migration(s) applied",
                    report.applied_versions.len()
                );
                0
            }
            Ok(report) => {
                for problem in &report.problems {
                    eprintln!("verify: {problem}");
                }
                EXIT_VERIFY_FAILED
            }
            Err(e) => {
                eprintln!("verify error: {e}");
                EXIT_FAILURE
            }
        },
    }
}

async fn scheduler(action: SchedulerAction, config: Arc<MedlarConfig>) -> i32 {
    match action {
        SchedulerAction::Start => {
            let store = match open_store(&config) {
                Ok(store) => store,
                Err(code) => return code,
            };
            if let Err(e) = store.migrate().await {
                eprintln!("migration error: {e}");
                return EXIT_FAILURE;
            }
            // Clear any stale stop request from a previous run.
            std::fs::remove_file(config.stop_marker()).ok();

            let dyn_store = store as Arc<dyn medlar_core::traits::TaskStore>;
            let analytics = Analytics::new(Arc::clone(&dyn_store));
            let registry = medlar_executors::build_registry(&config);
            let dispatcher = Arc::new(Dispatcher::new(registry, analytics));
            let retry = Arc::new(RetryManager::new(
                Arc::clone(&dyn_store),
                Duration::from_secs(config.retry.policy_cache_ttl_secs),
            ));
            let runner = Arc::new(TaskRunner::new(
                Arc::clone(&dyn_store),
                Arc::clone(&config),
                dispatcher,
                retry,
            ));
            let scheduler = Arc::new(Scheduler::new(Arc::clone(&dyn_store), Arc::clone(&config)));

            let cancel = CancellationToken::new();
            let runner_handle = tokio::spawn(spawn_runner(runner, cancel.clone()));
            let scheduler_handle = tokio::spawn(spawn_scheduler(
                scheduler,
                cancel.clone(),
                config.scheduler.tick_secs,
            ));

            println!("medlar engine running (ctrl-c or `medlar scheduler stop` to exit)");
            wait_for_shutdown(&config.stop_marker()).await;
            cancel.cancel();
            let _ = runner_handle.await;
            let _ = scheduler_handle.await;
            std::fs::remove_file(config.stop_marker()).ok();
            println!("medlar engine stopped");
            0
        }
        SchedulerAction::Stop => {
            if let Err(e) = config.ensure_dirs() {
                eprintln!("setup error: {e}");
                return EXIT_FAILURE;
            }
            if let Err(e) = std::fs::write(config.stop_marker(), "stop\n") {
                eprintln!("stop request failed: {e}");
                return EXIT_FAILURE;
            }
            println!("stop requested");
            0
        }
    }
}

/// Block until ctrl-c or the stop marker appears.
async fn wait_for_shutdown(stop_marker: &PathBuf) {
    let mut poll = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = poll.tick() => {
                if stop_marker.exists() {
                    tracing::info!("stop marker found, shutting down");
                    return;
                }
            }
        }
    }
}

async fn task(action: TaskAction, config: Arc<MedlarConfig>) -> i32 {
    let store = match open_store(&config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    if let Err(e) = store.migrate().await {
        eprintln!("migration error: {e}");
        return EXIT_FAILURE;
    }

    match action {
        TaskAction::Submit { kind, payload } => {
            let kind: TaskKind = match kind.parse() {
                Ok(kind) => kind,
                Err(e) => {
                    eprintln!("invalid kind: {e}");
                    return EXIT_INVALID_ARGS;
                }
            };
            let payload: SubmitPayload = match serde_json::from_str(&payload) {
                Ok(payload) => payload,
                Err(e) => {
                    eprintln!("invalid payload: {e}");
                    return EXIT_INVALID_ARGS;
                }
            };

            let mut task = Task::new(kind);
            task.description = payload.description;
            task.shell_command = payload.shell_command;
            task.tool = payload.tool;
            task.args = payload.args;
            task.generator = payload.generator;
            task.subtasks = payload.subtasks;
            task.file_path = payload.file_path;
            task.url = payload.url;
            task.media_id = payload.media_id;
            task.style = payload.style;
            task.parent_id = payload.parent_id;
            task.dependencies = payload.dependencies;
            task.is_template = payload.is_template;
            if let Some(max_retries) = payload.max_retries {
                task.max_retries = max_retries;
            }

            match store.insert_task(&task).await {
                Ok(id) => {
                    println!("task {id} submitted ({kind})");
                    0
                }
                Err(e @ MedlarError::CyclicDependency(_)) => {
                    eprintln!("{e}");
                    EXIT_INVALID_ARGS
                }
                Err(e) => {
                    eprintln!("submit failed: {e}");
                    EXIT_FAILURE
                }
            }
        }
        TaskAction::Status { id } => {
            let task = match store.get_task(id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    eprintln!("task {id} not found");
                    return EXIT_FAILURE;
                }
                Err(e) => {
                    eprintln!("status failed: {e}");
                    return EXIT_FAILURE;
                }
            };
            println!("{}", serde_json::to_string_pretty(&task).unwrap_or_default());

            if let Ok(attempts) = store.list_retry_attempts(id).await
                && !attempts.is_empty()
            {
                println!("\nretry history:");
                for a in attempts {
                    println!(
                        "  attempt {} at {} — {}{}",
                        a.attempt_number,
                        a.attempted_at.to_rfc3339(),
                        if a.success { "ok" } else { "failed" },
                        a.error_message
                            .map(|e| format!(": {e}"))
                            .unwrap_or_default(),
                    );
                }
            }
            if let Ok(events) = store.list_events(id).await
                && !events.is_empty()
            {
                println!("\nevents:");
                for e in events {
                    println!(
                        "  {} {}{}",
                        e.created_at.to_rfc3339(),
                        e.status,
                        e.duration_ms
                            .map(|d| format!(" ({d}ms)"))
                            .unwrap_or_default(),
                    );
                }
            }
            0
        }
        TaskAction::Cancel { id } => match store.cancel_task(id).await {
            Ok(true) => {
                if let Ok(Some(task)) = store.get_task(id).await {
                    Analytics::new(store.clone() as Arc<dyn medlar_core::traits::TaskStore>)
                        .task_cancelled(id, task.kind)
                        .await;
                }
                println!("task {id} cancelled");
                0
            }
            Ok(false) => {
                eprintln!("task {id} is not cancellable (missing or already terminal)");
                EXIT_FAILURE
            }
            Err(e) => {
                eprintln!("cancel failed: {e}");
                EXIT_FAILURE
            }
        },
    }
}

async fn policy(action: PolicyAction, config: Arc<MedlarConfig>) -> i32 {
    let store = match open_store(&config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    if let Err(e) = store.migrate().await {
        eprintln!("migration error: {e}");
        return EXIT_FAILURE;
    }

    match action {
        PolicyAction::Set { kind, payload } => {
            let kind: TaskKind = match kind.parse() {
                Ok(kind) => kind,
                Err(e) => {
                    eprintln!("invalid kind: {e}");
                    return EXIT_INVALID_ARGS;
                }
            };
            let payload: PolicyPayload = match serde_json::from_str(&payload) {
                Ok(payload) => payload,
                Err(e) => {
                    eprintln!("invalid payload: {e}");
                    return EXIT_INVALID_ARGS;
                }
            };

            let mut policy = match store.get_policy_by_kind(kind).await {
                Ok(Some(policy)) => policy,
                Ok(None) => RetryPolicy::default_for(kind),
                Err(e) => {
                    eprintln!("policy lookup failed: {e}");
                    return EXIT_FAILURE;
                }
            };
            if let Some(v) = payload.max_retries {
                policy.max_retries = v;
            }
            if let Some(v) = payload.backoff_strategy {
                match v.parse() {
                    Ok(strategy) => policy.backoff_strategy = strategy,
                    Err(e) => {
                        eprintln!("invalid payload: {e}");
                        return EXIT_INVALID_ARGS;
                    }
                }
            }
            if let Some(v) = payload.base_delay_ms {
                policy.base_delay_ms = v;
            }
            if let Some(v) = payload.max_delay_ms {
                policy.max_delay_ms = v;
            }
            if let Some(v) = payload.multiplier {
                policy.multiplier = v;
            }
            if let Some(v) = payload.retryable_errors {
                policy.retryable_errors = v;
            }
            if let Some(v) = payload.non_retryable_errors {
                policy.non_retryable_errors = v;
            }
            if let Some(v) = payload.enabled {
                policy.enabled = v;
            }

            match store.upsert_policy(&policy).await {
                Ok(_) => {
                    println!("policy for {kind} updated");
                    0
                }
                Err(e) => {
                    eprintln!("policy update failed: {e}");
                    EXIT_FAILURE
                }
            }
        }
    }
}

async fn dashboard(action: DashboardAction, config: Arc<MedlarConfig>) -> i32 {
    let store = match open_store(&config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    if let Err(e) = store.migrate().await {
        eprintln!("migration error: {e}");
        return EXIT_FAILURE;
    }

    match action {
        DashboardAction::Render => {
            let analytics = Analytics::new(store as Arc<dyn medlar_core::traits::TaskStore>);
            let stats = match analytics.stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    eprintln!("stats failed: {e}");
                    return EXIT_FAILURE;
                }
            };
            let html = Analytics::render_dashboard(&stats);
            let path = config.outputs_dir().join("dashboard.html");
            if let Err(e) = std::fs::write(&path, html) {
                eprintln!("write failed: {e}");
                return EXIT_FAILURE;
            }
            println!("dashboard written to {}", path.display());
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_payload_parses() {
        let payload: SubmitPayload = serde_json::from_str(
            r#"{"shell_command": "echo hi", "dependencies": [1, 2], "max_retries": 2}"#,
        )
        .unwrap();
        assert_eq!(payload.shell_command.as_deref(), Some("echo hi"));
        assert_eq!(payload.dependencies, vec![1, 2]);
        assert_eq!(payload.max_retries, Some(2));
    }

    #[test]
    fn test_submit_payload_rejects_unknown_fields() {
        let result = serde_json::from_str::<SubmitPayload>(r#"{"comand": "typo"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_policy_payload_parses() {
        let payload: PolicyPayload = serde_json::from_str(
            r#"{"max_retries": 5, "backoff_strategy": "linear", "retryable_errors": ["econnreset"]}"#,
        )
        .unwrap();
        assert_eq!(payload.max_retries, Some(5));
        assert_eq!(payload.backoff_strategy.as_deref(), Some("linear"));
    }
}
