//! Versioned, idempotent schema migrations.
//!
//! Each migration declares `up` and `down`. Applied versions are tracked in
//! `schema_migrations`; `up` replays only missing versions, so running it
//! repeatedly is safe. Additive task columns are removed on rollback via
//! `DROP COLUMN` (bundled SQLite is new enough); indexes over them must be
//! dropped first.

use rusqlite::Connection;

use medlar_core::error::{MedlarError, Result};

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

/// Default retry policies seeded for every kind at migration time.
/// (kind, max_retries, strategy, base_ms, max_ms, multiplier)
const SEED_POLICIES: &[(&str, u32, &str, u64, u64, f64)] = &[
    ("shell", 3, "exponential", 1_000, 60_000, 2.0),
    ("llm", 3, "exponential", 2_000, 120_000, 2.0),
    ("planner", 2, "exponential", 2_000, 120_000, 2.0),
    ("code", 2, "exponential", 2_000, 120_000, 2.0),
    ("review", 2, "exponential", 2_000, 120_000, 2.0),
    ("run_code", 1, "fixed", 1_000, 1_000, 1.0),
    ("batch", 1, "fixed", 1_000, 1_000, 1.0),
    ("tool", 3, "exponential", 1_000, 60_000, 2.0),
    ("youtube", 3, "exponential", 5_000, 300_000, 2.0),
    ("media_ingest", 3, "exponential", 1_000, 60_000, 2.0),
    ("media_organize", 2, "linear", 1_000, 30_000, 1.0),
    ("media_transcribe", 2, "exponential", 5_000, 300_000, 2.0),
    ("media_tag", 3, "exponential", 2_000, 120_000, 2.0),
    ("index_meili", 4, "exponential", 500, 30_000, 2.0),
    ("index_chroma", 4, "exponential", 500, 30_000, 2.0),
    ("media_summarize", 3, "exponential", 2_000, 120_000, 2.0),
    ("media_recommend", 2, "exponential", 2_000, 120_000, 2.0),
    ("video_scene_detect", 2, "exponential", 2_000, 120_000, 2.0),
    ("video_object_detect", 2, "exponential", 2_000, 120_000, 2.0),
    ("audio_analyze", 2, "exponential", 2_000, 120_000, 2.0),
    ("media_download", 3, "exponential", 5_000, 300_000, 2.0),
];

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core_tables",
        up: "
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                description TEXT,
                shell_command TEXT,
                tool TEXT,
                args TEXT,
                generator TEXT,
                subtasks TEXT,
                file_path TEXT,
                url TEXT,
                media_id INTEGER,
                style TEXT,
                parent_id INTEGER REFERENCES tasks(id) ON DELETE CASCADE,
                template_id INTEGER,
                schedule_id INTEGER,
                is_template INTEGER NOT NULL DEFAULT 0,
                result_summary TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_kind ON tasks(kind);
            CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_schedule ON tasks(schedule_id);

            CREATE TABLE IF NOT EXISTS task_dependencies (
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                depends_on INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                PRIMARY KEY (task_id, depends_on)
            );
            CREATE INDEX IF NOT EXISTS idx_deps_task ON task_dependencies(task_id);
            CREATE INDEX IF NOT EXISTS idx_deps_on ON task_dependencies(depends_on);

            CREATE TABLE IF NOT EXISTS task_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_ms INTEGER,
                retries INTEGER NOT NULL DEFAULT 0,
                error_reason TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_task ON task_logs(task_id);
            CREATE INDEX IF NOT EXISTS idx_logs_type ON task_logs(task_type);
            ",
        down: "
            DROP TABLE IF EXISTS task_logs;
            DROP TABLE IF EXISTS task_dependencies;
            DROP TABLE IF EXISTS tasks;
            ",
    },
    Migration {
        version: 2,
        name: "retry_support",
        up: "
            ALTER TABLE tasks ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE tasks ADD COLUMN max_retries INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE tasks ADD COLUMN retry_policy_id INTEGER;
            ALTER TABLE tasks ADD COLUMN next_retry_at TEXT;
            ALTER TABLE tasks ADD COLUMN last_retry_error TEXT;
            CREATE INDEX IF NOT EXISTS idx_tasks_retry_at ON tasks(next_retry_at);

            CREATE TABLE IF NOT EXISTS retry_policies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_kind TEXT NOT NULL UNIQUE,
                max_retries INTEGER NOT NULL DEFAULT 3,
                backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
                base_delay_ms INTEGER NOT NULL DEFAULT 1000,
                max_delay_ms INTEGER NOT NULL DEFAULT 300000,
                multiplier REAL NOT NULL DEFAULT 2.0,
                retryable_errors TEXT NOT NULL DEFAULT '[]',
                non_retryable_errors TEXT NOT NULL DEFAULT '[]',
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS retry_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                attempt_number INTEGER NOT NULL,
                attempted_at TEXT NOT NULL,
                error_message TEXT,
                error_type TEXT,
                delay_ms INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                execution_time_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_retry_task ON retry_history(task_id);
            ",
        down: "
            DROP TABLE IF EXISTS retry_history;
            DROP TABLE IF EXISTS retry_policies;
            DROP INDEX IF EXISTS idx_tasks_retry_at;
            ALTER TABLE tasks DROP COLUMN retry_count;
            ALTER TABLE tasks DROP COLUMN max_retries;
            ALTER TABLE tasks DROP COLUMN retry_policy_id;
            ALTER TABLE tasks DROP COLUMN next_retry_at;
            ALTER TABLE tasks DROP COLUMN last_retry_error;
            ",
    },
    Migration {
        version: 3,
        name: "artifact_path",
        // Best-effort backfill: summaries that look like filesystem paths
        // become the artifact path; the old column stays populated.
        up: "
            ALTER TABLE tasks ADD COLUMN artifact_path TEXT;
            UPDATE tasks SET artifact_path = result_summary
             WHERE artifact_path IS NULL
               AND result_summary IS NOT NULL
               AND (result_summary LIKE '/%'
                    OR result_summary LIKE './%'
                    OR result_summary LIKE '~/%');
            ",
        down: "
            ALTER TABLE tasks DROP COLUMN artifact_path;
            ",
    },
    Migration {
        version: 4,
        name: "schedules",
        up: "
            CREATE TABLE IF NOT EXISTS task_schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                template_task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                cron_expression TEXT NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                enabled INTEGER NOT NULL DEFAULT 1,
                max_instances INTEGER NOT NULL DEFAULT 1,
                overlap_policy TEXT NOT NULL DEFAULT 'skip',
                next_run_at TEXT,
                last_run_at TEXT,
                execution_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_due ON task_schedules(enabled, next_run_at);

            CREATE TABLE IF NOT EXISTS task_instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                schedule_id INTEGER NOT NULL REFERENCES task_schedules(id) ON DELETE CASCADE,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                run_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_instances_schedule ON task_instances(schedule_id);
            ",
        down: "
            DROP TABLE IF EXISTS task_instances;
            DROP TABLE IF EXISTS task_schedules;
            ",
    },
    Migration {
        version: 5,
        name: "planner_results",
        up: "
            CREATE TABLE IF NOT EXISTS planner_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                goal TEXT NOT NULL,
                model TEXT NOT NULL,
                context_task_ids TEXT NOT NULL DEFAULT '[]',
                subtask_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            ",
        down: "
            DROP TABLE IF EXISTS planner_results;
            ",
    },
];

/// Tables `verify` expects after a full `up`.
const EXPECTED_TABLES: &[&str] = &[
    "tasks",
    "task_dependencies",
    "task_logs",
    "retry_policies",
    "retry_history",
    "task_schedules",
    "task_instances",
    "planner_results",
];

/// Columns `verify` probes on the tasks table (additive migrations included).
const EXPECTED_TASK_COLUMNS: &[&str] = &[
    "id",
    "kind",
    "status",
    "parent_id",
    "is_template",
    "result_summary",
    "artifact_path",
    "error_message",
    "retry_count",
    "max_retries",
    "retry_policy_id",
    "next_retry_at",
    "last_retry_error",
    "created_at",
    "started_at",
    "finished_at",
];

/// Outcome of a `verify` pass.
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub applied_versions: Vec<u32>,
    pub problems: Vec<String>,
}

impl MigrationReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Runs the migration list against one connection.
pub struct Migrator;

impl Migrator {
    fn ensure_bookkeeping(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )
        .map_err(|e| MedlarError::Migration(format!("bookkeeping: {e}")))?;
        Ok(())
    }

    pub fn applied_versions(conn: &Connection) -> Result<Vec<u32>> {
        Self::ensure_bookkeeping(conn)?;
        let mut stmt = conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")
            .map_err(|e| MedlarError::Migration(format!("read versions: {e}")))?;
        let versions = stmt
            .query_map([], |row| row.get::<_, u32>(0))
            .map_err(|e| MedlarError::Migration(format!("read versions: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Migration(format!("read versions: {e}")))?;
        Ok(versions)
    }

    /// Apply every migration not yet recorded, in order. Seeds default
    /// retry policies after the retry tables exist.
    pub fn up(conn: &mut Connection) -> Result<Vec<u32>> {
        Self::ensure_bookkeeping(conn)?;
        let applied = Self::applied_versions(conn)?;
        let mut newly = Vec::new();

        for migration in MIGRATIONS {
            if applied.contains(&migration.version) {
                continue;
            }
            let tx = conn
                .transaction()
                .map_err(|e| MedlarError::Migration(format!("begin v{}: {e}", migration.version)))?;
            tx.execute_batch(migration.up).map_err(|e| {
                MedlarError::Migration(format!("apply v{} {}: {e}", migration.version, migration.name))
            })?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.name,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| MedlarError::Migration(format!("record v{}: {e}", migration.version)))?;
            tx.commit()
                .map_err(|e| MedlarError::Migration(format!("commit v{}: {e}", migration.version)))?;
            tracing::info!("migration v{} ({}) applied", migration.version, migration.name);
            newly.push(migration.version);
        }

        Self::seed_policies(conn)?;
        Ok(newly)
    }

    /// Revert the highest applied migration. Returns its version, or None
    /// when nothing is applied.
    pub fn down(conn: &mut Connection) -> Result<Option<u32>> {
        let applied = Self::applied_versions(conn)?;
        let Some(&last) = applied.last() else {
            return Ok(None);
        };
        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == last)
            .ok_or_else(|| MedlarError::Migration(format!("unknown applied version {last}")))?;

        let tx = conn
            .transaction()
            .map_err(|e| MedlarError::Migration(format!("begin down v{last}: {e}")))?;
        tx.execute_batch(migration.down)
            .map_err(|e| MedlarError::Migration(format!("revert v{last} {}: {e}", migration.name)))?;
        tx.execute(
            "DELETE FROM schema_migrations WHERE version = ?1",
            rusqlite::params![last],
        )
        .map_err(|e| MedlarError::Migration(format!("unrecord v{last}: {e}")))?;
        tx.commit()
            .map_err(|e| MedlarError::Migration(format!("commit down v{last}: {e}")))?;
        tracing::info!("migration v{last} ({}) reverted", migration.name);
        Ok(Some(last))
    }

    /// Insert any missing default policies. Never overwrites admin edits.
    pub fn seed_policies(conn: &Connection) -> Result<()> {
        // Only once the retry tables exist.
        if !Self::table_exists(conn, "retry_policies")? {
            return Ok(());
        }
        for (kind, max_retries, strategy, base_ms, max_ms, multiplier) in SEED_POLICIES {
            conn.execute(
                "INSERT OR IGNORE INTO retry_policies
                   (task_kind, max_retries, backoff_strategy, base_delay_ms, max_delay_ms, multiplier)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![kind, max_retries, strategy, *base_ms as i64, *max_ms as i64, multiplier],
            )
            .map_err(|e| MedlarError::Migration(format!("seed policy {kind}: {e}")))?;
        }
        Ok(())
    }

    fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                rusqlite::params![name],
                |row| row.get(0),
            )
            .map_err(|e| MedlarError::Migration(format!("probe {name}: {e}")))?;
        Ok(count > 0)
    }

    fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .map_err(|e| MedlarError::Migration(format!("table_info {table}: {e}")))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| MedlarError::Migration(format!("table_info {table}: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MedlarError::Migration(format!("table_info {table}: {e}")))?;
        Ok(names.iter().any(|n| n == column))
    }

    /// Check the schema matches a fully migrated state: all versions applied,
    /// all tables and probed columns present, seed policies in place.
    pub fn verify(conn: &Connection) -> Result<MigrationReport> {
        let mut report = MigrationReport {
            applied_versions: Self::applied_versions(conn)?,
            problems: Vec::new(),
        };

        for migration in MIGRATIONS {
            if !report.applied_versions.contains(&migration.version) {
                report
                    .problems
                    .push(format!("migration v{} ({}) not applied", migration.version, migration.name));
            }
        }
        for table in EXPECTED_TABLES {
            if !Self::table_exists(conn, table)? {
                report.problems.push(format!("missing table: {table}"));
            }
        }
        if Self::table_exists(conn, "tasks")? {
            for column in EXPECTED_TASK_COLUMNS {
                if !Self::column_exists(conn, "tasks", column)? {
                    report.problems.push(format!("missing column: tasks.{column}"));
                }
            }
        }
        if Self::table_exists(conn, "retry_policies")? {
            let seeded: u32 = conn
                .query_row("SELECT COUNT(*) FROM retry_policies", [], |row| row.get(0))
                .map_err(|e| MedlarError::Migration(format!("count policies: {e}")))?;
            if (seeded as usize) < SEED_POLICIES.len() {
                report.problems.push(format!(
                    "retry policies incomplete: {seeded}/{}",
                    SEED_POLICIES.len()
                ));
            }
        }
        Ok(report)
    }
}
