use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use student_progress_core::{
    ActivityLogScan, BacklogEntry, ContentCatalog, EntityKind, LogEntryType, MigrationBacklog,
    NaturalKey, Progress, ProgressStatus,
};
use time::OffsetDateTime;

mod legacy;
mod options;
mod queue;
mod relational;

pub use legacy::LegacyStore;
pub use options::SqliteOptions;
pub use queue::SqliteTaskQueue;
pub use relational::RelationalStore;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS courses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS lessons (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  course_id INTEGER,
  title TEXT NOT NULL,
  FOREIGN KEY (course_id) REFERENCES courses(id)
);

CREATE TABLE IF NOT EXISTS quizzes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  lesson_id INTEGER NOT NULL UNIQUE,
  title TEXT NOT NULL,
  FOREIGN KEY (lesson_id) REFERENCES lessons(id)
);

CREATE TABLE IF NOT EXISTS activity_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  subject_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  entry_type TEXT NOT NULL CHECK (entry_type IN ('course_status','lesson_status')),
  status TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(subject_id, user_id, entry_type)
);

CREATE TABLE IF NOT EXISTS activity_log_meta (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id INTEGER NOT NULL,
  meta_key TEXT NOT NULL,
  meta_value TEXT NOT NULL,
  UNIQUE(entry_id, meta_key),
  FOREIGN KEY (entry_id) REFERENCES activity_log(id)
);

CREATE TABLE IF NOT EXISTS options (
  option_name TEXT PRIMARY KEY,
  option_value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_queue (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id TEXT NOT NULL UNIQUE,
  action TEXT NOT NULL,
  job_name TEXT NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('pending','claimed','done','failed','abandoned','cancelled')),
  enqueued_at TEXT NOT NULL,
  claimed_at TEXT,
  finished_at TEXT,
  last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_activity_log_type_subject ON activity_log(entry_type, subject_id);
CREATE INDEX IF NOT EXISTS idx_lessons_course ON lessons(course_id);
CREATE INDEX IF NOT EXISTS idx_task_queue_action_state ON task_queue(action, state);
CREATE UNIQUE INDEX IF NOT EXISTS idx_task_queue_pending_job
  ON task_queue(action, job_name) WHERE state = 'pending';
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS course_progress (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  course_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('in-progress','complete')),
  started_at TEXT NOT NULL,
  completed_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(course_id, user_id)
);

CREATE TABLE IF NOT EXISTS lesson_progress (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  lesson_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('in-progress','complete')),
  started_at TEXT NOT NULL,
  completed_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(lesson_id, user_id)
);

CREATE TABLE IF NOT EXISTS quiz_progress (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  quiz_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('in-progress','ungraded','graded','passed','failed')),
  started_at TEXT NOT NULL,
  completed_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(quiz_id, user_id)
);

CREATE TABLE IF NOT EXISTS quiz_submissions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  quiz_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  final_grade REAL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(quiz_id, user_id)
);

CREATE TABLE IF NOT EXISTS quiz_answers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  submission_id INTEGER NOT NULL,
  question_id INTEGER NOT NULL,
  value TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(submission_id, question_id),
  FOREIGN KEY (submission_id) REFERENCES quiz_submissions(id)
);

CREATE TABLE IF NOT EXISTS quiz_grades (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  answer_id INTEGER NOT NULL UNIQUE,
  submission_id INTEGER NOT NULL,
  question_id INTEGER NOT NULL,
  points INTEGER NOT NULL,
  feedback TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(submission_id, question_id),
  FOREIGN KEY (answer_id) REFERENCES quiz_answers(id),
  FOREIGN KEY (submission_id) REFERENCES quiz_submissions(id)
);

CREATE INDEX IF NOT EXISTS idx_quiz_answers_submission ON quiz_answers(submission_id);
CREATE INDEX IF NOT EXISTS idx_quiz_grades_submission ON quiz_grades(submission_id);
";

/// Legacy column values that record a quiz result on the lesson entry.
pub(crate) const QUIZ_COLUMN_STATUSES: [&str; 4] = ["ungraded", "graded", "passed", "failed"];

/// Shared handle to one `SQLite` database holding both storage representations, the
/// content catalog, the options table, and the task queue.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Progress row in representation-neutral form; the status is still raw text.
#[derive(Debug, Clone)]
pub(crate) struct RawProgress {
    pub id: i64,
    pub entity_id: i64,
    pub user_id: i64,
    pub status: String,
    pub started_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl RawProgress {
    pub(crate) fn into_progress<S: ProgressStatus>(self) -> Result<Progress<S>> {
        let status = S::parse(&self.status).ok_or_else(|| {
            anyhow!("unknown {} status in storage: {}", S::KIND.as_str(), self.status)
        })?;
        Ok(Progress {
            id: self.id,
            entity_id: self.entity_id,
            user_id: self.user_id,
            status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed progress store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn =
            self.conn.lock().map_err(|_| anyhow!("sqlite connection mutex was poisoned"))?;
        f(&mut conn)
    }

    #[must_use]
    pub fn legacy(&self) -> LegacyStore {
        LegacyStore::new(self.clone())
    }

    #[must_use]
    pub fn relational(&self) -> RelationalStore {
        RelationalStore::new(self.clone())
    }

    #[must_use]
    pub fn options(&self) -> SqliteOptions {
        SqliteOptions::new(self.clone())
    }

    #[must_use]
    pub fn task_queue(&self) -> SqliteTaskQueue {
        SqliteTaskQueue::new(self.clone())
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.with_conn(|conn| schema_status_on(conn))
    }

    /// Apply all forward schema migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when bootstrapping or any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
                .context("failed to apply schema_migrations table")?;

            let mut version = current_schema_version(conn)?;
            if version == 0 {
                version = bootstrap_schema_version(conn)?;
            }

            if version < 2 {
                apply_migration_2(conn)?;
                version = current_schema_version(conn)?;
            }

            if version != LATEST_SCHEMA_VERSION {
                return Err(anyhow!(
                    "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
                ));
            }

            tracing::debug!(version, "schema is up to date");
            Ok(())
        })
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.with_conn(|conn| {
            let quick_check_message: String = conn
                .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
                .context("failed to run PRAGMA quick_check")?;

            let mut stmt = conn
                .prepare("PRAGMA foreign_key_check")
                .context("failed to prepare PRAGMA foreign_key_check")?;
            let rows = stmt.query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })?;

            let mut foreign_key_violations = Vec::new();
            for row in rows {
                foreign_key_violations.push(row?);
            }
            drop(stmt);

            let schema_status = schema_status_on(conn)?;
            Ok(IntegrityReport {
                quick_check_ok: quick_check_message == "ok",
                quick_check_message,
                foreign_key_violations,
                schema_status,
            })
        })
    }

    /// # Errors
    /// Returns an error when the catalog row cannot be inserted.
    pub fn add_course(&self, title: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO courses(title) VALUES (?1)", params![title])
                .context("failed to insert course")?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// # Errors
    /// Returns an error when the catalog row cannot be inserted.
    pub fn add_lesson(&self, course_id: Option<i64>, title: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO lessons(course_id, title) VALUES (?1, ?2)",
                params![course_id, title],
            )
            .context("failed to insert lesson")?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// # Errors
    /// Returns an error when the lesson already has a quiz or the row cannot be inserted.
    pub fn add_quiz(&self, lesson_id: i64, title: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO quizzes(lesson_id, title) VALUES (?1, ?2)",
                params![lesson_id, title],
            )
            .with_context(|| format!("failed to insert quiz for lesson {lesson_id}"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn catalog_ids(&self, sql: &str) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).context("failed to prepare catalog query")?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    fn catalog_link(&self, sql: &str, id: i64) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let linked = conn
                .query_row(sql, params![id], |row| row.get::<_, Option<i64>>(0))
                .optional()
                .context("failed to query content catalog")?;
            Ok(linked.flatten())
        })
    }
}

impl ContentCatalog for SqliteStore {
    fn course_ids(&self) -> Result<Vec<i64>> {
        self.catalog_ids("SELECT id FROM courses ORDER BY id ASC")
    }

    fn lesson_ids(&self) -> Result<Vec<i64>> {
        self.catalog_ids("SELECT id FROM lessons ORDER BY id ASC")
    }

    fn quiz_ids(&self) -> Result<Vec<i64>> {
        self.catalog_ids("SELECT id FROM quizzes ORDER BY id ASC")
    }

    fn lesson_for_quiz(&self, quiz_id: i64) -> Result<Option<i64>> {
        self.catalog_link("SELECT lesson_id FROM quizzes WHERE id = ?1", quiz_id)
    }

    fn quiz_for_lesson(&self, lesson_id: i64) -> Result<Option<i64>> {
        self.catalog_link("SELECT id FROM quizzes WHERE lesson_id = ?1", lesson_id)
    }

    fn course_for_lesson(&self, lesson_id: i64) -> Result<Option<i64>> {
        self.catalog_link("SELECT course_id FROM lessons WHERE id = ?1", lesson_id)
    }
}

impl ActivityLogScan for SqliteStore {
    fn user_ids_with_entries(&self, subject_id: i64, entry_type: LogEntryType) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM activity_log
                 WHERE subject_id = ?1 AND entry_type = ?2
                 ORDER BY user_id ASC",
            )?;
            let rows = stmt
                .query_map(params![subject_id, entry_type.as_str()], |row| row.get::<_, i64>(0))?;
            let mut users = Vec::new();
            for row in rows {
                users.push(row?);
            }
            Ok(users)
        })
    }
}

// A progress entry stays in the backlog while the relational row is missing or has
// not caught up with a completion recorded on the legacy entry.
const BACKLOG_COURSE_PROGRESS_SQL: &str = r"
SELECT a.id, a.subject_id, a.user_id
FROM activity_log a
WHERE a.entry_type = 'course_status'
  AND a.id > ?1
  AND NOT EXISTS (
    SELECT 1 FROM course_progress p
    WHERE p.course_id = a.subject_id AND p.user_id = a.user_id
      AND (
        p.completed_at IS NOT NULL
        OR NOT EXISTS (
          SELECT 1 FROM activity_log_meta m WHERE m.entry_id = a.id AND m.meta_key = 'completed_at'
        )
      )
  )
ORDER BY a.id ASC
LIMIT ?2
";

const BACKLOG_LESSON_PROGRESS_SQL: &str = r"
SELECT a.id, a.subject_id, a.user_id
FROM activity_log a
WHERE a.entry_type = 'lesson_status'
  AND a.id > ?1
  AND NOT EXISTS (
    SELECT 1 FROM lesson_progress p
    WHERE p.lesson_id = a.subject_id AND p.user_id = a.user_id
      AND (
        p.completed_at IS NOT NULL
        OR NOT EXISTS (
          SELECT 1 FROM activity_log_meta m WHERE m.entry_id = a.id AND m.meta_key = 'completed_at'
        )
      )
  )
ORDER BY a.id ASC
LIMIT ?2
";

const BACKLOG_QUIZ_PROGRESS_SQL: &str = r"
SELECT a.id, q.id, a.user_id
FROM activity_log a
JOIN quizzes q ON q.lesson_id = a.subject_id
WHERE a.entry_type = 'lesson_status'
  AND a.id > ?1
  AND (
    a.status IN ('ungraded','graded','passed','failed')
    OR EXISTS (
      SELECT 1 FROM activity_log_meta m WHERE m.entry_id = a.id AND m.meta_key = 'quiz_start'
    )
  )
  AND NOT EXISTS (
    SELECT 1 FROM quiz_progress p
    WHERE p.quiz_id = q.id AND p.user_id = a.user_id
      AND (
        p.completed_at IS NOT NULL
        OR NOT EXISTS (
          SELECT 1 FROM activity_log_meta m
          WHERE m.entry_id = a.id AND m.meta_key = 'quiz_completed_at'
        )
      )
  )
ORDER BY a.id ASC
LIMIT ?2
";

// A submission stays in the backlog while the relational copy is missing, has fewer
// answers or grades than the legacy metadata, or lacks a final grade legacy has.
const BACKLOG_QUIZ_SUBMISSIONS_SQL: &str = r"
SELECT a.id, q.id, a.user_id
FROM activity_log a
JOIN quizzes q ON q.lesson_id = a.subject_id
WHERE a.entry_type = 'lesson_status'
  AND a.id > ?1
  AND EXISTS (
    SELECT 1 FROM activity_log_meta m WHERE m.entry_id = a.id AND m.meta_key = 'quiz_answers'
  )
  AND NOT EXISTS (
    SELECT 1 FROM quiz_submissions s
    WHERE s.quiz_id = q.id AND s.user_id = a.user_id
      AND (SELECT COUNT(*) FROM quiz_answers qa WHERE qa.submission_id = s.id) >= (
        SELECT COUNT(*)
        FROM activity_log_meta m,
             json_each(CASE WHEN json_valid(m.meta_value) THEN m.meta_value ELSE '{}' END)
        WHERE m.entry_id = a.id AND m.meta_key = 'quiz_answers'
      )
      AND (SELECT COUNT(*) FROM quiz_grades g WHERE g.submission_id = s.id) >= (
        SELECT COUNT(*)
        FROM activity_log_meta m,
             json_each(CASE WHEN json_valid(m.meta_value) THEN m.meta_value ELSE '{}' END)
        WHERE m.entry_id = a.id AND m.meta_key = 'quiz_grades'
      )
      AND (
        s.final_grade IS NOT NULL
        OR NOT EXISTS (
          SELECT 1 FROM activity_log_meta m WHERE m.entry_id = a.id AND m.meta_key = 'grade'
        )
      )
  )
ORDER BY a.id ASC
LIMIT ?2
";

impl MigrationBacklog for SqliteStore {
    fn pending_keys(
        &self,
        kind: EntityKind,
        after_entry_id: i64,
        limit: usize,
    ) -> Result<Vec<BacklogEntry>> {
        let sql = match kind {
            EntityKind::CourseProgress => BACKLOG_COURSE_PROGRESS_SQL,
            EntityKind::LessonProgress => BACKLOG_LESSON_PROGRESS_SQL,
            EntityKind::QuizProgress => BACKLOG_QUIZ_PROGRESS_SQL,
            EntityKind::QuizSubmission => BACKLOG_QUIZ_SUBMISSIONS_SQL,
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .with_context(|| format!("failed to prepare {} backlog query", kind.as_str()))?;
            let rows = stmt.query_map(params![after_entry_id, limit], |row| {
                Ok(BacklogEntry {
                    entry_id: row.get(0)?,
                    key: NaturalKey::new(row.get(1)?, row.get(2)?),
                })
            })?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }
}

fn schema_status_on(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let (current_version, inferred_from_legacy) = detect_effective_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
        inferred_from_legacy,
    })
}

fn bootstrap_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "activity_log")? {
        apply_migration_1(conn)?;
        return Ok(1);
    }

    if !table_has_column(conn, "activity_log", "entry_type")? {
        return Err(anyhow!("database schema is invalid: activity_log has no entry_type column"));
    }

    // Activity log created by the host application before version tracking existed.
    // Make sure the tables it may be missing are present.
    apply_migration_1(conn)?;

    if table_exists(conn, "course_progress")? {
        record_schema_version(conn, 2)?;
        return Ok(2);
    }

    Ok(1)
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply schema migration v1")?;
    record_schema_version(conn, 1)
}

fn apply_migration_2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().context("failed to start migration v2 transaction")?;
    tx.execute_batch(MIGRATION_002_SQL).context("failed to create relational progress tables")?;
    record_schema_version(&tx, 2)?;
    tx.commit().context("failed to commit migration v2")?;
    tracing::info!("applied schema migration v2 (relational progress tables)");
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "activity_log")? {
        return Ok((0, false));
    }

    if table_exists(conn, "course_progress")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

pub(crate) fn optional_rfc3339(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(rfc3339).transpose()
}

pub(crate) fn parse_optional_rfc3339(value: Option<&str>) -> Result<Option<OffsetDateTime>> {
    value.map(parse_rfc3339).transpose()
}
