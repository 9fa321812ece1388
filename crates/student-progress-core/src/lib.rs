use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub const MIGRATION_STARTED_AT_KEY: &str = "migration_started_at";
pub const MIGRATION_COMPLETED_AT_KEY: &str = "migration_completed_at";
pub const MIGRATION_ERRORS_KEY: &str = "migration_errors";
pub const MIGRATION_JOB_PROGRESS_KEY: &str = "migration_job_progress";

/// Task-queue action name under which scheduler work units are enqueued.
pub const MIGRATION_JOB_ACTION: &str = "student_progress_migration_job";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProgressError {
    #[error("missing parent state: {0}")]
    MissingParentState(String),
    #[error("scheduler configuration error: no migration jobs are registered")]
    SchedulerConfiguration,
    #[error("unknown migration job: {0}")]
    UnknownJob(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// `(entity_id, user_id)` pair that identifies one record in either representation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NaturalKey {
    pub entity_id: i64,
    pub user_id: i64,
}

impl NaturalKey {
    #[must_use]
    pub fn new(entity_id: i64, user_id: i64) -> Self {
        Self { entity_id, user_id }
    }
}

impl Display for NaturalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.entity_id, self.user_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Course,
    Lesson,
    Quiz,
}

impl ProgressKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Course => "course",
            Self::Lesson => "lesson",
            Self::Quiz => "quiz",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    CourseProgress,
    LessonProgress,
    QuizProgress,
    QuizSubmission,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CourseProgress => "course_progress",
            Self::LessonProgress => "lesson_progress",
            Self::QuizProgress => "quiz_progress",
            Self::QuizSubmission => "quiz_submissions",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "course_progress" => Some(Self::CourseProgress),
            "lesson_progress" => Some(Self::LessonProgress),
            "quiz_progress" => Some(Self::QuizProgress),
            "quiz_submissions" => Some(Self::QuizSubmission),
            _ => None,
        }
    }
}

impl From<ProgressKind> for EntityKind {
    fn from(kind: ProgressKind) -> Self {
        match kind {
            ProgressKind::Course => Self::CourseProgress,
            ProgressKind::Lesson => Self::LessonProgress,
            ProgressKind::Quiz => Self::QuizProgress,
        }
    }
}

/// Type tag of a legacy activity-log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    CourseStatus,
    LessonStatus,
}

impl LogEntryType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CourseStatus => "course_status",
            Self::LessonStatus => "lesson_status",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "course_status" => Some(Self::CourseStatus),
            "lesson_status" => Some(Self::LessonStatus),
            _ => None,
        }
    }
}

/// Status vocabulary of one progress entity type.
pub trait ProgressStatus:
    Copy + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ProgressKind;
    const INITIAL: Self;

    fn as_str(self) -> &'static str;

    fn parse(value: &str) -> Option<Self>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CourseStatus {
    InProgress,
    Complete,
}

impl ProgressStatus for CourseStatus {
    const KIND: ProgressKind = ProgressKind::Course;
    const INITIAL: Self = Self::InProgress;

    fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Complete => "complete",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "in-progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LessonStatus {
    InProgress,
    Complete,
}

impl ProgressStatus for LessonStatus {
    const KIND: ProgressKind = ProgressKind::Lesson;
    const INITIAL: Self = Self::InProgress;

    fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Complete => "complete",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "in-progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum QuizStatus {
    InProgress,
    Ungraded,
    Graded,
    Passed,
    Failed,
}

impl QuizStatus {
    /// Whether a submission has been made (any status other than in-progress).
    #[must_use]
    pub fn is_submitted(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl ProgressStatus for QuizStatus {
    const KIND: ProgressKind = ProgressKind::Quiz;
    const INITIAL: Self = Self::InProgress;

    fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Ungraded => "ungraded",
            Self::Graded => "graded",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "in-progress" => Some(Self::InProgress),
            "ungraded" => Some(Self::Ungraded),
            "graded" => Some(Self::Graded),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One progress record. `id` is local to the representation it was read from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress<S> {
    pub id: i64,
    pub entity_id: i64,
    pub user_id: i64,
    pub status: S,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

pub type CourseProgress = Progress<CourseStatus>;
pub type LessonProgress = Progress<LessonStatus>;
pub type QuizProgress = Progress<QuizStatus>;

impl<S: ProgressStatus> Progress<S> {
    #[must_use]
    pub fn key(&self) -> NaturalKey {
        NaturalKey::new(self.entity_id, self.user_id)
    }

    /// Draft carrying this record's state verbatim, used to copy it into the other
    /// representation.
    #[must_use]
    pub fn to_draft(&self) -> ProgressDraft<S> {
        ProgressDraft {
            key: self.key(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    /// Overwrite the fields that must agree across representations.
    pub fn apply_state(&mut self, other: &Self) {
        self.status = other.status;
        self.started_at = other.started_at;
        self.completed_at = other.completed_at;
        self.updated_at = other.updated_at;
    }

    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        self.status == other.status
            && self.started_at == other.started_at
            && self.completed_at == other.completed_at
    }
}

impl Progress<CourseStatus> {
    pub fn complete(&mut self, at: OffsetDateTime) {
        self.status = CourseStatus::Complete;
        self.completed_at = Some(at);
        self.updated_at = at;
    }
}

impl Progress<LessonStatus> {
    pub fn complete(&mut self, at: OffsetDateTime) {
        self.status = LessonStatus::Complete;
        self.completed_at = Some(at);
        self.updated_at = at;
    }
}

impl Progress<QuizStatus> {
    pub fn set_quiz_status(&mut self, status: QuizStatus, at: OffsetDateTime) {
        self.status = status;
        self.completed_at = if status.is_submitted() { Some(at) } else { None };
        self.updated_at = at;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressDraft<S> {
    pub key: NaturalKey,
    pub status: S,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl<S: ProgressStatus> ProgressDraft<S> {
    #[must_use]
    pub fn start(key: NaturalKey, at: OffsetDateTime) -> Self {
        Self { key, status: S::INITIAL, started_at: at, completed_at: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    pub id: i64,
    pub quiz_id: i64,
    pub user_id: i64,
    pub final_grade: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Submission {
    #[must_use]
    pub fn key(&self) -> NaturalKey {
        NaturalKey::new(self.quiz_id, self.user_id)
    }

    #[must_use]
    pub fn to_draft(&self) -> SubmissionDraft {
        SubmissionDraft {
            key: self.key(),
            final_grade: self.final_grade,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionDraft {
    pub key: NaturalKey,
    pub final_grade: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubmissionDraft {
    #[must_use]
    pub fn new(key: NaturalKey, at: OffsetDateTime) -> Self {
        Self { key, final_grade: None, created_at: at, updated_at: at }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Answer {
    pub submission_id: i64,
    pub question_id: i64,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Grade {
    pub submission_id: i64,
    pub question_id: i64,
    pub points: i64,
    pub feedback: Option<String>,
}

/// Outcome of an idempotent fetch-or-create.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Existing(T),
    Created(T),
}

impl<T> Fetched<T> {
    #[must_use]
    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    #[must_use]
    pub fn get(&self) -> &T {
        match self {
            Self::Existing(value) | Self::Created(value) => value,
        }
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        match self {
            Self::Existing(value) | Self::Created(value) => value,
        }
    }
}

pub trait ProgressRepository<S: ProgressStatus> {
    /// Create a record for the draft's natural key.
    ///
    /// # Errors
    /// Returns [`ProgressError::MissingParentState`] when required parent state is absent,
    /// or a storage error when the key already exists or persistence fails.
    fn create(&self, draft: &ProgressDraft<S>) -> Result<Progress<S>>;

    /// # Errors
    /// Returns an error when the lookup fails.
    fn get(&self, key: NaturalKey) -> Result<Option<Progress<S>>>;

    /// Fetch the record for the draft's key, creating it from the draft when absent.
    ///
    /// # Errors
    /// Same as [`ProgressRepository::create`].
    fn get_or_create(&self, draft: &ProgressDraft<S>) -> Result<Fetched<Progress<S>>>;

    /// # Errors
    /// Returns an error when the record does not exist or persistence fails.
    fn save(&self, progress: &Progress<S>) -> Result<()>;
}

pub trait SubmissionRepository {
    /// # Errors
    /// Returns [`ProgressError::MissingParentState`] when the representation needs parent
    /// state that does not exist, or a storage error.
    fn create_submission(&self, draft: &SubmissionDraft) -> Result<Submission>;

    /// # Errors
    /// Returns an error when the lookup fails.
    fn get_submission(&self, key: NaturalKey) -> Result<Option<Submission>>;

    /// # Errors
    /// Same as [`SubmissionRepository::create_submission`].
    fn get_or_create_submission(&self, draft: &SubmissionDraft) -> Result<Fetched<Submission>>;

    /// Question IDs answered in the submission, in answer order.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    fn get_question_ids(&self, submission_id: i64) -> Result<Vec<i64>>;

    /// # Errors
    /// Returns an error when the submission does not exist or persistence fails.
    fn save_submission(&self, submission: &Submission) -> Result<()>;

    /// Delete the submission together with its answers and grades.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    fn delete_submission(&self, submission: &Submission) -> Result<()>;
}

pub trait AnswerRepository {
    /// Set the answer for one question; an existing answer is replaced.
    ///
    /// # Errors
    /// Returns [`ProgressError::MissingParentState`] when the submission is absent.
    fn create_answer(&self, submission: &Submission, question_id: i64, value: &str)
        -> Result<Answer>;

    /// # Errors
    /// Returns an error when the lookup fails.
    fn get_answers(&self, submission_id: i64) -> Result<Vec<Answer>>;

    /// # Errors
    /// Returns an error when persistence fails.
    fn delete_answers(&self, submission: &Submission) -> Result<()>;
}

pub trait GradeRepository {
    /// Set the grade for one answered question; an existing grade is replaced.
    ///
    /// # Errors
    /// Returns [`ProgressError::MissingParentState`] when the submission or the
    /// question's answer is absent.
    fn create_grade(
        &self,
        submission: &Submission,
        question_id: i64,
        points: i64,
        feedback: Option<&str>,
    ) -> Result<Grade>;

    /// # Errors
    /// Returns an error when the lookup fails.
    fn get_grades(&self, submission_id: i64) -> Result<Vec<Grade>>;

    /// # Errors
    /// Returns an error when persistence fails.
    fn delete_grades(&self, submission: &Submission) -> Result<()>;
}

/// Every repository contract one storage representation provides.
pub trait ActivityRepository:
    ProgressRepository<CourseStatus>
    + ProgressRepository<LessonStatus>
    + ProgressRepository<QuizStatus>
    + SubmissionRepository
    + AnswerRepository
    + GradeRepository
{
}

impl<T> ActivityRepository for T where
    T: ProgressRepository<CourseStatus>
        + ProgressRepository<LessonStatus>
        + ProgressRepository<QuizStatus>
        + SubmissionRepository
        + AnswerRepository
        + GradeRepository
{
}

/// Read access to the course/lesson/quiz catalog owned by the host application.
pub trait ContentCatalog {
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    fn course_ids(&self) -> Result<Vec<i64>>;
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    fn lesson_ids(&self) -> Result<Vec<i64>>;
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    fn quiz_ids(&self) -> Result<Vec<i64>>;
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    fn lesson_for_quiz(&self, quiz_id: i64) -> Result<Option<i64>>;
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    fn quiz_for_lesson(&self, lesson_id: i64) -> Result<Option<i64>>;
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    fn course_for_lesson(&self, lesson_id: i64) -> Result<Option<i64>>;
}

pub trait ActivityLogScan {
    /// Users with at least one activity-log entry of `entry_type` against `subject_id`.
    ///
    /// # Errors
    /// Returns an error when the scan query fails.
    fn user_ids_with_entries(&self, subject_id: i64, entry_type: LogEntryType) -> Result<Vec<i64>>;
}

/// A not-yet-reconciled record together with the legacy entry it lives on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BacklogEntry {
    pub entry_id: i64,
    pub key: NaturalKey,
}

pub trait MigrationBacklog {
    /// Natural keys whose legacy record has no relational counterpart, or whose
    /// relational counterpart lacks a legacy completion, final grade, answer or grade.
    /// Only legacy entry ids greater than `after_entry_id` are listed, oldest first.
    ///
    /// # Errors
    /// Returns an error when the backlog query fails.
    fn pending_keys(
        &self,
        kind: EntityKind,
        after_entry_id: i64,
        limit: usize,
    ) -> Result<Vec<BacklogEntry>>;
}

pub trait KeyValueStore {
    /// # Errors
    /// Returns an error when the value cannot be read or decoded.
    fn get(&self, key: &str) -> Result<Option<Value>>;
    /// # Errors
    /// Returns an error when the value cannot be persisted.
    fn set(&self, key: &str, value: &Value) -> Result<()>;
    /// # Errors
    /// Returns an error when the value cannot be removed.
    fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: String,
    pub action: String,
    pub job_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

/// A task that was claimed but never finished: the process running it went away.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbandonedTask {
    pub task: QueuedTask,
    pub reason: String,
}

/// Persistent, at-least-once task queue keyed by action name.
pub trait TaskQueue {
    /// Enqueue `job_name` under `action`. An identical pending entry is returned instead
    /// of creating a duplicate.
    ///
    /// # Errors
    /// Returns an error when the queue cannot be written.
    fn enqueue(&self, action: &str, job_name: &str) -> Result<QueuedTask>;

    /// Claim the oldest pending task of `action`; `None` when nothing is pending or a
    /// task of the same action is already claimed.
    ///
    /// # Errors
    /// Returns an error when the queue cannot be read or written.
    fn claim_next(&self, action: &str) -> Result<Option<QueuedTask>>;

    /// # Errors
    /// Returns an error when the task cannot be marked done.
    fn complete(&self, task_id: &str) -> Result<()>;

    /// # Errors
    /// Returns an error when the task cannot be marked failed.
    fn fail(&self, task_id: &str, reason: &str) -> Result<()>;

    /// Mark tasks claimed longer than `lease` ago as abandoned and return them.
    ///
    /// # Errors
    /// Returns an error when the queue cannot be read or written.
    fn recover_abandoned(&self, action: &str, lease: Duration) -> Result<Vec<AbandonedTask>>;

    /// # Errors
    /// Returns an error when the queue cannot be read.
    fn pending(&self, action: &str) -> Result<Vec<QueuedTask>>;

    /// Claimed tasks followed by pending ones, oldest first within each group.
    ///
    /// # Errors
    /// Returns an error when the queue cannot be read.
    fn active(&self, action: &str) -> Result<Vec<QueuedTask>>;

    /// # Errors
    /// Returns an error when the queue cannot be written.
    fn cancel_pending(&self, action: &str) -> Result<usize>;
}

/// Rollout stage of the relational representation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutStage {
    LegacyOnly,
    DualWriteReadLegacy,
    DualWriteReadRelational,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Legacy,
    Relational,
}

impl RolloutStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LegacyOnly => "legacy-only",
            Self::DualWriteReadLegacy => "dual-write-read-legacy",
            Self::DualWriteReadRelational => "dual-write-read-relational",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "legacy-only" => Some(Self::LegacyOnly),
            "dual-write-read-legacy" => Some(Self::DualWriteReadLegacy),
            "dual-write-read-relational" => Some(Self::DualWriteReadRelational),
            _ => None,
        }
    }

    /// Backend that serves reads and whose writes are authoritative.
    #[must_use]
    pub fn primary(self) -> Backend {
        match self {
            Self::LegacyOnly | Self::DualWriteReadLegacy => Backend::Legacy,
            Self::DualWriteReadRelational => Backend::Relational,
        }
    }

    /// Backend that receives best-effort mirrored writes, if any.
    #[must_use]
    pub fn mirror(self) -> Option<Backend> {
        match self {
            Self::LegacyOnly => None,
            Self::DualWriteReadLegacy => Some(Backend::Relational),
            Self::DualWriteReadRelational => Some(Backend::Legacy),
        }
    }

    #[must_use]
    pub fn writes_relational(self) -> bool {
        !matches!(self, Self::LegacyOnly)
    }

    #[must_use]
    pub fn reads_relational(self) -> bool {
        matches!(self, Self::DualWriteReadRelational)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MigrationConfig {
    pub progress_batch_size: usize,
    pub submission_batch_size: usize,
    pub enforce_hierarchy: bool,
    pub lease_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            progress_batch_size: 100,
            submission_batch_size: 50,
            enforce_hierarchy: false,
            lease_timeout_secs: 300,
        }
    }
}

impl MigrationConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or fails validation.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ProgressError::Validation`] when a batch size is zero.
    pub fn validate(&self) -> Result<(), ProgressError> {
        if self.progress_batch_size == 0 {
            return Err(ProgressError::Validation(
                "progress_batch_size MUST be >= 1".to_string(),
            ));
        }
        if self.submission_batch_size == 0 {
            return Err(ProgressError::Validation(
                "submission_batch_size MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

/// Durable per-job progress. `cursor` is the highest legacy entry id a batch has
/// scanned; `complete` is set once a batch finds nothing beyond it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounters {
    pub batches: u64,
    #[serde(default)]
    pub scanned_rows: u64,
    pub inserted_rows: u64,
    pub last_batch_inserted: Option<u64>,
    #[serde(default)]
    pub cursor: i64,
    #[serde(default)]
    pub complete: bool,
}

/// What one batch pass of a job reported.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchRecord {
    pub scanned: usize,
    pub inserted: usize,
    pub cursor: i64,
    pub complete: bool,
}

/// Durable scheduler bookkeeping, materialized from the key/value store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MigrationState {
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub errors: Vec<String>,
    pub jobs: BTreeMap<String, JobCounters>,
}

impl MigrationState {
    /// # Errors
    /// Returns an error when a stored value cannot be read or has the wrong shape.
    pub fn load<K: KeyValueStore + ?Sized>(kv: &K) -> Result<Self> {
        let started_at = kv.get(MIGRATION_STARTED_AT_KEY)?.and_then(|value| value.as_f64());
        let completed_at = kv.get(MIGRATION_COMPLETED_AT_KEY)?.and_then(|value| value.as_f64());
        let errors = match kv.get(MIGRATION_ERRORS_KEY)? {
            Some(value) => serde_json::from_value(value)
                .context("stored migration_errors is not a list of strings")?,
            None => Vec::new(),
        };
        let jobs = match kv.get(MIGRATION_JOB_PROGRESS_KEY)? {
            Some(value) => serde_json::from_value(value)
                .context("stored migration_job_progress has an unexpected shape")?,
            None => BTreeMap::new(),
        };
        Ok(Self { started_at, completed_at, errors, jobs })
    }

    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.started_at.is_some() && self.completed_at.is_none()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Writes to the durable scheduler keys. Errors are append-only.
#[derive(Debug, Clone)]
pub struct MigrationStateStore<K> {
    kv: K,
}

impl<K: KeyValueStore> MigrationStateStore<K> {
    #[must_use]
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    #[must_use]
    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// # Errors
    /// Returns an error when the durable state cannot be read.
    pub fn load(&self) -> Result<MigrationState> {
        MigrationState::load(&self.kv)
    }

    /// Stamp the start marker unless one is already present. Returns whether it was set.
    ///
    /// # Errors
    /// Returns an error when the durable state cannot be read or written.
    pub fn mark_started(&self, at: OffsetDateTime) -> Result<bool> {
        if self.kv.get(MIGRATION_STARTED_AT_KEY)?.is_some() {
            return Ok(false);
        }
        self.kv.set(MIGRATION_STARTED_AT_KEY, &Value::from(unix_seconds(at)))?;
        Ok(true)
    }

    /// # Errors
    /// Returns an error when the durable state cannot be written.
    pub fn mark_completed(&self, at: OffsetDateTime) -> Result<()> {
        self.kv.set(MIGRATION_COMPLETED_AT_KEY, &Value::from(unix_seconds(at)))
    }

    /// # Errors
    /// Returns an error when the durable state cannot be read or written.
    pub fn append_errors(&self, errors: &[String]) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut stored = self.load()?.errors;
        stored.extend(errors.iter().cloned());
        self.kv.set(MIGRATION_ERRORS_KEY, &serde_json::to_value(stored)?)
    }

    /// Append only the messages not already in the durable list and return them.
    ///
    /// # Errors
    /// Returns an error when the durable state cannot be read or written.
    pub fn append_new_errors(&self, errors: &[String]) -> Result<Vec<String>> {
        let mut stored = self.load()?.errors;
        let mut added = Vec::new();
        for error in errors {
            if !stored.contains(error) {
                stored.push(error.clone());
                added.push(error.clone());
            }
        }
        if !added.is_empty() {
            self.kv.set(MIGRATION_ERRORS_KEY, &serde_json::to_value(stored)?)?;
        }
        Ok(added)
    }

    /// Fold one batch into the job's counters. The cursor never moves backwards and
    /// completion is sticky until [`MigrationStateStore::clear`].
    ///
    /// # Errors
    /// Returns an error when the durable state cannot be read or written.
    pub fn record_batch(&self, job_name: &str, batch: &BatchRecord) -> Result<JobCounters> {
        let mut jobs = self.load()?.jobs;
        let scanned = u64::try_from(batch.scanned).unwrap_or(u64::MAX);
        let inserted = u64::try_from(batch.inserted).unwrap_or(u64::MAX);
        let counters = jobs.entry(job_name.to_string()).or_default();
        counters.batches += 1;
        counters.scanned_rows = counters.scanned_rows.saturating_add(scanned);
        counters.inserted_rows = counters.inserted_rows.saturating_add(inserted);
        counters.last_batch_inserted = Some(inserted);
        counters.cursor = counters.cursor.max(batch.cursor);
        counters.complete |= batch.complete;
        let snapshot = *counters;
        self.kv.set(MIGRATION_JOB_PROGRESS_KEY, &serde_json::to_value(jobs)?)?;
        Ok(snapshot)
    }

    /// # Errors
    /// Returns an error when any durable key cannot be removed.
    pub fn clear(&self) -> Result<()> {
        for key in [
            MIGRATION_STARTED_AT_KEY,
            MIGRATION_COMPLETED_AT_KEY,
            MIGRATION_ERRORS_KEY,
            MIGRATION_JOB_PROGRESS_KEY,
        ] {
            self.kv.delete(key)?;
        }
        Ok(())
    }
}

/// Seconds since the Unix epoch as a float, the format of the durable timestamp keys.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn unix_seconds(at: OffsetDateTime) -> f64 {
    at.unix_timestamp() as f64 + f64::from(at.nanosecond()) / 1_000_000_000.0
}

/// Keys present on one side only, plus common keys whose values differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedDiff<K> {
    pub only_left: Vec<K>,
    pub only_right: Vec<K>,
    pub changed: Vec<K>,
}

impl<K: Ord + Clone> KeyedDiff<K> {
    #[must_use]
    pub fn compute<V: PartialEq>(left: &BTreeMap<K, V>, right: &BTreeMap<K, V>) -> Self {
        let mut only_left = Vec::new();
        let mut changed = Vec::new();
        for (key, value) in left {
            match right.get(key) {
                Some(other) if other == value => {}
                Some(_) => changed.push(key.clone()),
                None => only_left.push(key.clone()),
            }
        }
        let only_right = right.keys().filter(|key| !left.contains_key(*key)).cloned().collect();
        Self { only_left, only_right, changed }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.only_left.is_empty() && self.only_right.is_empty() && self.changed.is_empty()
    }
}
