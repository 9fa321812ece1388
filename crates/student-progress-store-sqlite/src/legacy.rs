use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde_json::{Map, Value};
use student_progress_core::{
    Answer, AnswerRepository, Fetched, Grade, GradeRepository, LessonStatus, LogEntryType,
    NaturalKey, Progress, ProgressDraft, ProgressError, ProgressKind, ProgressRepository,
    ProgressStatus, QuizStatus, Submission, SubmissionDraft, SubmissionRepository,
};
use time::OffsetDateTime;

use crate::{
    optional_rfc3339, parse_optional_rfc3339, parse_rfc3339, rfc3339, RawProgress, SqliteStore,
    QUIZ_COLUMN_STATUSES,
};

const META_START: &str = "start";
const META_COMPLETED_AT: &str = "completed_at";
const META_QUIZ_START: &str = "quiz_start";
const META_QUIZ_COMPLETED_AT: &str = "quiz_completed_at";
const META_GRADE: &str = "grade";
const META_QUIZ_ANSWERS: &str = "quiz_answers";
const META_QUIZ_GRADES: &str = "quiz_grades";
const META_QUIZ_FEEDBACK: &str = "quiz_answers_feedback";
const META_QUESTIONS_ASKED: &str = "questions_asked";
const META_SUBMISSION_CREATED_AT: &str = "submission_created_at";
const META_SUBMISSION_UPDATED_AT: &str = "submission_updated_at";

const SUBMISSION_META_KEYS: [&str; 7] = [
    META_QUIZ_ANSWERS,
    META_QUIZ_GRADES,
    META_QUIZ_FEEDBACK,
    META_QUESTIONS_ASKED,
    META_GRADE,
    META_SUBMISSION_CREATED_AT,
    META_SUBMISSION_UPDATED_AT,
];

/// Progress and submission records kept as activity-log entries with typed metadata.
///
/// Course progress lives on a `course_status` entry for the course. Lesson progress,
/// quiz progress, and the quiz submission all share the `lesson_status` entry of the
/// quiz's lesson; record ids are entry ids.
#[derive(Clone)]
pub struct LegacyStore {
    store: SqliteStore,
}

struct LogEntry {
    id: i64,
    user_id: i64,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    meta: BTreeMap<String, String>,
}

impl LogEntry {
    fn meta_time(&self, key: &str) -> Result<Option<OffsetDateTime>> {
        parse_optional_rfc3339(self.meta.get(key).map(String::as_str))
            .with_context(|| format!("invalid {key} metadata on activity log entry {}", self.id))
    }

    fn has_quiz(&self) -> bool {
        self.meta.contains_key(META_QUIZ_START) || quiz_column_status(&self.status).is_some()
    }

    fn has_submission(&self) -> bool {
        self.meta.contains_key(META_QUIZ_ANSWERS)
    }

    fn json_object(&self, key: &str) -> Result<Map<String, Value>> {
        let Some(raw) = self.meta.get(key) else {
            return Ok(Map::new());
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(raw)
            .with_context(|| format!("invalid {key} metadata on activity log entry {}", self.id))?
        {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow!("{key} metadata on activity log entry {} is not a JSON object", self.id)),
        }
    }

    fn question_ids(&self) -> Result<Vec<i64>> {
        let Some(raw) = self.meta.get(META_QUESTIONS_ASKED) else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<i64>()
                    .with_context(|| format!("invalid question id in questions_asked: {part}"))
            })
            .collect()
    }
}

impl LegacyStore {
    pub(crate) fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

impl<S: ProgressStatus> ProgressRepository<S> for LegacyStore {
    fn create(&self, draft: &ProgressDraft<S>) -> Result<Progress<S>> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy progress transaction")?;
            let raw = create_progress(&tx, draft)?;
            tx.commit().context("failed to commit legacy progress")?;
            raw.into_progress()
        })
    }

    fn get(&self, key: NaturalKey) -> Result<Option<Progress<S>>> {
        self.store.with_conn(|conn| {
            read_progress(conn, S::KIND, key)?.map(RawProgress::into_progress).transpose()
        })
    }

    fn get_or_create(&self, draft: &ProgressDraft<S>) -> Result<Fetched<Progress<S>>> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy progress transaction")?;
            let fetched = match read_progress(&tx, S::KIND, draft.key)? {
                Some(existing) => Fetched::Existing(existing.into_progress()?),
                None => Fetched::Created(create_progress(&tx, draft)?.into_progress()?),
            };
            tx.commit().context("failed to commit legacy progress")?;
            Ok(fetched)
        })
    }

    fn save(&self, progress: &Progress<S>) -> Result<()> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy progress transaction")?;
            save_progress(&tx, progress)?;
            tx.commit().context("failed to commit legacy progress")
        })
    }
}

impl SubmissionRepository for LegacyStore {
    fn create_submission(&self, draft: &SubmissionDraft) -> Result<Submission> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy submission transaction")?;
            let submission = create_submission(&tx, draft)?;
            tx.commit().context("failed to commit legacy submission")?;
            Ok(submission)
        })
    }

    fn get_submission(&self, key: NaturalKey) -> Result<Option<Submission>> {
        self.store.with_conn(|conn| read_submission(conn, key))
    }

    fn get_or_create_submission(&self, draft: &SubmissionDraft) -> Result<Fetched<Submission>> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy submission transaction")?;
            let fetched = match read_submission(&tx, draft.key)? {
                Some(existing) => Fetched::Existing(existing),
                None => Fetched::Created(create_submission(&tx, draft)?),
            };
            tx.commit().context("failed to commit legacy submission")?;
            Ok(fetched)
        })
    }

    fn get_question_ids(&self, submission_id: i64) -> Result<Vec<i64>> {
        self.store.with_conn(|conn| match submission_entry(conn, submission_id)? {
            Some(entry) => entry.question_ids(),
            None => Ok(Vec::new()),
        })
    }

    fn save_submission(&self, submission: &Submission) -> Result<()> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy submission transaction")?;
            let entry = submission_entry(&tx, submission.id)?.ok_or_else(|| {
                anyhow!("legacy submission {} does not exist", submission.id)
            })?;
            match submission.final_grade {
                Some(grade) => set_meta(&tx, entry.id, META_GRADE, &grade.to_string())?,
                None => delete_meta(&tx, entry.id, META_GRADE)?,
            }
            set_meta(&tx, entry.id, META_SUBMISSION_CREATED_AT, &rfc3339(submission.created_at)?)?;
            set_meta(&tx, entry.id, META_SUBMISSION_UPDATED_AT, &rfc3339(submission.updated_at)?)?;
            tx.commit().context("failed to commit legacy submission")
        })
    }

    fn delete_submission(&self, submission: &Submission) -> Result<()> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy submission transaction")?;
            for key in SUBMISSION_META_KEYS {
                delete_meta(&tx, submission.id, key)?;
            }
            tx.commit().context("failed to commit legacy submission delete")
        })
    }
}

impl AnswerRepository for LegacyStore {
    fn create_answer(
        &self,
        submission: &Submission,
        question_id: i64,
        value: &str,
    ) -> Result<Answer> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy answer transaction")?;
            let entry = submission_entry(&tx, submission.id)?
                .ok_or_else(|| missing_submission(submission.id))?;

            let mut answers = entry.json_object(META_QUIZ_ANSWERS)?;
            answers.insert(question_id.to_string(), Value::String(value.to_string()));
            set_meta(&tx, entry.id, META_QUIZ_ANSWERS, &Value::Object(answers).to_string())?;

            let mut asked = entry.question_ids()?;
            if !asked.contains(&question_id) {
                asked.push(question_id);
                let joined = asked.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
                set_meta(&tx, entry.id, META_QUESTIONS_ASKED, &joined)?;
            }

            tx.commit().context("failed to commit legacy answer")?;
            Ok(Answer { submission_id: submission.id, question_id, value: value.to_string() })
        })
    }

    fn get_answers(&self, submission_id: i64) -> Result<Vec<Answer>> {
        self.store.with_conn(|conn| {
            let Some(entry) = submission_entry(conn, submission_id)? else {
                return Ok(Vec::new());
            };
            let mut answers = Vec::new();
            for (question, value) in entry.json_object(META_QUIZ_ANSWERS)? {
                let value = match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                answers.push(Answer { submission_id, question_id: parse_question(&question)?, value });
            }
            answers.sort_by_key(|answer| answer.question_id);
            Ok(answers)
        })
    }

    /// Clears the answers together with the grades and feedback keyed by them.
    fn delete_answers(&self, submission: &Submission) -> Result<()> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy answer delete")?;
            if submission_entry(&tx, submission.id)?.is_none() {
                return Ok(());
            }
            set_meta(&tx, submission.id, META_QUIZ_ANSWERS, "{}")?;
            set_meta(&tx, submission.id, META_QUESTIONS_ASKED, "")?;
            delete_meta(&tx, submission.id, META_QUIZ_GRADES)?;
            delete_meta(&tx, submission.id, META_QUIZ_FEEDBACK)?;
            tx.commit().context("failed to commit legacy answer delete")
        })
    }
}

impl GradeRepository for LegacyStore {
    fn create_grade(
        &self,
        submission: &Submission,
        question_id: i64,
        points: i64,
        feedback: Option<&str>,
    ) -> Result<Grade> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start legacy grade transaction")?;
            let entry = submission_entry(&tx, submission.id)?
                .ok_or_else(|| missing_submission(submission.id))?;

            let question = question_id.to_string();
            if !entry.json_object(META_QUIZ_ANSWERS)?.contains_key(&question) {
                return Err(ProgressError::MissingParentState(format!(
                    "answer ({}, {question_id}) is required before grading",
                    submission.id
                ))
                .into());
            }

            let mut grades = entry.json_object(META_QUIZ_GRADES)?;
            grades.insert(question.clone(), Value::from(points));
            set_meta(&tx, entry.id, META_QUIZ_GRADES, &Value::Object(grades).to_string())?;

            let mut notes = entry.json_object(META_QUIZ_FEEDBACK)?;
            match feedback {
                Some(text) => {
                    notes.insert(question, Value::String(text.to_string()));
                }
                None => {
                    notes.remove(&question);
                }
            }
            set_meta(&tx, entry.id, META_QUIZ_FEEDBACK, &Value::Object(notes).to_string())?;

            tx.commit().context("failed to commit legacy grade")?;
            Ok(Grade {
                submission_id: submission.id,
                question_id,
                points,
                feedback: feedback.map(str::to_string),
            })
        })
    }

    fn get_grades(&self, submission_id: i64) -> Result<Vec<Grade>> {
        self.store.with_conn(|conn| {
            let Some(entry) = submission_entry(conn, submission_id)? else {
                return Ok(Vec::new());
            };
            let notes = entry.json_object(META_QUIZ_FEEDBACK)?;
            let mut grades = Vec::new();
            for (question, value) in entry.json_object(META_QUIZ_GRADES)? {
                let points = value
                    .as_i64()
                    .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
                    .ok_or_else(|| anyhow!("invalid points for question {question}: {value}"))?;
                let feedback = notes.get(&question).and_then(Value::as_str).map(str::to_string);
                grades.push(Grade {
                    submission_id,
                    question_id: parse_question(&question)?,
                    points,
                    feedback,
                });
            }
            grades.sort_by_key(|grade| grade.question_id);
            Ok(grades)
        })
    }

    fn delete_grades(&self, submission: &Submission) -> Result<()> {
        self.store.with_conn(|conn| {
            delete_meta(conn, submission.id, META_QUIZ_GRADES)?;
            delete_meta(conn, submission.id, META_QUIZ_FEEDBACK)
        })
    }
}

fn entry_type_for(kind: ProgressKind) -> LogEntryType {
    match kind {
        ProgressKind::Course => LogEntryType::CourseStatus,
        ProgressKind::Lesson | ProgressKind::Quiz => LogEntryType::LessonStatus,
    }
}

/// Quiz result recorded in a lesson entry's status column, if any.
fn quiz_column_status(column: &str) -> Option<QuizStatus> {
    if QUIZ_COLUMN_STATUSES.contains(&column) {
        QuizStatus::parse(column)
    } else {
        None
    }
}

fn lesson_status_from_column(column: &str) -> LessonStatus {
    match column {
        "complete" | "graded" | "passed" => LessonStatus::Complete,
        _ => LessonStatus::InProgress,
    }
}

fn parse_question(raw: &str) -> Result<i64> {
    raw.parse::<i64>().with_context(|| format!("invalid question id in legacy metadata: {raw}"))
}

fn missing_submission(submission_id: i64) -> ProgressError {
    ProgressError::MissingParentState(format!(
        "submission {submission_id} does not exist in legacy storage"
    ))
}

fn query_entry<P: Params>(conn: &Connection, clause: &str, params: P) -> Result<Option<LogEntry>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT id, user_id, status, created_at, updated_at FROM activity_log WHERE {clause}"
            ),
            params,
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .context("failed to read activity log entry")?;

    let Some((id, user_id, status, created_at, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(LogEntry {
        id,
        user_id,
        status,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
        meta: load_meta(conn, id)?,
    }))
}

fn find_entry(
    conn: &Connection,
    subject_id: i64,
    user_id: i64,
    entry_type: LogEntryType,
) -> Result<Option<LogEntry>> {
    query_entry(
        conn,
        "subject_id = ?1 AND user_id = ?2 AND entry_type = ?3",
        params![subject_id, user_id, entry_type.as_str()],
    )
}

fn entry_by_id(conn: &Connection, id: i64, entry_type: LogEntryType) -> Result<Option<LogEntry>> {
    query_entry(conn, "id = ?1 AND entry_type = ?2", params![id, entry_type.as_str()])
}

fn submission_entry(conn: &Connection, submission_id: i64) -> Result<Option<LogEntry>> {
    Ok(entry_by_id(conn, submission_id, LogEntryType::LessonStatus)?
        .filter(LogEntry::has_submission))
}

fn load_meta(conn: &Connection, entry_id: i64) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn
        .prepare("SELECT meta_key, meta_value FROM activity_log_meta WHERE entry_id = ?1")
        .context("failed to prepare activity log metadata query")?;
    let rows = stmt.query_map(params![entry_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut meta = BTreeMap::new();
    for row in rows {
        let (key, value) = row?;
        meta.insert(key, value);
    }
    Ok(meta)
}

fn set_meta(conn: &Connection, entry_id: i64, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO activity_log_meta(entry_id, meta_key, meta_value) VALUES (?1, ?2, ?3)
         ON CONFLICT(entry_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value",
        params![entry_id, key, value],
    )
    .with_context(|| format!("failed to write {key} metadata on activity log entry {entry_id}"))?;
    Ok(())
}

fn delete_meta(conn: &Connection, entry_id: i64, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM activity_log_meta WHERE entry_id = ?1 AND meta_key = ?2",
        params![entry_id, key],
    )
    .with_context(|| format!("failed to delete {key} metadata on activity log entry {entry_id}"))?;
    Ok(())
}

fn set_time_meta(
    conn: &Connection,
    entry_id: i64,
    key: &str,
    value: Option<OffsetDateTime>,
) -> Result<()> {
    match optional_rfc3339(value)? {
        Some(text) => set_meta(conn, entry_id, key, &text),
        None => delete_meta(conn, entry_id, key),
    }
}

fn insert_entry(
    conn: &Connection,
    key: NaturalKey,
    entry_type: LogEntryType,
    status: &str,
    at: OffsetDateTime,
) -> Result<Option<i64>> {
    let stamp = rfc3339(at)?;
    let inserted = conn
        .execute(
            "INSERT INTO activity_log(subject_id, user_id, entry_type, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(subject_id, user_id, entry_type) DO NOTHING",
            params![key.entity_id, key.user_id, entry_type.as_str(), status, stamp],
        )
        .context("failed to insert activity log entry")?;
    Ok((inserted == 1).then(|| conn.last_insert_rowid()))
}

fn update_entry(
    conn: &Connection,
    id: i64,
    entry_type: LogEntryType,
    status: Option<&str>,
    updated_at: OffsetDateTime,
) -> Result<()> {
    let stamp = rfc3339(updated_at)?;
    let changed = match status {
        Some(status) => conn.execute(
            "UPDATE activity_log SET status = ?1, updated_at = ?2 WHERE id = ?3 AND entry_type = ?4",
            params![status, stamp, id, entry_type.as_str()],
        ),
        None => conn.execute(
            "UPDATE activity_log SET updated_at = ?1 WHERE id = ?2 AND entry_type = ?3",
            params![stamp, id, entry_type.as_str()],
        ),
    }
    .context("failed to update activity log entry")?;

    if changed == 0 {
        return Err(anyhow!("activity log entry {id} ({}) does not exist", entry_type.as_str()));
    }
    Ok(())
}

fn lesson_for_quiz(conn: &Connection, quiz_id: i64) -> Result<Option<i64>> {
    conn.query_row("SELECT lesson_id FROM quizzes WHERE id = ?1", params![quiz_id], |row| {
        row.get::<_, i64>(0)
    })
    .optional()
    .context("failed to resolve lesson for quiz")
}

/// The lesson entry that carries quiz state for `key`; its absence is a missing parent.
fn quiz_parent_entry(conn: &Connection, key: NaturalKey) -> Result<LogEntry> {
    let lesson = lesson_for_quiz(conn, key.entity_id)?.ok_or_else(|| {
        ProgressError::MissingParentState(format!("quiz {} is not attached to a lesson", key.entity_id))
    })?;
    let entry = find_entry(conn, lesson, key.user_id, LogEntryType::LessonStatus)?.ok_or_else(|| {
        ProgressError::MissingParentState(format!(
            "lesson progress ({lesson}, {}) is required before quiz {} activity",
            key.user_id, key.entity_id
        ))
    })?;
    Ok(entry)
}

fn read_progress(
    conn: &Connection,
    kind: ProgressKind,
    key: NaturalKey,
) -> Result<Option<RawProgress>> {
    match kind {
        ProgressKind::Course | ProgressKind::Lesson => {
            let Some(entry) = find_entry(conn, key.entity_id, key.user_id, entry_type_for(kind))?
            else {
                return Ok(None);
            };
            let status = if kind == ProgressKind::Lesson {
                lesson_status_from_column(&entry.status).as_str().to_string()
            } else {
                entry.status.clone()
            };
            Ok(Some(RawProgress {
                id: entry.id,
                entity_id: key.entity_id,
                user_id: key.user_id,
                status,
                started_at: entry.meta_time(META_START)?.unwrap_or(entry.created_at),
                completed_at: entry.meta_time(META_COMPLETED_AT)?,
                created_at: entry.created_at,
                updated_at: entry.updated_at,
            }))
        }
        ProgressKind::Quiz => {
            let Some(lesson) = lesson_for_quiz(conn, key.entity_id)? else {
                return Ok(None);
            };
            let Some(entry) = find_entry(conn, lesson, key.user_id, LogEntryType::LessonStatus)?
            else {
                return Ok(None);
            };
            if !entry.has_quiz() {
                return Ok(None);
            }
            let status = quiz_column_status(&entry.status).unwrap_or(QuizStatus::InProgress);
            let started_at = match entry.meta_time(META_QUIZ_START)? {
                Some(at) => at,
                None => entry.meta_time(META_START)?.unwrap_or(entry.created_at),
            };
            Ok(Some(RawProgress {
                id: entry.id,
                entity_id: key.entity_id,
                user_id: key.user_id,
                status: status.as_str().to_string(),
                started_at,
                completed_at: entry.meta_time(META_QUIZ_COMPLETED_AT)?,
                created_at: entry.created_at,
                updated_at: entry.updated_at,
            }))
        }
    }
}

fn create_progress<S: ProgressStatus>(
    conn: &Connection,
    draft: &ProgressDraft<S>,
) -> Result<RawProgress> {
    let now = OffsetDateTime::now_utc();
    let status = draft.status.as_str();

    match S::KIND {
        ProgressKind::Course | ProgressKind::Lesson => {
            let Some(id) = insert_entry(conn, draft.key, entry_type_for(S::KIND), status, now)?
            else {
                return Err(anyhow!(
                    "legacy {} progress {} already exists",
                    S::KIND.as_str(),
                    draft.key
                ));
            };
            set_time_meta(conn, id, META_START, Some(draft.started_at))?;
            set_time_meta(conn, id, META_COMPLETED_AT, draft.completed_at)?;
        }
        ProgressKind::Quiz => {
            let entry = quiz_parent_entry(conn, draft.key)?;
            if entry.has_quiz() {
                return Err(anyhow!("legacy quiz progress {} already exists", draft.key));
            }
            let column = QUIZ_COLUMN_STATUSES.contains(&status).then_some(status);
            update_entry(conn, entry.id, LogEntryType::LessonStatus, column, now)?;
            set_time_meta(conn, entry.id, META_QUIZ_START, Some(draft.started_at))?;
            set_time_meta(conn, entry.id, META_QUIZ_COMPLETED_AT, draft.completed_at)?;
        }
    }

    read_progress(conn, S::KIND, draft.key)?.ok_or_else(|| {
        anyhow!("legacy {} progress {} missing after insert", S::KIND.as_str(), draft.key)
    })
}

fn save_progress<S: ProgressStatus>(conn: &Connection, progress: &Progress<S>) -> Result<()> {
    let status = progress.status.as_str();

    match S::KIND {
        ProgressKind::Course => {
            update_entry(
                conn,
                progress.id,
                LogEntryType::CourseStatus,
                Some(status),
                progress.updated_at,
            )?;
            set_time_meta(conn, progress.id, META_START, Some(progress.started_at))?;
            set_time_meta(conn, progress.id, META_COMPLETED_AT, progress.completed_at)?;
        }
        ProgressKind::Lesson => {
            let entry = entry_by_id(conn, progress.id, LogEntryType::LessonStatus)?
                .ok_or_else(|| anyhow!("legacy lesson progress {} does not exist", progress.id))?;
            // A quiz result that already implies this lesson status stays in the column.
            let keep_quiz_status = quiz_column_status(&entry.status).is_some_and(|quiz| {
                lesson_status_from_column(quiz.as_str()).as_str() == status
            });
            let column = (!keep_quiz_status).then_some(status);
            update_entry(conn, entry.id, LogEntryType::LessonStatus, column, progress.updated_at)?;
            set_time_meta(conn, entry.id, META_START, Some(progress.started_at))?;
            set_time_meta(conn, entry.id, META_COMPLETED_AT, progress.completed_at)?;
        }
        ProgressKind::Quiz => {
            let entry = entry_by_id(conn, progress.id, LogEntryType::LessonStatus)?
                .ok_or_else(|| anyhow!("legacy quiz progress {} does not exist", progress.id))?;
            // An in-progress quiz hands the column back to the lesson status it implied.
            let column = if QUIZ_COLUMN_STATUSES.contains(&status) {
                Some(status)
            } else {
                quiz_column_status(&entry.status)
                    .map(|quiz| lesson_status_from_column(quiz.as_str()).as_str())
            };
            update_entry(conn, entry.id, LogEntryType::LessonStatus, column, progress.updated_at)?;
            set_time_meta(conn, progress.id, META_QUIZ_START, Some(progress.started_at))?;
            set_time_meta(conn, progress.id, META_QUIZ_COMPLETED_AT, progress.completed_at)?;
        }
    }
    Ok(())
}

fn read_submission(conn: &Connection, key: NaturalKey) -> Result<Option<Submission>> {
    let Some(lesson) = lesson_for_quiz(conn, key.entity_id)? else {
        return Ok(None);
    };
    let Some(entry) = find_entry(conn, lesson, key.user_id, LogEntryType::LessonStatus)? else {
        return Ok(None);
    };
    if !entry.has_submission() {
        return Ok(None);
    }

    let final_grade = entry
        .meta
        .get(META_GRADE)
        .map(|raw| {
            raw.trim()
                .parse::<f64>()
                .with_context(|| format!("invalid grade metadata on activity log entry {}", entry.id))
        })
        .transpose()?;

    Ok(Some(Submission {
        id: entry.id,
        quiz_id: key.entity_id,
        user_id: entry.user_id,
        final_grade,
        created_at: entry.meta_time(META_SUBMISSION_CREATED_AT)?.unwrap_or(entry.created_at),
        updated_at: entry.meta_time(META_SUBMISSION_UPDATED_AT)?.unwrap_or(entry.updated_at),
    }))
}

fn create_submission(conn: &Connection, draft: &SubmissionDraft) -> Result<Submission> {
    let entry = quiz_parent_entry(conn, draft.key)?;
    if entry.has_submission() {
        return Err(anyhow!("legacy submission {} already exists", draft.key));
    }

    set_meta(conn, entry.id, META_QUIZ_ANSWERS, "{}")?;
    set_meta(conn, entry.id, META_QUESTIONS_ASKED, "")?;
    set_meta(conn, entry.id, META_SUBMISSION_CREATED_AT, &rfc3339(draft.created_at)?)?;
    set_meta(conn, entry.id, META_SUBMISSION_UPDATED_AT, &rfc3339(draft.updated_at)?)?;
    if let Some(grade) = draft.final_grade {
        set_meta(conn, entry.id, META_GRADE, &grade.to_string())?;
    }

    read_submission(conn, draft.key)?
        .ok_or_else(|| anyhow!("legacy submission {} missing after insert", draft.key))
}
