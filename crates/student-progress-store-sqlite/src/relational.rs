use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use student_progress_core::{
    Answer, AnswerRepository, Fetched, Grade, GradeRepository, NaturalKey, Progress,
    ProgressDraft, ProgressError, ProgressKind, ProgressRepository, ProgressStatus, Submission,
    SubmissionDraft, SubmissionRepository,
};

use crate::{
    now_rfc3339, optional_rfc3339, parse_optional_rfc3339, parse_rfc3339, rfc3339, RawProgress,
    SqliteStore,
};

/// Progress and submission records kept in dedicated typed tables.
#[derive(Clone)]
pub struct RelationalStore {
    store: SqliteStore,
}

impl RelationalStore {
    pub(crate) fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

/// Table and entity column backing one progress kind.
fn progress_table(kind: ProgressKind) -> (&'static str, &'static str) {
    match kind {
        ProgressKind::Course => ("course_progress", "course_id"),
        ProgressKind::Lesson => ("lesson_progress", "lesson_id"),
        ProgressKind::Quiz => ("quiz_progress", "quiz_id"),
    }
}

type ProgressRow = (i64, i64, i64, String, String, Option<String>, String, String);

fn progress_from_row(row: &Row<'_>) -> rusqlite::Result<ProgressRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn read_progress(
    conn: &Connection,
    kind: ProgressKind,
    key: NaturalKey,
) -> Result<Option<RawProgress>> {
    let (table, column) = progress_table(kind);
    let row = conn
        .query_row(
            &format!(
                "SELECT id, {column}, user_id, status, started_at, completed_at, created_at, updated_at
                 FROM {table} WHERE {column} = ?1 AND user_id = ?2"
            ),
            params![key.entity_id, key.user_id],
            progress_from_row,
        )
        .optional()
        .with_context(|| format!("failed to read {table} row"))?;

    let Some((id, entity_id, user_id, status, started_at, completed_at, created_at, updated_at)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(RawProgress {
        id,
        entity_id,
        user_id,
        status,
        started_at: parse_rfc3339(&started_at)?,
        completed_at: parse_optional_rfc3339(completed_at.as_deref())?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    }))
}

/// Insert a progress row; `ON CONFLICT DO NOTHING` when `if_absent`. Returns whether a
/// row was written.
fn insert_progress<S: ProgressStatus>(
    conn: &Connection,
    draft: &ProgressDraft<S>,
    if_absent: bool,
) -> Result<bool> {
    let (table, column) = progress_table(S::KIND);
    let now = now_rfc3339()?;
    let conflict = if if_absent {
        format!("ON CONFLICT({column}, user_id) DO NOTHING")
    } else {
        String::new()
    };
    let inserted = conn
        .execute(
            &format!(
                "INSERT INTO {table}({column}, user_id, status, started_at, completed_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) {conflict}"
            ),
            params![
                draft.key.entity_id,
                draft.key.user_id,
                draft.status.as_str(),
                rfc3339(draft.started_at)?,
                optional_rfc3339(draft.completed_at)?,
                now,
            ],
        )
        .with_context(|| format!("failed to insert {table} row for {}", draft.key))?;
    Ok(inserted == 1)
}

impl<S: ProgressStatus> ProgressRepository<S> for RelationalStore {
    fn create(&self, draft: &ProgressDraft<S>) -> Result<Progress<S>> {
        self.store.with_conn(|conn| {
            insert_progress(conn, draft, false)?;
            read_progress(conn, S::KIND, draft.key)?
                .ok_or_else(|| anyhow!("{} progress {} missing after insert", S::KIND.as_str(), draft.key))?
                .into_progress()
        })
    }

    fn get(&self, key: NaturalKey) -> Result<Option<Progress<S>>> {
        self.store.with_conn(|conn| {
            read_progress(conn, S::KIND, key)?.map(RawProgress::into_progress).transpose()
        })
    }

    fn get_or_create(&self, draft: &ProgressDraft<S>) -> Result<Fetched<Progress<S>>> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start progress transaction")?;
            let created = insert_progress(&tx, draft, true)?;
            let progress = read_progress(&tx, S::KIND, draft.key)?
                .ok_or_else(|| anyhow!("{} progress {} missing after insert", S::KIND.as_str(), draft.key))?
                .into_progress()?;
            tx.commit().context("failed to commit progress transaction")?;
            Ok(if created { Fetched::Created(progress) } else { Fetched::Existing(progress) })
        })
    }

    fn save(&self, progress: &Progress<S>) -> Result<()> {
        let (table, _) = progress_table(S::KIND);
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {table}
                         SET status = ?1, started_at = ?2, completed_at = ?3, updated_at = ?4
                         WHERE id = ?5"
                    ),
                    params![
                        progress.status.as_str(),
                        rfc3339(progress.started_at)?,
                        optional_rfc3339(progress.completed_at)?,
                        rfc3339(progress.updated_at)?,
                        progress.id,
                    ],
                )
                .with_context(|| format!("failed to update {table} row {}", progress.id))?;
            if changed == 0 {
                return Err(anyhow!("{table} row {} does not exist", progress.id));
            }
            Ok(())
        })
    }
}

const SUBMISSION_COLUMNS: &str = "id, quiz_id, user_id, final_grade, created_at, updated_at";

type SubmissionRow = (i64, i64, i64, Option<f64>, String, String);

fn submission_from_row(row: &Row<'_>) -> rusqlite::Result<SubmissionRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn read_submission(conn: &Connection, key: NaturalKey) -> Result<Option<Submission>> {
    let row = conn
        .query_row(
            &format!("SELECT {SUBMISSION_COLUMNS} FROM quiz_submissions WHERE quiz_id = ?1 AND user_id = ?2"),
            params![key.entity_id, key.user_id],
            submission_from_row,
        )
        .optional()
        .context("failed to read quiz_submissions row")?;

    let Some((id, quiz_id, user_id, final_grade, created_at, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(Submission {
        id,
        quiz_id,
        user_id,
        final_grade,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    }))
}

fn insert_submission(conn: &Connection, draft: &SubmissionDraft, if_absent: bool) -> Result<bool> {
    let conflict = if if_absent { "ON CONFLICT(quiz_id, user_id) DO NOTHING" } else { "" };
    let inserted = conn
        .execute(
            &format!(
                "INSERT INTO quiz_submissions(quiz_id, user_id, final_grade, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5) {conflict}"
            ),
            params![
                draft.key.entity_id,
                draft.key.user_id,
                draft.final_grade,
                rfc3339(draft.created_at)?,
                rfc3339(draft.updated_at)?,
            ],
        )
        .with_context(|| format!("failed to insert quiz_submissions row for {}", draft.key))?;
    Ok(inserted == 1)
}

fn submission_exists(conn: &Connection, submission_id: i64) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM quiz_submissions WHERE id = ?1)",
            params![submission_id],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to check quiz_submissions row")?;
    Ok(exists == 1)
}

impl SubmissionRepository for RelationalStore {
    fn create_submission(&self, draft: &SubmissionDraft) -> Result<Submission> {
        self.store.with_conn(|conn| {
            insert_submission(conn, draft, false)?;
            read_submission(conn, draft.key)?
                .ok_or_else(|| anyhow!("submission {} missing after insert", draft.key))
        })
    }

    fn get_submission(&self, key: NaturalKey) -> Result<Option<Submission>> {
        self.store.with_conn(|conn| read_submission(conn, key))
    }

    fn get_or_create_submission(&self, draft: &SubmissionDraft) -> Result<Fetched<Submission>> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start submission transaction")?;
            let created = insert_submission(&tx, draft, true)?;
            let submission = read_submission(&tx, draft.key)?
                .ok_or_else(|| anyhow!("submission {} missing after insert", draft.key))?;
            tx.commit().context("failed to commit submission transaction")?;
            Ok(if created { Fetched::Created(submission) } else { Fetched::Existing(submission) })
        })
    }

    fn get_question_ids(&self, submission_id: i64) -> Result<Vec<i64>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT question_id FROM quiz_answers WHERE submission_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![submission_id], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    fn save_submission(&self, submission: &Submission) -> Result<()> {
        self.store.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE quiz_submissions SET final_grade = ?1, created_at = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![
                        submission.final_grade,
                        rfc3339(submission.created_at)?,
                        rfc3339(submission.updated_at)?,
                        submission.id,
                    ],
                )
                .context("failed to update quiz_submissions row")?;
            if changed == 0 {
                return Err(anyhow!("quiz_submissions row {} does not exist", submission.id));
            }
            Ok(())
        })
    }

    fn delete_submission(&self, submission: &Submission) -> Result<()> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start submission delete")?;
            tx.execute("DELETE FROM quiz_grades WHERE submission_id = ?1", params![submission.id])
                .context("failed to delete quiz_grades rows")?;
            tx.execute("DELETE FROM quiz_answers WHERE submission_id = ?1", params![submission.id])
                .context("failed to delete quiz_answers rows")?;
            tx.execute("DELETE FROM quiz_submissions WHERE id = ?1", params![submission.id])
                .context("failed to delete quiz_submissions row")?;
            tx.commit().context("failed to commit submission delete")
        })
    }
}

impl AnswerRepository for RelationalStore {
    fn create_answer(
        &self,
        submission: &Submission,
        question_id: i64,
        value: &str,
    ) -> Result<Answer> {
        self.store.with_conn(|conn| {
            if !submission_exists(conn, submission.id)? {
                return Err(ProgressError::MissingParentState(format!(
                    "submission {} does not exist in relational storage",
                    submission.id
                ))
                .into());
            }
            let now = now_rfc3339()?;
            conn.execute(
                "INSERT INTO quiz_answers(submission_id, question_id, value, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(submission_id, question_id)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![submission.id, question_id, value, now],
            )
            .context("failed to write quiz_answers row")?;
            Ok(Answer { submission_id: submission.id, question_id, value: value.to_string() })
        })
    }

    fn get_answers(&self, submission_id: i64) -> Result<Vec<Answer>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT question_id, value FROM quiz_answers
                 WHERE submission_id = ?1 ORDER BY question_id ASC",
            )?;
            let rows = stmt.query_map(params![submission_id], |row| {
                Ok(Answer { submission_id, question_id: row.get(0)?, value: row.get(1)? })
            })?;
            let mut answers = Vec::new();
            for row in rows {
                answers.push(row?);
            }
            Ok(answers)
        })
    }

    fn delete_answers(&self, submission: &Submission) -> Result<()> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start answer delete")?;
            tx.execute("DELETE FROM quiz_grades WHERE submission_id = ?1", params![submission.id])
                .context("failed to delete quiz_grades rows")?;
            tx.execute("DELETE FROM quiz_answers WHERE submission_id = ?1", params![submission.id])
                .context("failed to delete quiz_answers rows")?;
            tx.commit().context("failed to commit answer delete")
        })
    }
}

impl GradeRepository for RelationalStore {
    fn create_grade(
        &self,
        submission: &Submission,
        question_id: i64,
        points: i64,
        feedback: Option<&str>,
    ) -> Result<Grade> {
        self.store.with_conn(|conn| {
            let answer_id = conn
                .query_row(
                    "SELECT id FROM quiz_answers WHERE submission_id = ?1 AND question_id = ?2",
                    params![submission.id, question_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .context("failed to resolve quiz_answers row for grade")?
                .ok_or_else(|| {
                    ProgressError::MissingParentState(format!(
                        "answer ({}, {question_id}) is required before grading",
                        submission.id
                    ))
                })?;

            let now = now_rfc3339()?;
            conn.execute(
                "INSERT INTO quiz_grades(answer_id, submission_id, question_id, points, feedback, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(submission_id, question_id)
                 DO UPDATE SET points = excluded.points, feedback = excluded.feedback,
                               updated_at = excluded.updated_at",
                params![answer_id, submission.id, question_id, points, feedback, now],
            )
            .context("failed to write quiz_grades row")?;

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
            let mut stmt = conn.prepare(
                "SELECT question_id, points, feedback FROM quiz_grades
                 WHERE submission_id = ?1 ORDER BY question_id ASC",
            )?;
            let rows = stmt.query_map(params![submission_id], |row| {
                Ok(Grade {
                    submission_id,
                    question_id: row.get(0)?,
                    points: row.get(1)?,
                    feedback: row.get(2)?,
                })
            })?;
            let mut grades = Vec::new();
            for row in rows {
                grades.push(row?);
            }
            Ok(grades)
        })
    }

    fn delete_grades(&self, submission: &Submission) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute("DELETE FROM quiz_grades WHERE submission_id = ?1", params![submission.id])
                .context("failed to delete quiz_grades rows")?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use student_progress_core::{CourseStatus, QuizStatus};
    use time::Duration;

    use super::*;
    use crate::tests::{fixture_time, migrated_store};

    #[test]
    fn progress_get_or_create_reports_insertion_once() -> Result<()> {
        let store = migrated_store()?;
        let relational = store.relational();
        let at = fixture_time();
        let draft = ProgressDraft::<QuizStatus>::start(NaturalKey::new(4, 11), at);

        let first = relational.get_or_create(&draft)?;
        let second = relational.get_or_create(&draft)?;
        assert!(first.was_created());
        assert!(!second.was_created());

        let mut progress = second.into_inner();
        assert_eq!(progress.started_at, at);
        progress.set_quiz_status(QuizStatus::Failed, at + Duration::minutes(3));
        relational.save(&progress)?;

        let loaded: Option<Progress<QuizStatus>> = relational.get(NaturalKey::new(4, 11))?;
        let loaded = loaded.unwrap_or_else(|| panic!("quiz progress should exist"));
        assert_eq!(loaded.status, QuizStatus::Failed);
        assert_eq!(loaded.completed_at, Some(at + Duration::minutes(3)));

        let duplicate: Result<Progress<QuizStatus>> = relational.create(&draft);
        assert!(duplicate.is_err());
        Ok(())
    }

    #[test]
    fn save_rejects_unknown_row() -> Result<()> {
        let store = migrated_store()?;
        let relational = store.relational();
        let mut progress: Progress<CourseStatus> = relational
            .create(&ProgressDraft::start(NaturalKey::new(1, 1), fixture_time()))?;
        progress.id += 100;
        assert!(relational.save(&progress).is_err());
        Ok(())
    }

    #[test]
    fn grade_requires_answer_and_answers_upsert() -> Result<()> {
        let store = migrated_store()?;
        let relational = store.relational();
        let at = fixture_time();
        let submission =
            relational.create_submission(&SubmissionDraft::new(NaturalKey::new(4, 11), at))?;

        let Err(err) = relational.create_grade(&submission, 1, 3, None) else {
            return Err(anyhow!("grade without an answer should be rejected"));
        };
        assert!(matches!(
            err.downcast_ref::<ProgressError>(),
            Some(ProgressError::MissingParentState(_))
        ));

        relational.create_answer(&submission, 2, "first")?;
        relational.create_answer(&submission, 1, "x")?;
        relational.create_answer(&submission, 2, "second")?;
        assert_eq!(relational.get_question_ids(submission.id)?, vec![2, 1]);
        let answers = relational.get_answers(submission.id)?;
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[1].value, "second");

        relational.create_grade(&submission, 1, 3, None)?;
        relational.create_grade(&submission, 1, 4, Some("regraded"))?;
        let grades = relational.get_grades(submission.id)?;
        assert_eq!(grades.len(), 1);
        assert_eq!(grades[0].points, 4);
        assert_eq!(grades[0].feedback.as_deref(), Some("regraded"));

        let report = store.integrity_check()?;
        assert!(report.foreign_key_violations.is_empty());

        relational.delete_submission(&submission)?;
        assert!(relational.get_submission(NaturalKey::new(4, 11))?.is_none());
        assert!(relational.get_answers(submission.id)?.is_empty());

        let Err(err) = relational.create_answer(&submission, 1, "orphan") else {
            return Err(anyhow!("answer without a submission should be rejected"));
        };
        assert!(matches!(
            err.downcast_ref::<ProgressError>(),
            Some(ProgressError::MissingParentState(_))
        ));
        Ok(())
    }

    #[test]
    fn submission_round_trips_final_grade() -> Result<()> {
        let store = migrated_store()?;
        let relational = store.relational();
        let at = fixture_time();
        let key = NaturalKey::new(9, 2);
        let fetched = relational.get_or_create_submission(&SubmissionDraft::new(key, at))?;
        assert!(fetched.was_created());

        let mut submission = fetched.into_inner();
        submission.final_grade = Some(87.5);
        submission.updated_at = at + Duration::minutes(1);
        relational.save_submission(&submission)?;

        let again = relational.get_or_create_submission(&SubmissionDraft::new(key, at))?;
        assert!(!again.was_created());
        assert_eq!(again.get().final_grade, Some(87.5));
        assert_eq!(again.get().updated_at, at + Duration::minutes(1));
        Ok(())
    }
}
