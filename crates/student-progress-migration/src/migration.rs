use std::collections::BTreeSet;
use std::marker::PhantomData;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use student_progress_core::{
    AnswerRepository, ContentCatalog, CourseStatus, EntityKind, Fetched, GradeRepository,
    LessonStatus, MigrationBacklog, NaturalKey, ProgressError, ProgressKind, ProgressRepository,
    ProgressStatus, SubmissionRepository,
};

/// What one batch pass of a migration did.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationBatch {
    /// Backlog entries examined, whether or not they could be copied.
    pub scanned: usize,
    /// Relational rows written: new records, backfilled children and caught-up
    /// completions.
    pub inserted: usize,
    /// Highest legacy entry id examined; the next pass starts after it.
    pub cursor: i64,
}

impl MigrationBatch {
    /// An empty scan past the cursor: nothing of this entity type is left to copy.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.scanned == 0
    }
}

/// Copies one entity type from the legacy representation into the relational one.
pub trait Migration {
    fn kind(&self) -> EntityKind;

    /// Copy at most `batch_size` backlog entries whose legacy entry id is greater than
    /// `after_entry_id`.
    ///
    /// Per-record failures do not fail the batch, they are collected for
    /// [`Migration::take_errors`] and the cursor still moves past them.
    ///
    /// # Errors
    /// Returns an error when the backlog itself cannot be read.
    fn run(&mut self, after_entry_id: i64, batch_size: usize) -> Result<MigrationBatch>;

    fn take_errors(&mut self) -> Vec<String>;
}

/// Decides whether a record may be copied before its parent has been migrated.
pub trait ParentGate {
    /// `Some(reason)` when the record's parent is missing from the relational side.
    ///
    /// # Errors
    /// Returns an error when the catalog or the relational side cannot be read.
    fn blocked_reason(&self, key: NaturalKey) -> Result<Option<String>>;
}

/// Gates lesson progress on course progress and quiz progress on lesson progress.
pub struct HierarchyGate<C, R> {
    kind: ProgressKind,
    catalog: C,
    relational: R,
}

impl<C, R> HierarchyGate<C, R> {
    #[must_use]
    pub fn new(kind: ProgressKind, catalog: C, relational: R) -> Self {
        Self { kind, catalog, relational }
    }
}

fn is_migrated<S, R>(relational: &R, key: NaturalKey) -> Result<bool>
where
    S: ProgressStatus,
    R: ProgressRepository<S>,
{
    Ok(relational.get(key)?.is_some())
}

impl<C, R> ParentGate for HierarchyGate<C, R>
where
    C: ContentCatalog,
    R: ProgressRepository<CourseStatus> + ProgressRepository<LessonStatus>,
{
    fn blocked_reason(&self, key: NaturalKey) -> Result<Option<String>> {
        match self.kind {
            ProgressKind::Course => Ok(None),
            ProgressKind::Lesson => {
                let Some(course_id) = self.catalog.course_for_lesson(key.entity_id)? else {
                    return Ok(None);
                };
                let parent = NaturalKey::new(course_id, key.user_id);
                if is_migrated::<CourseStatus, _>(&self.relational, parent)? {
                    Ok(None)
                } else {
                    Ok(Some(format!("course progress {parent} has not been migrated")))
                }
            }
            ProgressKind::Quiz => {
                let Some(lesson_id) = self.catalog.lesson_for_quiz(key.entity_id)? else {
                    return Ok(None);
                };
                let parent = NaturalKey::new(lesson_id, key.user_id);
                if is_migrated::<LessonStatus, _>(&self.relational, parent)? {
                    Ok(None)
                } else {
                    Ok(Some(format!("lesson progress {parent} has not been migrated")))
                }
            }
        }
    }
}

/// Run `copy` over one batch of backlog entries after `after_entry_id`.
fn copy_batch<B>(
    backlog: &B,
    kind: EntityKind,
    after_entry_id: i64,
    batch_size: usize,
    errors: &mut Vec<String>,
    mut copy: impl FnMut(NaturalKey) -> Result<usize>,
) -> Result<MigrationBatch>
where
    B: MigrationBacklog + ?Sized,
{
    let entries = backlog.pending_keys(kind, after_entry_id, batch_size.max(1))?;
    let mut batch =
        MigrationBatch { scanned: entries.len(), inserted: 0, cursor: after_entry_id };

    for entry in &entries {
        batch.cursor = batch.cursor.max(entry.entry_id);
        match copy(entry.key) {
            Ok(count) => batch.inserted += count,
            Err(err) => {
                tracing::warn!(
                    entity = kind.as_str(),
                    key = %entry.key,
                    error = %format!("{err:#}"),
                    "failed to migrate record"
                );
                errors.push(format!("failed to migrate {} {}: {err:#}", kind.as_str(), entry.key));
            }
        }
    }

    tracing::info!(
        entity = kind.as_str(),
        scanned = batch.scanned,
        inserted = batch.inserted,
        cursor = batch.cursor,
        "migration batch finished"
    );
    Ok(batch)
}

/// Migration for one progress kind (course, lesson or quiz), selected by `S`.
pub struct ProgressMigration<S, B, L, R> {
    backlog: B,
    legacy: L,
    relational: R,
    gate: Option<Box<dyn ParentGate>>,
    errors: Vec<String>,
    status: PhantomData<fn() -> S>,
}

impl<S, B, L, R> ProgressMigration<S, B, L, R> {
    #[must_use]
    pub fn new(backlog: B, legacy: L, relational: R) -> Self {
        Self {
            backlog,
            legacy,
            relational,
            gate: None,
            errors: Vec::new(),
            status: PhantomData,
        }
    }

    #[must_use]
    pub fn with_gate(mut self, gate: Box<dyn ParentGate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl<S, B, L, R> Migration for ProgressMigration<S, B, L, R>
where
    S: ProgressStatus,
    B: MigrationBacklog,
    L: ProgressRepository<S>,
    R: ProgressRepository<S>,
{
    fn kind(&self) -> EntityKind {
        EntityKind::from(S::KIND)
    }

    fn run(&mut self, after_entry_id: i64, batch_size: usize) -> Result<MigrationBatch> {
        let kind = self.kind();
        let Self { backlog, legacy, relational, gate, errors, .. } = self;

        copy_batch(&*backlog, kind, after_entry_id, batch_size, errors, |key| {
            if let Some(gate) = gate.as_deref() {
                if let Some(reason) = gate.blocked_reason(key)? {
                    tracing::debug!(
                        entity = kind.as_str(),
                        key = %key,
                        reason = %reason,
                        "record skipped"
                    );
                    return Err(ProgressError::MissingParentState(reason).into());
                }
            }
            let Some(record) = legacy.get(key)? else {
                return Ok(0);
            };
            let mut copy = match relational.get_or_create(&record.to_draft())? {
                Fetched::Created(_) => return Ok(1),
                Fetched::Existing(copy) => copy,
            };
            // Only a completion the relational row has not seen is carried over, so an
            // existing row never moves backwards.
            if copy.completed_at.is_some() || record.completed_at.is_none() {
                return Ok(0);
            }
            copy.status = record.status;
            copy.completed_at = record.completed_at;
            copy.updated_at = record.updated_at;
            relational.save(&copy)?;
            Ok(1)
        })
    }

    fn take_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }
}

/// Migration for quiz submissions together with their answers and grades.
pub struct SubmissionMigration<B, L, R> {
    backlog: B,
    legacy: L,
    relational: R,
    errors: Vec<String>,
}

impl<B, L, R> SubmissionMigration<B, L, R> {
    #[must_use]
    pub fn new(backlog: B, legacy: L, relational: R) -> Self {
        Self { backlog, legacy, relational, errors: Vec::new() }
    }
}

impl<B, L, R> Migration for SubmissionMigration<B, L, R>
where
    B: MigrationBacklog,
    L: SubmissionRepository + AnswerRepository + GradeRepository,
    R: SubmissionRepository + AnswerRepository + GradeRepository,
{
    fn kind(&self) -> EntityKind {
        EntityKind::QuizSubmission
    }

    fn run(&mut self, after_entry_id: i64, batch_size: usize) -> Result<MigrationBatch> {
        let kind = self.kind();
        let Self { backlog, legacy, relational, errors } = self;

        copy_batch(&*backlog, kind, after_entry_id, batch_size, errors, |key| {
            let Some(submission) = legacy.get_submission(key)? else {
                return Ok(0);
            };
            let fetched = relational.get_or_create_submission(&submission.to_draft())?;
            let mut written = usize::from(fetched.was_created());
            let mut copy = fetched.into_inner();

            // A submission mirrored before its children were written gets them here.
            if copy.final_grade.is_none() && submission.final_grade.is_some() {
                copy.final_grade = submission.final_grade;
                copy.updated_at = submission.updated_at;
                relational.save_submission(&copy)?;
                written += 1;
            }

            let answered: BTreeSet<i64> =
                relational.get_answers(copy.id)?.iter().map(|answer| answer.question_id).collect();
            for answer in legacy.get_answers(submission.id)? {
                if !answered.contains(&answer.question_id) {
                    relational.create_answer(&copy, answer.question_id, &answer.value)?;
                    written += 1;
                }
            }

            let graded: BTreeSet<i64> =
                relational.get_grades(copy.id)?.iter().map(|grade| grade.question_id).collect();
            for grade in legacy.get_grades(submission.id)? {
                if !graded.contains(&grade.question_id) {
                    relational.create_grade(
                        &copy,
                        grade.question_id,
                        grade.points,
                        grade.feedback.as_deref(),
                    )?;
                    written += 1;
                }
            }
            Ok(written)
        })
    }

    fn take_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }
}
