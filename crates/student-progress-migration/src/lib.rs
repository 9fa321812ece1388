//! Moves student progress from the legacy activity log into relational tables.
//!
//! [`DualWriteRepository`] keeps both representations current while the rollout is in
//! flight, [`standard_jobs`] builds the per-entity copy jobs, the
//! [`MigrationJobScheduler`] chains them through the persistent task queue and the
//! [`MigrationWorker`] consumes that queue. Validators compare both sides afterwards.

use student_progress_core::{
    ActivityRepository, ContentCatalog, CourseStatus, EntityKind, LessonStatus, MigrationBacklog,
    MigrationConfig, ProgressKind, QuizStatus,
};

mod dual_write;
mod job;
mod migration;
mod operator;
mod scheduler;
mod validation;
mod worker;

pub use dual_write::DualWriteRepository;
pub use job::{JobRun, JobState, MigrationJob};
pub use migration::{
    HierarchyGate, Migration, MigrationBatch, ParentGate, ProgressMigration, SubmissionMigration,
};
pub use operator::{process, render_status, ALREADY_COMPLETED};
pub use scheduler::{JobOutcome, JobStatus, MigrationJobScheduler};
pub use validation::{
    export_reports, ProgressValidation, SubmissionValidation, ValidationError,
    ValidationFileDigest, ValidationManifest, ValidationReport, VALIDATION_ERRORS_FILE,
    VALIDATION_MANIFEST_FILE,
};
pub use worker::{DrainSummary, MigrationWorker};

/// The four jobs in dependency order: course progress, lesson progress, quiz progress,
/// quiz submissions. Job names are the entity kinds' table names.
#[must_use]
pub fn standard_jobs<B, L, R>(
    source: &B,
    legacy: &L,
    relational: &R,
    config: &MigrationConfig,
) -> Vec<MigrationJob>
where
    B: MigrationBacklog + ContentCatalog + Clone + 'static,
    L: ActivityRepository + Clone + 'static,
    R: ActivityRepository + Clone + 'static,
{
    let course = ProgressMigration::<CourseStatus, _, _, _>::new(
        source.clone(),
        legacy.clone(),
        relational.clone(),
    );
    let mut lesson = ProgressMigration::<LessonStatus, _, _, _>::new(
        source.clone(),
        legacy.clone(),
        relational.clone(),
    );
    let mut quiz = ProgressMigration::<QuizStatus, _, _, _>::new(
        source.clone(),
        legacy.clone(),
        relational.clone(),
    );
    if config.enforce_hierarchy {
        lesson = lesson.with_gate(Box::new(HierarchyGate::new(
            ProgressKind::Lesson,
            source.clone(),
            relational.clone(),
        )));
        quiz = quiz.with_gate(Box::new(HierarchyGate::new(
            ProgressKind::Quiz,
            source.clone(),
            relational.clone(),
        )));
    }
    let submissions = SubmissionMigration::new(source.clone(), legacy.clone(), relational.clone());

    vec![
        MigrationJob::new(
            EntityKind::CourseProgress.as_str(),
            Box::new(course),
            config.progress_batch_size,
        ),
        MigrationJob::new(
            EntityKind::LessonProgress.as_str(),
            Box::new(lesson),
            config.progress_batch_size,
        ),
        MigrationJob::new(
            EntityKind::QuizProgress.as_str(),
            Box::new(quiz),
            config.progress_batch_size,
        ),
        MigrationJob::new(
            EntityKind::QuizSubmission.as_str(),
            Box::new(submissions),
            config.submission_batch_size,
        ),
    ]
}
