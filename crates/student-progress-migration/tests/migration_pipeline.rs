use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use student_progress_core::{
    AnswerRepository, CourseProgress, CourseStatus, Fetched, GradeRepository, LessonProgress,
    LessonStatus, MigrationConfig, NaturalKey, ProgressDraft, ProgressError, ProgressRepository,
    QuizProgress, QuizStatus, RolloutStage, SubmissionDraft, SubmissionRepository, TaskQueue,
    MIGRATION_JOB_ACTION,
};
use student_progress_migration::{
    export_reports, process, render_status, standard_jobs, DrainSummary, DualWriteRepository,
    MigrationJobScheduler, MigrationWorker, ProgressValidation, SubmissionValidation,
    ALREADY_COMPLETED,
};
use student_progress_store_sqlite::{SqliteOptions, SqliteStore, SqliteTaskQueue};
use time::OffsetDateTime;

type Scheduler = MigrationJobScheduler<SqliteOptions, SqliteTaskQueue>;

fn fixture_time() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
        + time::Duration::seconds(1_700_000_000)
        + time::Duration::nanoseconds(250_000_000)
}

fn migrated_store() -> Result<SqliteStore> {
    let store = SqliteStore::open(Path::new(":memory:"))?;
    store.migrate()?;
    Ok(store)
}

fn scheduler_for(store: &SqliteStore, config: &MigrationConfig) -> Scheduler {
    let mut scheduler = MigrationJobScheduler::new(store.options(), store.task_queue());
    for job in standard_jobs(store, &store.legacy(), &store.relational(), config) {
        scheduler.register(job);
    }
    scheduler
}

fn drain(scheduler: &mut Scheduler) -> Result<DrainSummary> {
    MigrationWorker::new(Duration::from_secs(300)).drain(scheduler, 1_000)
}

fn start_course(store: &SqliteStore, course_id: i64, user_id: i64) -> Result<CourseProgress> {
    store
        .legacy()
        .create(&ProgressDraft::start(NaturalKey::new(course_id, user_id), fixture_time()))
}

fn start_lesson(store: &SqliteStore, lesson_id: i64, user_id: i64) -> Result<LessonProgress> {
    store
        .legacy()
        .create(&ProgressDraft::start(NaturalKey::new(lesson_id, user_id), fixture_time()))
}

#[test]
fn happy_path_copies_completed_course_for_user_seven() -> Result<()> {
    let store = migrated_store()?;
    let course_id = store.add_course("Intro")?;
    assert_eq!(course_id, 1);

    let mut progress = start_course(&store, course_id, 7)?;
    progress.complete(fixture_time() + time::Duration::hours(2));
    store.legacy().save(&progress)?;

    let mut scheduler = scheduler_for(&store, &MigrationConfig::default());
    assert_eq!(process(&mut scheduler)?, "Migration scheduled, starting with course_progress.");
    let summary = drain(&mut scheduler)?;
    assert!(summary.migration_complete);

    let copy: CourseProgress = store
        .relational()
        .get(NaturalKey::new(1, 7))?
        .unwrap_or_else(|| panic!("course progress (1, 7) should be migrated"));
    assert_eq!(copy.status, CourseStatus::Complete);
    assert_eq!(copy.started_at, fixture_time());
    assert_eq!(copy.completed_at, Some(fixture_time() + time::Duration::hours(2)));

    let state = scheduler.state()?;
    assert!(state.errors.is_empty());
    assert_eq!(render_status(&state), vec!["Status: Completed".to_string()]);

    let report = ProgressValidation::new(&store, &store.legacy(), &store.relational()).run(&state)?;
    assert!(report.is_valid(), "unexpected validation errors: {:?}", report.errors);
    assert_eq!(report.checked, 1);
    Ok(())
}

#[test]
fn jobs_run_in_dependency_order() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    let lesson = store.add_lesson(Some(course), "Lesson")?;
    let quiz = store.add_quiz(lesson, "Quiz")?;
    start_course(&store, course, 3)?;
    start_lesson(&store, lesson, 3)?;
    store.legacy().create(&ProgressDraft::<QuizStatus>::start(
        NaturalKey::new(quiz, 3),
        fixture_time(),
    ))?;

    let mut scheduler = scheduler_for(&store, &MigrationConfig::default());
    process(&mut scheduler)?;
    let summary = drain(&mut scheduler)?;

    let mut order: Vec<&str> = Vec::new();
    for outcome in &summary.outcomes {
        if order.last() != Some(&outcome.job.as_str()) {
            order.push(&outcome.job);
        }
    }
    assert_eq!(order, vec!["course_progress", "lesson_progress", "quiz_progress", "quiz_submissions"]);
    assert!(summary.outcomes.last().is_some_and(|outcome| outcome.migration_complete));
    Ok(())
}

#[test]
fn copy_is_idempotent_across_runs() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    for user_id in 1..=5 {
        start_course(&store, course, user_id)?;
    }
    let config = MigrationConfig { progress_batch_size: 2, ..MigrationConfig::default() };

    let mut scheduler = scheduler_for(&store, &config);
    process(&mut scheduler)?;
    let first = drain(&mut scheduler)?;
    let inserted: usize = first.outcomes.iter().map(|outcome| outcome.inserted).sum();
    assert_eq!(inserted, 5);
    let before: Option<CourseProgress> = store.relational().get(NaturalKey::new(course, 3))?;

    scheduler.clear_state()?;
    process(&mut scheduler)?;
    let second = drain(&mut scheduler)?;
    assert!(second.migration_complete);
    assert!(second.outcomes.iter().all(|outcome| outcome.inserted == 0));

    let after: Option<CourseProgress> = store.relational().get(NaturalKey::new(course, 3))?;
    assert_eq!(before.map(|row| row.id), after.map(|row| row.id));
    Ok(())
}

#[test]
fn concurrent_dual_write_does_not_duplicate_rows() -> Result<()> {
    let store = migrated_store()?;
    let lesson = store.add_lesson(None, "Standalone")?;
    start_lesson(&store, lesson, 1)?;
    start_lesson(&store, lesson, 2)?;

    // The site starts dual-writing before the migration reaches user 2's row.
    let repo =
        DualWriteRepository::for_stage(RolloutStage::DualWriteReadLegacy, store.legacy(), store.relational());
    let mut progress: LessonProgress = repo
        .get(NaturalKey::new(lesson, 2))?
        .unwrap_or_else(|| panic!("legacy lesson progress should exist"));
    progress.complete(fixture_time() + time::Duration::minutes(30));
    repo.save(&progress)?;

    let mirrored: LessonProgress = store
        .relational()
        .get(NaturalKey::new(lesson, 2))?
        .unwrap_or_else(|| panic!("the dual write should have created the relational row"));
    assert_eq!(mirrored.status, LessonStatus::Complete);

    let mut scheduler = scheduler_for(&store, &MigrationConfig::default());
    process(&mut scheduler)?;
    let summary = drain(&mut scheduler)?;
    let inserted: usize = summary.outcomes.iter().map(|outcome| outcome.inserted).sum();
    assert_eq!(inserted, 1);

    let again = store.relational().get_or_create(&progress.to_draft())?;
    assert!(matches!(again, Fetched::Existing(ref row) if row.id == mirrored.id));

    let state = scheduler.state()?;
    let report = ProgressValidation::new(&store, &store.legacy(), &store.relational()).run(&state)?;
    assert!(report.is_valid(), "unexpected validation errors: {:?}", report.errors);
    assert_eq!(report.checked, 2);
    Ok(())
}

#[test]
fn completion_is_monotonic() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    start_course(&store, course, 1)?;

    let mut scheduler = scheduler_for(&store, &MigrationConfig::default());
    process(&mut scheduler)?;
    drain(&mut scheduler)?;
    let completed_at = scheduler.state()?.completed_at;
    assert!(completed_at.is_some());

    start_course(&store, course, 2)?;
    assert_eq!(process(&mut scheduler)?, ALREADY_COMPLETED);
    scheduler.run_job("quiz_submissions")?;
    assert_eq!(scheduler.state()?.completed_at, completed_at);
    assert!(scheduler.is_complete()?);

    // A fresh process sees the same durable completion.
    let restarted = scheduler_for(&store, &MigrationConfig::default());
    assert!(restarted.is_complete()?);
    assert!(restarted.job_statuses()?.iter().all(|status| status.state.as_str() == "complete"));
    Ok(())
}

#[test]
fn hierarchy_gate_skips_lessons_without_migrated_course() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    let lesson = store.add_lesson(Some(course), "Lesson")?;
    start_course(&store, course, 1)?;
    start_lesson(&store, lesson, 1)?;
    // User 2 has lesson activity but no course entry.
    start_lesson(&store, lesson, 2)?;

    let config = MigrationConfig { enforce_hierarchy: true, ..MigrationConfig::default() };
    let mut scheduler = scheduler_for(&store, &config);
    process(&mut scheduler)?;
    let summary = drain(&mut scheduler)?;
    assert!(summary.migration_complete);

    let migrated: Option<LessonProgress> = store.relational().get(NaturalKey::new(lesson, 1))?;
    let skipped: Option<LessonProgress> = store.relational().get(NaturalKey::new(lesson, 2))?;
    assert!(migrated.is_some());
    assert!(skipped.is_none());

    let errors = scheduler.state()?.errors;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains(&format!("lesson_progress ({lesson}, 2)")));
    assert!(errors[0].contains("missing parent state"));
    Ok(())
}

#[test]
fn crash_mid_job_is_recorded_and_resumed() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    for user_id in 1..=3 {
        start_course(&store, course, user_id)?;
    }
    let config = MigrationConfig { progress_batch_size: 1, ..MigrationConfig::default() };

    let mut scheduler = scheduler_for(&store, &config);
    process(&mut scheduler)?;
    let first = MigrationWorker::new(Duration::from_secs(300)).drain(&mut scheduler, 1)?;
    assert_eq!(first.tasks_run, 1);
    scheduler.handle_unexpected_shutdown("course_progress", "OOM")?;

    // The process dies right after claiming the next batch.
    let claimed = store
        .task_queue()
        .claim_next(MIGRATION_JOB_ACTION)?
        .unwrap_or_else(|| panic!("the re-enqueued batch should be claimable"));
    drop(scheduler);

    let mut restarted = scheduler_for(&store, &config);
    assert!(restarted.is_in_progress()?);
    let summary = MigrationWorker::new(Duration::ZERO).drain(&mut restarted, 1_000)?;
    assert_eq!(summary.recovered, vec![claimed.job_name]);
    assert!(summary.migration_complete);

    let errors = restarted.state()?.errors;
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0], "unexpected shutdown while running course_progress: OOM");
    assert!(errors[1].starts_with("unexpected shutdown while running course_progress: claimed at"));

    for user_id in 1..=3 {
        let copy: Option<CourseProgress> = store.relational().get(NaturalKey::new(course, user_id))?;
        assert!(copy.is_some(), "course progress for user {user_id} should be migrated");
    }
    assert!(store.task_queue().pending(MIGRATION_JOB_ACTION)?.is_empty());
    Ok(())
}

#[test]
fn answers_and_grades_reach_parity() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    let lesson = store.add_lesson(Some(course), "Lesson")?;
    let quiz = store.add_quiz(lesson, "Quiz")?;
    let legacy = store.legacy();
    let key = NaturalKey::new(quiz, 7);

    start_course(&store, course, 7)?;
    let mut lesson_progress = start_lesson(&store, lesson, 7)?;
    lesson_progress.complete(fixture_time() + time::Duration::minutes(10));
    legacy.save(&lesson_progress)?;
    let mut quiz_progress: QuizProgress =
        legacy.create(&ProgressDraft::start(key, fixture_time()))?;

    let mut submission = legacy.create_submission(&SubmissionDraft::new(key, fixture_time()))?;
    for question_id in [11, 12, 13] {
        legacy.create_answer(&submission, question_id, &format!("answer {question_id}"))?;
    }
    legacy.create_grade(&submission, 11, 1, Some("well done"))?;
    legacy.create_grade(&submission, 12, 0, None)?;
    submission.final_grade = Some(66.5);
    legacy.save_submission(&submission)?;
    quiz_progress.set_quiz_status(QuizStatus::Passed, fixture_time() + time::Duration::minutes(20));
    legacy.save(&quiz_progress)?;

    let mut scheduler = scheduler_for(&store, &MigrationConfig::default());
    process(&mut scheduler)?;
    let summary = drain(&mut scheduler)?;
    assert!(summary.migration_complete);
    let submission_rows: usize = summary
        .outcomes
        .iter()
        .filter(|outcome| outcome.job == "quiz_submissions")
        .map(|outcome| outcome.inserted)
        .sum();
    assert_eq!(submission_rows, 1 + 3 + 2);

    let relational = store.relational();
    let copy = relational
        .get_submission(key)?
        .unwrap_or_else(|| panic!("submission should be migrated"));
    assert_eq!(copy.final_grade, Some(66.5));
    assert_eq!(relational.get_question_ids(copy.id)?, vec![11, 12, 13]);
    assert_eq!(relational.get_answers(copy.id)?.len(), 3);
    let grades = relational.get_grades(copy.id)?;
    assert_eq!(grades.len(), 2);
    assert_eq!(grades[0].feedback.as_deref(), Some("well done"));
    assert_eq!(grades[1].feedback, None);

    let state = scheduler.state()?;
    let report = SubmissionValidation::new(&store, &legacy, &relational).run(&state)?;
    assert!(report.is_valid(), "unexpected validation errors: {:?}", report.errors);
    assert_eq!(report.checked, 1);
    let progress = ProgressValidation::new(&store, &legacy, &relational).run(&state)?;
    assert!(progress.is_valid(), "unexpected validation errors: {:?}", progress.errors);

    relational.create_answer(&copy, 13, "changed")?;
    let report = SubmissionValidation::new(&store, &legacy, &relational).run(&state)?;
    let messages: Vec<_> = report.errors.iter().map(|error| error.message.as_str()).collect();
    assert_eq!(messages, vec![format!("quiz_submissions ({quiz}, 7) answer for question 13 mismatch")]);
    Ok(())
}

#[test]
fn validation_reports_drift_and_exports_it() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    start_course(&store, course, 4)?;
    start_course(&store, course, 5)?;

    let state_before = MigrationJobScheduler::new(store.options(), store.task_queue()).state()?;
    let early = ProgressValidation::new(&store, &store.legacy(), &store.relational())
        .run(&state_before)?;
    assert_eq!(early.errors[0].message, "migration not complete");
    assert_eq!(early.errors.len(), 3);

    let mut scheduler = scheduler_for(&store, &MigrationConfig::default());
    process(&mut scheduler)?;
    drain(&mut scheduler)?;

    let mut drifted: CourseProgress = store
        .relational()
        .get(NaturalKey::new(course, 5))?
        .unwrap_or_else(|| panic!("course progress should be migrated"));
    drifted.complete(fixture_time() + time::Duration::days(1));
    store.relational().save(&drifted)?;

    let report = ProgressValidation::new(&store, &store.legacy(), &store.relational())
        .run(&scheduler.state()?)?;
    let messages: Vec<_> = report.errors.iter().map(|error| error.message.as_str()).collect();
    assert_eq!(messages, vec![
        format!("course_progress ({course}, 5) status mismatch"),
        format!("course_progress ({course}, 5) completed_at mismatch"),
    ]);
    assert_eq!(report.errors[0].data["legacy"], "in-progress");
    assert_eq!(report.errors[0].data["relational"], "complete");

    let out_dir = std::env::temp_dir().join(format!(
        "student-progress-drift-{}-{}",
        std::process::id(),
        OffsetDateTime::now_utc().unix_timestamp_nanos()
    ));
    let manifest = export_reports(&[report], &out_dir)?;
    assert_eq!(manifest.files[0].records, 2);
    std::fs::remove_dir_all(&out_dir)?;
    Ok(())
}

#[test]
fn mirror_failure_never_fails_the_primary_write() -> Result<()> {
    let store = migrated_store()?;
    let lesson = store.add_lesson(None, "Lesson")?;
    let quiz = store.add_quiz(lesson, "Quiz")?;
    let key = NaturalKey::new(quiz, 9);
    let draft = ProgressDraft::<QuizStatus>::start(key, fixture_time());

    // Legacy keeps quiz state on the lesson entry, which does not exist yet.
    let read_relational = DualWriteRepository::for_stage(
        RolloutStage::DualWriteReadRelational,
        store.legacy(),
        store.relational(),
    );
    let created = read_relational.create(&draft)?;
    assert_eq!(created.status, QuizStatus::InProgress);
    let legacy_copy: Option<QuizProgress> = store.legacy().get(key)?;
    assert!(legacy_copy.is_none());

    // With legacy as the primary the same write is refused.
    let read_legacy = DualWriteRepository::for_stage(
        RolloutStage::DualWriteReadLegacy,
        store.legacy(),
        store.relational(),
    );
    let err = read_legacy
        .create(&ProgressDraft::<QuizStatus>::start(NaturalKey::new(quiz, 10), fixture_time()))
        .err()
        .unwrap_or_else(|| panic!("legacy quiz progress needs a lesson entry"));
    assert!(matches!(
        err.downcast_ref::<ProgressError>(),
        Some(ProgressError::MissingParentState(_))
    ));
    Ok(())
}

#[test]
fn legacy_only_stage_leaves_relational_untouched() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    let key = NaturalKey::new(course, 1);
    let repo = DualWriteRepository::for_stage(RolloutStage::LegacyOnly, store.legacy(), store.relational());

    let mut progress: CourseProgress = repo.create(&ProgressDraft::start(key, fixture_time()))?;
    progress.complete(fixture_time());
    repo.save(&progress)?;

    let relational: Option<CourseProgress> = store.relational().get(key)?;
    assert!(relational.is_none());
    let legacy: Option<CourseProgress> = store.legacy().get(key)?;
    assert_eq!(legacy.map(|row| row.status), Some(CourseStatus::Complete));
    Ok(())
}

#[test]
fn dual_write_mirrors_submission_children() -> Result<()> {
    let store = migrated_store()?;
    let lesson = store.add_lesson(None, "Lesson")?;
    let quiz = store.add_quiz(lesson, "Quiz")?;
    let key = NaturalKey::new(quiz, 2);
    let repo = DualWriteRepository::for_stage(
        RolloutStage::DualWriteReadLegacy,
        store.legacy(),
        store.relational(),
    );

    repo.create(&ProgressDraft::<LessonStatus>::start(NaturalKey::new(lesson, 2), fixture_time()))?;
    let submission = repo.create_submission(&SubmissionDraft::new(key, fixture_time()))?;
    repo.create_answer(&submission, 1, "a")?;
    repo.create_grade(&submission, 1, 3, Some("ok"))?;

    let mirrored = store
        .relational()
        .get_submission(key)?
        .unwrap_or_else(|| panic!("submission should be mirrored"));
    assert_eq!(store.relational().get_answers(mirrored.id)?.len(), 1);
    assert_eq!(store.relational().get_grades(mirrored.id)?[0].points, 3);

    repo.delete_submission(&submission)?;
    assert!(store.relational().get_submission(key)?.is_none());
    assert!(repo.get_submission(key)?.is_none());
    Ok(())
}

#[test]
fn restarted_process_keeps_the_running_chain() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    for user_id in 1..=3 {
        start_course(&store, course, user_id)?;
    }
    let config = MigrationConfig { progress_batch_size: 1, ..MigrationConfig::default() };

    let mut scheduler = scheduler_for(&store, &config);
    process(&mut scheduler)?;
    let first = MigrationWorker::new(Duration::from_secs(300)).drain(&mut scheduler, 2)?;
    assert_eq!(first.tasks_run, 2);
    drop(scheduler);

    let mut restarted = scheduler_for(&store, &config);
    assert_eq!(
        process(&mut restarted)?,
        "Migration is already in progress; course_progress is queued."
    );
    let pending = store.task_queue().pending(MIGRATION_JOB_ACTION)?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_name, "course_progress");
    let states: Vec<_> =
        restarted.job_statuses()?.iter().map(|status| status.state.as_str()).collect();
    assert_eq!(states, vec!["running", "not_started", "not_started", "not_started"]);

    let summary = drain(&mut restarted)?;
    assert!(summary.migration_complete);
    let lesson_runs =
        summary.outcomes.iter().filter(|outcome| outcome.job == "lesson_progress").count();
    assert_eq!(lesson_runs, 1);
    let inserted: usize = first
        .outcomes
        .iter()
        .chain(&summary.outcomes)
        .map(|outcome| outcome.inserted)
        .sum();
    assert_eq!(inserted, 3);
    assert!(store.task_queue().pending(MIGRATION_JOB_ACTION)?.is_empty());
    assert!(restarted.state()?.errors.is_empty());
    Ok(())
}

#[test]
fn lazily_mirrored_submission_receives_its_answers() -> Result<()> {
    let store = migrated_store()?;
    let lesson = store.add_lesson(None, "Lesson")?;
    let quiz = store.add_quiz(lesson, "Quiz")?;
    let legacy = store.legacy();
    let key = NaturalKey::new(quiz, 4);

    start_lesson(&store, lesson, 4)?;
    let submission = legacy.create_submission(&SubmissionDraft::new(key, fixture_time()))?;
    legacy.create_answer(&submission, 1, "first")?;
    legacy.create_answer(&submission, 2, "second")?;
    legacy.create_grade(&submission, 1, 2, Some("right"))?;

    // Dual writing starts after the answers were recorded; finalizing the grade
    // creates the relational submission without children.
    let repo = DualWriteRepository::for_stage(
        RolloutStage::DualWriteReadLegacy,
        store.legacy(),
        store.relational(),
    );
    let mut finalized = repo
        .get_submission(key)?
        .unwrap_or_else(|| panic!("legacy submission should exist"));
    finalized.final_grade = Some(80.0);
    repo.save_submission(&finalized)?;

    let relational = store.relational();
    let mirrored = relational
        .get_submission(key)?
        .unwrap_or_else(|| panic!("the dual write should have created the submission"));
    assert_eq!(mirrored.final_grade, Some(80.0));
    assert!(relational.get_answers(mirrored.id)?.is_empty());

    let mut scheduler = scheduler_for(&store, &MigrationConfig::default());
    process(&mut scheduler)?;
    let summary = drain(&mut scheduler)?;
    assert!(summary.migration_complete);
    let submission_rows: usize = summary
        .outcomes
        .iter()
        .filter(|outcome| outcome.job == "quiz_submissions")
        .map(|outcome| outcome.inserted)
        .sum();
    assert_eq!(submission_rows, 2 + 1);

    assert_eq!(relational.get_question_ids(mirrored.id)?, vec![1, 2]);
    assert_eq!(relational.get_grades(mirrored.id)?[0].feedback.as_deref(), Some("right"));

    let state = scheduler.state()?;
    assert!(state.errors.is_empty(), "unexpected migration errors: {:?}", state.errors);
    let report = SubmissionValidation::new(&store, &legacy, &relational).run(&state)?;
    assert!(report.is_valid(), "unexpected validation errors: {:?}", report.errors);
    assert_eq!(report.checked, 1);
    Ok(())
}

#[test]
fn completion_missed_by_the_mirror_is_caught_up() -> Result<()> {
    let store = migrated_store()?;
    let course = store.add_course("Course")?;
    let key = NaturalKey::new(course, 6);
    let repo = DualWriteRepository::for_stage(
        RolloutStage::DualWriteReadLegacy,
        store.legacy(),
        store.relational(),
    );
    let mut progress: CourseProgress = repo.create(&ProgressDraft::start(key, fixture_time()))?;

    // The completion reaches legacy only, as when the mirror save fails.
    progress.complete(fixture_time() + time::Duration::hours(3));
    store.legacy().save(&progress)?;

    let mut scheduler = scheduler_for(&store, &MigrationConfig::default());
    process(&mut scheduler)?;
    let summary = drain(&mut scheduler)?;
    let inserted: usize = summary.outcomes.iter().map(|outcome| outcome.inserted).sum();
    assert_eq!(inserted, 1);

    let copy: CourseProgress = store
        .relational()
        .get(key)?
        .unwrap_or_else(|| panic!("course progress should exist"));
    assert_eq!(copy.status, CourseStatus::Complete);
    assert_eq!(copy.completed_at, progress.completed_at);

    let report = ProgressValidation::new(&store, &store.legacy(), &store.relational())
        .run(&scheduler.state()?)?;
    assert!(report.is_valid(), "unexpected validation errors: {:?}", report.errors);
    Ok(())
}

#[test]
fn quiz_status_reset_reaches_both_sides() -> Result<()> {
    let store = migrated_store()?;
    let lesson = store.add_lesson(None, "Lesson")?;
    let quiz = store.add_quiz(lesson, "Quiz")?;
    let key = NaturalKey::new(quiz, 8);
    let repo = DualWriteRepository::for_stage(
        RolloutStage::DualWriteReadLegacy,
        store.legacy(),
        store.relational(),
    );

    let mut lesson_progress: LessonProgress =
        repo.create(&ProgressDraft::start(NaturalKey::new(lesson, 8), fixture_time()))?;
    lesson_progress.complete(fixture_time() + time::Duration::minutes(5));
    repo.save(&lesson_progress)?;

    let mut quiz_progress: QuizProgress = repo.create(&ProgressDraft::start(key, fixture_time()))?;
    quiz_progress.set_quiz_status(QuizStatus::Passed, fixture_time() + time::Duration::minutes(10));
    repo.save(&quiz_progress)?;
    quiz_progress
        .set_quiz_status(QuizStatus::InProgress, fixture_time() + time::Duration::minutes(15));
    repo.save(&quiz_progress)?;

    let legacy_copy: QuizProgress = store
        .legacy()
        .get(key)?
        .unwrap_or_else(|| panic!("legacy quiz progress should exist"));
    let relational_copy: QuizProgress = store
        .relational()
        .get(key)?
        .unwrap_or_else(|| panic!("relational quiz progress should exist"));
    for copy in [&legacy_copy, &relational_copy] {
        assert_eq!(copy.status, QuizStatus::InProgress);
        assert_eq!(copy.completed_at, None);
    }
    let legacy_lesson: Option<LessonProgress> = store.legacy().get(NaturalKey::new(lesson, 8))?;
    assert_eq!(legacy_lesson.map(|row| row.status), Some(LessonStatus::Complete));

    let mut scheduler = scheduler_for(&store, &MigrationConfig::default());
    process(&mut scheduler)?;
    let summary = drain(&mut scheduler)?;
    assert!(summary.migration_complete);
    assert!(summary.outcomes.iter().all(|outcome| outcome.inserted == 0));

    let state = scheduler.state()?;
    let report = ProgressValidation::new(&store, &store.legacy(), &store.relational()).run(&state)?;
    assert!(report.is_valid(), "unexpected validation errors: {:?}", report.errors);
    assert_eq!(report.checked, 2);
    Ok(())
}
