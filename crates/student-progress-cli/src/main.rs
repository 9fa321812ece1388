use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use student_progress_core::{
    AnswerRepository, CourseStatus, GradeRepository, LessonStatus, MigrationConfig, NaturalKey,
    Progress, ProgressDraft, ProgressRepository, ProgressStatus, QuizStatus, RolloutStage,
    Submission, SubmissionDraft, SubmissionRepository, TaskQueue, MIGRATION_JOB_ACTION,
};
use student_progress_migration::{
    export_reports, process, render_status, standard_jobs, DualWriteRepository, JobStatus,
    MigrationJobScheduler, MigrationWorker, ProgressValidation, SubmissionValidation,
};
use student_progress_store_sqlite::{
    LegacyStore, RelationalStore, SqliteOptions, SqliteStore, SqliteTaskQueue,
};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

type Repository = DualWriteRepository<LegacyStore, RelationalStore>;
type Scheduler = MigrationJobScheduler<SqliteOptions, SqliteTaskQueue>;

#[derive(Debug, Parser)]
#[command(name = "spm")]
#[command(about = "Student progress storage migration CLI")]
struct Cli {
    #[arg(long, default_value = "./student_progress.sqlite3")]
    db: PathBuf,

    /// Rollout stage used for activity writes and reads.
    #[arg(long, value_enum, default_value = "dual-write-read-legacy")]
    stage: StageArg,

    /// JSON file with migration batch sizes, hierarchy enforcement and lease timeout.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Content {
        #[command(subcommand)]
        command: Box<ContentCommand>,
    },
    Progress {
        #[command(subcommand)]
        command: Box<ProgressCommand>,
    },
    Quiz {
        #[command(subcommand)]
        command: Box<QuizCommand>,
    },
    Migration {
        #[command(subcommand)]
        command: Box<MigrationCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ContentCommand {
    AddCourse(AddCourseArgs),
    AddLesson(AddLessonArgs),
    AddQuiz(AddQuizArgs),
}

#[derive(Debug, Args)]
struct AddCourseArgs {
    #[arg(long)]
    title: String,
}

#[derive(Debug, Args)]
struct AddLessonArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    course_id: Option<i64>,
}

#[derive(Debug, Args)]
struct AddQuizArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    lesson_id: i64,
}

#[derive(Debug, Subcommand)]
enum ProgressCommand {
    Start(ProgressWriteArgs),
    Complete(ProgressCompleteArgs),
    Show(ProgressKeyArgs),
}

#[derive(Debug, Args)]
struct ProgressKeyArgs {
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long)]
    entity_id: i64,
    #[arg(long)]
    user_id: i64,
}

#[derive(Debug, Args)]
struct ProgressWriteArgs {
    #[command(flatten)]
    key: ProgressKeyArgs,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct ProgressCompleteArgs {
    #[command(flatten)]
    key: ProgressKeyArgs,
    /// Result recorded for quiz progress; required when `--kind quiz`.
    #[arg(long, value_enum)]
    quiz_status: Option<QuizResultArg>,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum QuizCommand {
    Submit(QuizSubmitArgs),
    Grade(QuizGradeArgs),
    Finalize(QuizFinalizeArgs),
    Show(QuizKeyArgs),
}

#[derive(Debug, Args)]
struct QuizKeyArgs {
    #[arg(long)]
    quiz_id: i64,
    #[arg(long)]
    user_id: i64,
}

#[derive(Debug, Args)]
struct QuizSubmitArgs {
    #[command(flatten)]
    key: QuizKeyArgs,
    /// Answer as `QUESTION_ID=VALUE`; repeatable.
    #[arg(long = "answer")]
    answers: Vec<String>,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct QuizGradeArgs {
    #[command(flatten)]
    key: QuizKeyArgs,
    #[arg(long)]
    question_id: i64,
    #[arg(long)]
    points: i64,
    #[arg(long)]
    feedback: Option<String>,
}

#[derive(Debug, Args)]
struct QuizFinalizeArgs {
    #[command(flatten)]
    key: QuizKeyArgs,
    #[arg(long)]
    final_grade: f64,
}

#[derive(Debug, Subcommand)]
enum MigrationCommand {
    Process,
    Work(MigrationWorkArgs),
    Status,
    Reset,
    Validate(MigrationValidateArgs),
}

#[derive(Debug, Args)]
struct MigrationWorkArgs {
    #[arg(long, default_value_t = 100)]
    max_tasks: usize,
}

#[derive(Debug, Args)]
struct MigrationValidateArgs {
    /// Directory receiving `validation_errors.ndjson` and `manifest.json`.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    LegacyOnly,
    DualWriteReadLegacy,
    DualWriteReadRelational,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Course,
    Lesson,
    Quiz,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum QuizResultArg {
    Ungraded,
    Graded,
    Passed,
    Failed,
}

#[derive(Debug, Serialize)]
struct StatusView {
    status: Vec<String>,
    started_at: Option<f64>,
    completed_at: Option<f64>,
    errors: Vec<String>,
    jobs: Vec<JobStatus>,
    pending_tasks: usize,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store = SqliteStore::open(&cli.db)?;
    let stage = cli.stage.into_stage();
    tracing::debug!(db = %cli.db.display(), stage = stage.as_str(), "opened store");

    match cli.command {
        Command::Db { command } => run_db(*command, &store),
        Command::Content { command } => {
            store.migrate()?;
            run_content(*command, &store)
        }
        Command::Progress { command } => {
            store.migrate()?;
            run_progress(*command, &repository(&store, stage), stage)
        }
        Command::Quiz { command } => {
            store.migrate()?;
            run_quiz(*command, &repository(&store, stage), stage)
        }
        Command::Migration { command } => {
            store.migrate()?;
            let config = load_config(cli.config.as_deref())?;
            run_migration(*command, &store, &config)
        }
    }
}

fn repository(store: &SqliteStore, stage: RolloutStage) -> Repository {
    DualWriteRepository::for_stage(stage, store.legacy(), store.relational())
}

fn load_config(path: Option<&Path>) -> Result<MigrationConfig> {
    match path {
        Some(path) => MigrationConfig::from_json_file(path),
        None => Ok(MigrationConfig::default()),
    }
}

fn run_db(command: DbCommand, store: &SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_content(command: ContentCommand, store: &SqliteStore) -> Result<()> {
    match command {
        ContentCommand::AddCourse(args) => {
            let course_id = store.add_course(&args.title)?;
            emit_json(serde_json::json!({ "course_id": course_id, "title": args.title }))
        }
        ContentCommand::AddLesson(args) => {
            let lesson_id = store.add_lesson(args.course_id, &args.title)?;
            emit_json(serde_json::json!({
                "lesson_id": lesson_id,
                "course_id": args.course_id,
                "title": args.title
            }))
        }
        ContentCommand::AddQuiz(args) => {
            let quiz_id = store.add_quiz(args.lesson_id, &args.title)?;
            emit_json(serde_json::json!({
                "quiz_id": quiz_id,
                "lesson_id": args.lesson_id,
                "title": args.title
            }))
        }
    }
}

fn run_progress(command: ProgressCommand, repo: &Repository, stage: RolloutStage) -> Result<()> {
    let mut output = match command {
        ProgressCommand::Start(args) => {
            let key = args.key.natural_key();
            let at = parse_optional_rfc3339(args.at.as_deref())?;
            match args.key.kind {
                KindArg::Course => start_progress::<CourseStatus, _>(repo, key, at)?,
                KindArg::Lesson => start_progress::<LessonStatus, _>(repo, key, at)?,
                KindArg::Quiz => start_progress::<QuizStatus, _>(repo, key, at)?,
            }
        }
        ProgressCommand::Complete(args) => {
            let key = args.key.natural_key();
            let at = parse_optional_rfc3339(args.at.as_deref())?;
            match args.key.kind {
                KindArg::Course => {
                    let mut progress = existing_progress::<CourseStatus, _>(repo, key)?;
                    progress.complete(at);
                    save_progress(repo, &progress)?
                }
                KindArg::Lesson => {
                    let mut progress = existing_progress::<LessonStatus, _>(repo, key)?;
                    progress.complete(at);
                    save_progress(repo, &progress)?
                }
                KindArg::Quiz => {
                    let status = args
                        .quiz_status
                        .ok_or_else(|| anyhow!("--quiz-status is required for quiz progress"))?;
                    let mut progress = existing_progress::<QuizStatus, _>(repo, key)?;
                    progress.set_quiz_status(status.into_quiz_status(), at);
                    save_progress(repo, &progress)?
                }
            }
        }
        ProgressCommand::Show(args) => {
            let key = args.natural_key();
            match args.kind {
                KindArg::Course => show_progress::<CourseStatus, _>(repo, key)?,
                KindArg::Lesson => show_progress::<LessonStatus, _>(repo, key)?,
                KindArg::Quiz => show_progress::<QuizStatus, _>(repo, key)?,
            }
        }
    };

    if let Value::Object(object) = &mut output {
        object.insert("stage".to_string(), Value::String(stage.as_str().to_string()));
    }
    emit_json(output)
}

fn start_progress<S, P>(repo: &P, key: NaturalKey, at: OffsetDateTime) -> Result<Value>
where
    S: ProgressStatus,
    P: ProgressRepository<S>,
{
    let fetched = repo.get_or_create(&ProgressDraft::<S>::start(key, at))?;
    let created = fetched.was_created();
    Ok(serde_json::json!({
        "kind": S::KIND.as_str(),
        "created": created,
        "progress": fetched.into_inner()
    }))
}

fn existing_progress<S, P>(repo: &P, key: NaturalKey) -> Result<Progress<S>>
where
    S: ProgressStatus,
    P: ProgressRepository<S>,
{
    repo.get(key)?
        .ok_or_else(|| anyhow!("{} progress {key} has not been started", S::KIND.as_str()))
}

fn save_progress<S, P>(repo: &P, progress: &Progress<S>) -> Result<Value>
where
    S: ProgressStatus,
    P: ProgressRepository<S>,
{
    repo.save(progress)?;
    Ok(serde_json::json!({
        "kind": S::KIND.as_str(),
        "progress": progress
    }))
}

fn show_progress<S, P>(repo: &P, key: NaturalKey) -> Result<Value>
where
    S: ProgressStatus,
    P: ProgressRepository<S>,
{
    let progress = repo.get(key)?;
    Ok(serde_json::json!({
        "kind": S::KIND.as_str(),
        "found": progress.is_some(),
        "progress": progress
    }))
}

/// A submission moves started quiz progress to `ungraded`.
fn mark_submitted<P>(repo: &P, key: NaturalKey, at: OffsetDateTime) -> Result<Option<QuizStatus>>
where
    P: ProgressRepository<QuizStatus>,
{
    let Some(mut progress) = repo.get(key)? else {
        return Ok(None);
    };
    if !progress.status.is_submitted() {
        progress.set_quiz_status(QuizStatus::Ungraded, at);
        repo.save(&progress)?;
    }
    Ok(Some(progress.status))
}

fn run_quiz(command: QuizCommand, repo: &Repository, stage: RolloutStage) -> Result<()> {
    match command {
        QuizCommand::Submit(args) => {
            let key = args.key.natural_key();
            let at = parse_optional_rfc3339(args.at.as_deref())?;
            let answers = args
                .answers
                .iter()
                .map(String::as_str)
                .map(parse_answer)
                .collect::<Result<Vec<_>>>()?;

            let fetched = repo.get_or_create_submission(&SubmissionDraft::new(key, at))?;
            let created = fetched.was_created();
            let submission = fetched.into_inner();
            for (question_id, value) in &answers {
                repo.create_answer(&submission, *question_id, value)?;
            }
            let quiz_status = mark_submitted(repo, key, at)?;

            emit_json(serde_json::json!({
                "stage": stage.as_str(),
                "created": created,
                "submission": submission,
                "answers": repo.get_answers(submission.id)?,
                "quiz_status": quiz_status
            }))
        }
        QuizCommand::Grade(args) => {
            let submission = existing_submission(repo, &args.key)?;
            let grade = repo.create_grade(
                &submission,
                args.question_id,
                args.points,
                args.feedback.as_deref(),
            )?;
            emit_json(serde_json::json!({
                "stage": stage.as_str(),
                "grade": grade
            }))
        }
        QuizCommand::Finalize(args) => {
            let mut submission = existing_submission(repo, &args.key)?;
            submission.final_grade = Some(args.final_grade);
            submission.updated_at = OffsetDateTime::now_utc();
            repo.save_submission(&submission)?;
            emit_json(serde_json::json!({
                "stage": stage.as_str(),
                "submission": submission
            }))
        }
        QuizCommand::Show(args) => {
            let key = args.natural_key();
            let submission = repo.get_submission(key)?;
            let (answers, grades) = match &submission {
                Some(submission) => {
                    (repo.get_answers(submission.id)?, repo.get_grades(submission.id)?)
                }
                None => (Vec::new(), Vec::new()),
            };
            emit_json(serde_json::json!({
                "stage": stage.as_str(),
                "found": submission.is_some(),
                "submission": submission,
                "answers": answers,
                "grades": grades
            }))
        }
    }
}

fn existing_submission(repo: &Repository, key: &QuizKeyArgs) -> Result<Submission> {
    let key = key.natural_key();
    repo.get_submission(key)?.ok_or_else(|| anyhow!("no submission for quiz {key}"))
}

fn parse_answer(raw: &str) -> Result<(i64, String)> {
    let (question, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("answer must be QUESTION_ID=VALUE (received: {raw})"))?;
    let question_id = question
        .trim()
        .parse::<i64>()
        .with_context(|| format!("invalid question id in answer: {raw}"))?;
    Ok((question_id, value.to_string()))
}

fn scheduler_for(store: &SqliteStore, config: &MigrationConfig) -> Scheduler {
    let mut scheduler = MigrationJobScheduler::new(store.options(), store.task_queue());
    for job in standard_jobs(store, &store.legacy(), &store.relational(), config) {
        scheduler.register(job);
    }
    scheduler
}

fn run_migration(
    command: MigrationCommand,
    store: &SqliteStore,
    config: &MigrationConfig,
) -> Result<()> {
    let mut scheduler = scheduler_for(store, config);
    match command {
        MigrationCommand::Process => {
            let message = process(&mut scheduler)?;
            emit_json(serde_json::json!({
                "message": message,
                "status": render_status(&scheduler.state()?)
            }))
        }
        MigrationCommand::Work(args) => {
            let summary =
                MigrationWorker::new(config.lease_timeout()).drain(&mut scheduler, args.max_tasks)?;
            emit_json(serde_json::json!({
                "summary": summary,
                "status": render_status(&scheduler.state()?)
            }))
        }
        MigrationCommand::Status => {
            let view = status_view(&scheduler)?;
            emit_json(serde_json::to_value(&view).context("failed to serialize migration status")?)
        }
        MigrationCommand::Reset => {
            let cancelled = scheduler.clear_state()?;
            emit_json(serde_json::json!({
                "reset": true,
                "cancelled_tasks": cancelled,
                "status": render_status(&scheduler.state()?)
            }))
        }
        MigrationCommand::Validate(args) => run_migration_validate(&args, store, &scheduler),
    }
}

fn status_view(scheduler: &Scheduler) -> Result<StatusView> {
    let state = scheduler.state()?;
    Ok(StatusView {
        status: render_status(&state),
        started_at: state.started_at,
        completed_at: state.completed_at,
        errors: state.errors,
        jobs: scheduler.job_statuses()?,
        pending_tasks: scheduler.queue().pending(MIGRATION_JOB_ACTION)?.len(),
    })
}

fn run_migration_validate(
    args: &MigrationValidateArgs,
    store: &SqliteStore,
    scheduler: &Scheduler,
) -> Result<()> {
    let state = scheduler.state()?;
    let legacy = store.legacy();
    let relational = store.relational();
    let reports = vec![
        ProgressValidation::new(store, &legacy, &relational).run(&state)?,
        SubmissionValidation::new(store, &legacy, &relational).run(&state)?,
    ];
    let manifest = args.out.as_ref().map(|out| export_reports(&reports, out)).transpose()?;
    let lines: Vec<String> = reports.iter().flat_map(|report| report.render()).collect();

    emit_json(serde_json::json!({
        "valid": reports.iter().all(|report| report.is_valid()),
        "lines": lines,
        "reports": reports,
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

impl ProgressKeyArgs {
    fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.entity_id, self.user_id)
    }
}

impl QuizKeyArgs {
    fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.quiz_id, self.user_id)
    }
}

impl StageArg {
    fn into_stage(self) -> RolloutStage {
        match self {
            Self::LegacyOnly => RolloutStage::LegacyOnly,
            Self::DualWriteReadLegacy => RolloutStage::DualWriteReadLegacy,
            Self::DualWriteReadRelational => RolloutStage::DualWriteReadRelational,
        }
    }
}

impl QuizResultArg {
    fn into_quiz_status(self) -> QuizStatus {
        match self {
            Self::Ungraded => QuizStatus::Ungraded,
            Self::Graded => QuizStatus::Graded,
            Self::Passed => QuizStatus::Passed,
            Self::Failed => QuizStatus::Failed,
        }
    }
}
