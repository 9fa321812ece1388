use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{now}", std::process::id()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_spm<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_spm"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute spm binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_spm(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "spm command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(as_str(&value, "contract_version"), "cli.v1");
    value
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn spm(db: &Path, args: &[&str]) -> Value {
    let mut full = vec!["--db", path_str(db)];
    full.extend_from_slice(args);
    run_json(full)
}

fn spm_at_stage(db: &Path, stage: &str, args: &[&str]) -> Value {
    let mut full = vec!["--db", path_str(db), "--stage", stage];
    full.extend_from_slice(args);
    run_json(full)
}

#[test]
fn schema_commands_report_versions() {
    let dir = unique_temp_dir("spm-schema");
    let db = dir.join("progress.sqlite3");

    let before = spm(&db, &["db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert!(!as_bool(&before, "up_to_date"));

    let dry_run = spm(&db, &["db", "migrate", "--dry-run"]);
    assert!(as_bool(&dry_run, "dry_run"));
    assert_eq!(dry_run["would_apply_versions"], serde_json::json!([1, 2]));

    let migrated = spm(&db, &["db", "migrate"]);
    assert_eq!(as_i64(&migrated, "after_version"), 2);
    assert!(as_bool(&migrated, "up_to_date"));

    let integrity = spm(&db, &["db", "integrity-check"]);
    assert!(as_bool(&integrity, "quick_check_ok"));
    assert_eq!(integrity["foreign_key_violations"], serde_json::json!([]));

    fs::remove_dir_all(&dir).unwrap_or_else(|err| panic!("failed to clean up: {err}"));
}

#[test]
fn end_to_end_migration_through_the_cli() {
    let dir = unique_temp_dir("spm-e2e");
    let db = dir.join("progress.sqlite3");
    let out = dir.join("validation");

    let course = spm(&db, &["content", "add-course", "--title", "Intro"]);
    assert_eq!(as_i64(&course, "course_id"), 1);

    let started = spm_at_stage(&db, "legacy-only", &[
        "progress",
        "start",
        "--kind",
        "course",
        "--entity-id",
        "1",
        "--user-id",
        "7",
        "--at",
        "2026-01-05T09:00:00Z",
    ]);
    assert!(as_bool(&started, "created"));
    assert_eq!(as_str(&started["progress"], "status"), "in-progress");
    assert_eq!(as_str(&started, "stage"), "legacy-only");

    let completed = spm_at_stage(&db, "legacy-only", &[
        "progress",
        "complete",
        "--kind",
        "course",
        "--entity-id",
        "1",
        "--user-id",
        "7",
        "--at",
        "2026-01-05T11:00:00Z",
    ]);
    assert_eq!(as_str(&completed["progress"], "status"), "complete");

    let relational_before = spm_at_stage(&db, "dual-write-read-relational", &[
        "progress",
        "show",
        "--kind",
        "course",
        "--entity-id",
        "1",
        "--user-id",
        "7",
    ]);
    assert!(!as_bool(&relational_before, "found"));

    let status = spm(&db, &["migration", "status"]);
    assert_eq!(status["status"], serde_json::json!(["Status: Not started"]));

    let processed = spm(&db, &["migration", "process"]);
    assert_eq!(as_str(&processed, "message"), "Migration scheduled, starting with course_progress.");
    assert_eq!(processed["status"], serde_json::json!(["Status: In progress"]));

    let worked = spm(&db, &["migration", "work"]);
    assert!(as_bool(&worked["summary"], "migration_complete"));
    assert_eq!(worked["status"], serde_json::json!(["Status: Completed"]));

    let relational_after = spm_at_stage(&db, "dual-write-read-relational", &[
        "progress",
        "show",
        "--kind",
        "course",
        "--entity-id",
        "1",
        "--user-id",
        "7",
    ]);
    assert!(as_bool(&relational_after, "found"));
    assert_eq!(as_str(&relational_after["progress"], "status"), "complete");
    assert_eq!(as_str(&relational_after["progress"], "completed_at"), "2026-01-05T11:00:00Z");

    let status = spm(&db, &["migration", "status"]);
    assert_eq!(as_i64(&status, "pending_tasks"), 0);
    let jobs = status["jobs"]
        .as_array()
        .unwrap_or_else(|| panic!("jobs should be an array: {status}"));
    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().all(|job| as_str(job, "state") == "complete"));

    let validated = spm(&db, &["migration", "validate", "--out", path_str(&out)]);
    assert!(as_bool(&validated, "valid"));
    assert_eq!(validated["manifest"]["files"][0]["records"], serde_json::json!(0));
    assert!(out.join("validation_errors.ndjson").exists());
    assert!(out.join("manifest.json").exists());

    let again = spm(&db, &["migration", "process"]);
    assert_eq!(
        as_str(&again, "message"),
        "Migration has already completed. Reset the migration state to run it again."
    );

    let reset = spm(&db, &["migration", "reset"]);
    assert_eq!(as_i64(&reset, "cancelled_tasks"), 0);
    assert_eq!(reset["status"], serde_json::json!(["Status: Not started"]));

    fs::remove_dir_all(&dir).unwrap_or_else(|err| panic!("failed to clean up: {err}"));
}

#[test]
fn quiz_activity_is_dual_written() {
    let dir = unique_temp_dir("spm-quiz");
    let db = dir.join("progress.sqlite3");

    spm(&db, &["content", "add-course", "--title", "Course"]);
    let lesson = spm(&db, &["content", "add-lesson", "--title", "Lesson", "--course-id", "1"]);
    let lesson_id = as_i64(&lesson, "lesson_id").to_string();
    let quiz = spm(&db, &["content", "add-quiz", "--title", "Quiz", "--lesson-id", &lesson_id]);
    let quiz_id = as_i64(&quiz, "quiz_id").to_string();

    spm(&db, &[
        "progress",
        "start",
        "--kind",
        "lesson",
        "--entity-id",
        &lesson_id,
        "--user-id",
        "3",
    ]);
    spm(&db, &["progress", "start", "--kind", "quiz", "--entity-id", &quiz_id, "--user-id", "3"]);

    let submitted = spm(&db, &[
        "quiz",
        "submit",
        "--quiz-id",
        &quiz_id,
        "--user-id",
        "3",
        "--answer",
        "11=blue",
        "--answer",
        "12=42",
    ]);
    assert!(as_bool(&submitted, "created"));
    assert_eq!(as_str(&submitted, "quiz_status"), "ungraded");
    assert_eq!(submitted["answers"].as_array().map(Vec::len), Some(2));

    spm(&db, &[
        "quiz",
        "grade",
        "--quiz-id",
        &quiz_id,
        "--user-id",
        "3",
        "--question-id",
        "11",
        "--points",
        "1",
        "--feedback",
        "correct",
    ]);
    spm(&db, &["quiz", "finalize", "--quiz-id", &quiz_id, "--user-id", "3", "--final-grade", "50"]);

    for stage in ["dual-write-read-legacy", "dual-write-read-relational"] {
        let shown = spm_at_stage(&db, stage, &["quiz", "show", "--quiz-id", &quiz_id, "--user-id", "3"]);
        assert!(as_bool(&shown, "found"), "submission missing at stage {stage}");
        assert_eq!(shown["submission"]["final_grade"], serde_json::json!(50.0));
        assert_eq!(shown["answers"].as_array().map(Vec::len), Some(2));
        assert_eq!(as_str(&shown["grades"][0], "feedback"), "correct");
    }

    fs::remove_dir_all(&dir).unwrap_or_else(|err| panic!("failed to clean up: {err}"));
}

#[test]
fn legacy_quiz_write_without_lesson_fails() {
    let dir = unique_temp_dir("spm-parent");
    let db = dir.join("progress.sqlite3");

    spm(&db, &["content", "add-lesson", "--title", "Lesson"]);
    let quiz = spm(&db, &["content", "add-quiz", "--title", "Quiz", "--lesson-id", "1"]);
    let quiz_id = as_i64(&quiz, "quiz_id").to_string();

    let output = run_spm([
        "--db",
        path_str(&db),
        "progress",
        "start",
        "--kind",
        "quiz",
        "--entity-id",
        quiz_id.as_str(),
        "--user-id",
        "5",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("missing parent state"), "unexpected stderr: {stderr}");

    fs::remove_dir_all(&dir).unwrap_or_else(|err| panic!("failed to clean up: {err}"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = unique_temp_dir("spm-config");
    let db = dir.join("progress.sqlite3");
    let config = dir.join("migration.json");
    fs::write(&config, r#"{"progress_batch_size": 0}"#)
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));

    let output = run_spm(["--db", path_str(&db), "--config", path_str(&config), "migration", "status"]);
    assert!(!output.status.success());

    fs::write(&config, r#"{"progress_batch_size": 2, "enforce_hierarchy": true}"#)
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    let status = run_json(["--db", path_str(&db), "--config", path_str(&config), "migration", "status"]);
    assert_eq!(status["status"], serde_json::json!(["Status: Not started"]));

    fs::remove_dir_all(&dir).unwrap_or_else(|err| panic!("failed to clean up: {err}"));
}
