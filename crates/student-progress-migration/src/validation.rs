use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use student_progress_core::{
    ActivityLogScan, ActivityRepository, ContentCatalog, CourseStatus, EntityKind, KeyedDiff,
    LessonStatus, LogEntryType, MigrationState, NaturalKey, ProgressRepository, ProgressStatus,
    QuizStatus, Submission,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const VALIDATION_ERRORS_FILE: &str = "validation_errors.ndjson";
pub const VALIDATION_MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationError {
    pub message: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub validator: String,
    pub migration_complete: bool,
    /// Natural keys compared across both representations.
    pub checked: usize,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    fn start(validator: &str, state: &MigrationState) -> Self {
        let mut report = Self {
            validator: validator.to_string(),
            migration_complete: state.is_complete(),
            checked: 0,
            errors: Vec::new(),
        };
        if !report.migration_complete {
            report.push("migration not complete", json!({}));
        }
        report
    }

    fn push(&mut self, message: impl Into<String>, data: Value) {
        self.errors.push(ValidationError { message: message.into(), data });
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Operator-facing summary: one header line, then one line per error.
    #[must_use]
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{}: {} checked, {} errors",
            self.validator,
            self.checked,
            self.errors.len()
        )];
        lines.extend(self.errors.iter().map(|error| format!("  {}", error.message)));
        lines
    }
}

/// Users to compare for one catalog entity, discovered from the activity log.
///
/// Quiz kinds live on the parent lesson's entries, so the scan goes through the lesson.
fn users_for<C>(catalog: &C, kind: EntityKind, entity_id: i64) -> Result<Vec<i64>>
where
    C: ContentCatalog + ActivityLogScan,
{
    match kind {
        EntityKind::CourseProgress => {
            catalog.user_ids_with_entries(entity_id, LogEntryType::CourseStatus)
        }
        EntityKind::LessonProgress => {
            catalog.user_ids_with_entries(entity_id, LogEntryType::LessonStatus)
        }
        EntityKind::QuizProgress | EntityKind::QuizSubmission => {
            match catalog.lesson_for_quiz(entity_id)? {
                Some(lesson_id) => {
                    catalog.user_ids_with_entries(lesson_id, LogEntryType::LessonStatus)
                }
                None => Ok(Vec::new()),
            }
        }
    }
}

fn missing_side(
    report: &mut ValidationReport,
    kind: EntityKind,
    key: NaturalKey,
    missing_from: &str,
    present: Value,
) {
    report.push(
        format!("{} {key} is missing from the {missing_from} representation", kind.as_str()),
        json!({
            "entity": kind.as_str(),
            "entity_id": key.entity_id,
            "user_id": key.user_id,
            "missing_from": missing_from,
            "present": present,
        }),
    );
}

fn mismatch(
    report: &mut ValidationReport,
    kind: EntityKind,
    key: NaturalKey,
    field: &str,
    legacy: Value,
    relational: Value,
) {
    report.push(
        format!("{} {key} {field} mismatch", kind.as_str()),
        json!({
            "entity": kind.as_str(),
            "entity_id": key.entity_id,
            "user_id": key.user_id,
            "field": field,
            "legacy": legacy,
            "relational": relational,
        }),
    );
}

fn timestamp(value: Option<OffsetDateTime>) -> Result<Value> {
    Ok(match value {
        Some(value) => {
            Value::String(value.format(&Rfc3339).context("failed to format timestamp")?)
        }
        None => Value::Null,
    })
}

/// Compares course, lesson and quiz progress across both representations.
pub struct ProgressValidation<'a, C, L, R> {
    catalog: &'a C,
    legacy: &'a L,
    relational: &'a R,
}

impl<'a, C, L, R> ProgressValidation<'a, C, L, R>
where
    C: ContentCatalog + ActivityLogScan,
    L: ActivityRepository,
    R: ActivityRepository,
{
    #[must_use]
    pub fn new(catalog: &'a C, legacy: &'a L, relational: &'a R) -> Self {
        Self { catalog, legacy, relational }
    }

    /// Read-only comparison; never writes to either representation.
    ///
    /// # Errors
    /// Returns an error when the catalog or either representation cannot be read.
    pub fn run(&self, state: &MigrationState) -> Result<ValidationReport> {
        let mut report = ValidationReport::start("progress", state);
        self.validate_kind::<CourseStatus>(&self.catalog.course_ids()?, &mut report)?;
        self.validate_kind::<LessonStatus>(&self.catalog.lesson_ids()?, &mut report)?;
        self.validate_kind::<QuizStatus>(&self.catalog.quiz_ids()?, &mut report)?;
        Ok(report)
    }

    fn validate_kind<S: ProgressStatus>(
        &self,
        entity_ids: &[i64],
        report: &mut ValidationReport,
    ) -> Result<()>
    where
        L: ProgressRepository<S>,
        R: ProgressRepository<S>,
    {
        let kind = EntityKind::from(S::KIND);
        for &entity_id in entity_ids {
            for user_id in users_for(self.catalog, kind, entity_id)? {
                let key = NaturalKey::new(entity_id, user_id);
                let legacy = <L as ProgressRepository<S>>::get(self.legacy, key)?;
                let relational = <R as ProgressRepository<S>>::get(self.relational, key)?;
                match (legacy, relational) {
                    (None, None) => {}
                    (Some(legacy), None) => {
                        report.checked += 1;
                        let present = serde_json::to_value(legacy)?;
                        missing_side(report, kind, key, "relational", present);
                    }
                    (None, Some(relational)) => {
                        report.checked += 1;
                        let present = serde_json::to_value(relational)?;
                        missing_side(report, kind, key, "legacy", present);
                    }
                    (Some(legacy), Some(relational)) => {
                        report.checked += 1;
                        if legacy.status != relational.status {
                            mismatch(
                                report,
                                kind,
                                key,
                                "status",
                                json!(legacy.status.as_str()),
                                json!(relational.status.as_str()),
                            );
                        }
                        if legacy.started_at != relational.started_at {
                            mismatch(
                                report,
                                kind,
                                key,
                                "started_at",
                                timestamp(Some(legacy.started_at))?,
                                timestamp(Some(relational.started_at))?,
                            );
                        }
                        if legacy.completed_at != relational.completed_at {
                            mismatch(
                                report,
                                kind,
                                key,
                                "completed_at",
                                timestamp(legacy.completed_at)?,
                                timestamp(relational.completed_at)?,
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Compares quiz submissions with their answers and grades across both representations.
pub struct SubmissionValidation<'a, C, L, R> {
    catalog: &'a C,
    legacy: &'a L,
    relational: &'a R,
}

impl<'a, C, L, R> SubmissionValidation<'a, C, L, R>
where
    C: ContentCatalog + ActivityLogScan,
    L: ActivityRepository,
    R: ActivityRepository,
{
    #[must_use]
    pub fn new(catalog: &'a C, legacy: &'a L, relational: &'a R) -> Self {
        Self { catalog, legacy, relational }
    }

    /// # Errors
    /// Returns an error when the catalog or either representation cannot be read.
    pub fn run(&self, state: &MigrationState) -> Result<ValidationReport> {
        let kind = EntityKind::QuizSubmission;
        let mut report = ValidationReport::start("quiz_submissions", state);
        for quiz_id in self.catalog.quiz_ids()? {
            for user_id in users_for(self.catalog, kind, quiz_id)? {
                let key = NaturalKey::new(quiz_id, user_id);
                match (self.legacy.get_submission(key)?, self.relational.get_submission(key)?) {
                    (None, None) => {}
                    (Some(legacy), None) => {
                        report.checked += 1;
                        let present = serde_json::to_value(legacy)?;
                        missing_side(&mut report, kind, key, "relational", present);
                    }
                    (None, Some(relational)) => {
                        report.checked += 1;
                        let present = serde_json::to_value(relational)?;
                        missing_side(&mut report, kind, key, "legacy", present);
                    }
                    (Some(legacy), Some(relational)) => {
                        report.checked += 1;
                        self.compare(&mut report, key, &legacy, &relational)?;
                    }
                }
            }
        }
        Ok(report)
    }

    fn compare(
        &self,
        report: &mut ValidationReport,
        key: NaturalKey,
        legacy: &Submission,
        relational: &Submission,
    ) -> Result<()> {
        let kind = EntityKind::QuizSubmission;
        if legacy.final_grade != relational.final_grade {
            mismatch(
                report,
                kind,
                key,
                "final_grade",
                json!(legacy.final_grade),
                json!(relational.final_grade),
            );
        }
        if legacy.created_at != relational.created_at {
            mismatch(
                report,
                kind,
                key,
                "created_at",
                timestamp(Some(legacy.created_at))?,
                timestamp(Some(relational.created_at))?,
            );
        }

        let legacy_answers: BTreeMap<i64, String> = self
            .legacy
            .get_answers(legacy.id)?
            .into_iter()
            .map(|answer| (answer.question_id, answer.value))
            .collect();
        let relational_answers: BTreeMap<i64, String> = self
            .relational
            .get_answers(relational.id)?
            .into_iter()
            .map(|answer| (answer.question_id, answer.value))
            .collect();
        compare_children(report, key, "answer", &legacy_answers, &relational_answers);

        let legacy_grades: BTreeMap<i64, (i64, Option<String>)> = self
            .legacy
            .get_grades(legacy.id)?
            .into_iter()
            .map(|grade| (grade.question_id, (grade.points, grade.feedback)))
            .collect();
        let relational_grades: BTreeMap<i64, (i64, Option<String>)> = self
            .relational
            .get_grades(relational.id)?
            .into_iter()
            .map(|grade| (grade.question_id, (grade.points, grade.feedback)))
            .collect();
        compare_children(report, key, "grade", &legacy_grades, &relational_grades);
        Ok(())
    }
}

/// Keyed comparison of per-question children: count, one-sided keys, changed values.
fn compare_children<V>(
    report: &mut ValidationReport,
    key: NaturalKey,
    child: &str,
    legacy: &BTreeMap<i64, V>,
    relational: &BTreeMap<i64, V>,
) where
    V: PartialEq + Serialize,
{
    let kind = EntityKind::QuizSubmission;
    let entity = kind.as_str();
    let base = json!({
        "entity": entity,
        "entity_id": key.entity_id,
        "user_id": key.user_id,
    });
    let with = |extra: Value| {
        let mut data = base.clone();
        if let (Some(data), Value::Object(extra)) = (data.as_object_mut(), extra) {
            data.extend(extra);
        }
        data
    };

    if legacy.len() != relational.len() {
        report.push(
            format!("{entity} {key} {child} count mismatch"),
            with(json!({ "legacy": legacy.len(), "relational": relational.len() })),
        );
    }

    let diff = KeyedDiff::compute(legacy, relational);
    for question_id in diff.only_left {
        report.push(
            format!("{entity} {key} {child} for question {question_id} missing from relational"),
            with(json!({ "question_id": question_id, "legacy": legacy.get(&question_id) })),
        );
    }
    for question_id in diff.only_right {
        report.push(
            format!("{entity} {key} {child} for question {question_id} missing from legacy"),
            with(json!({
                "question_id": question_id,
                "relational": relational.get(&question_id),
            })),
        );
    }
    for question_id in diff.changed {
        report.push(
            format!("{entity} {key} {child} for question {question_id} mismatch"),
            with(json!({
                "question_id": question_id,
                "legacy": legacy.get(&question_id),
                "relational": relational.get(&question_id),
            })),
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationManifest {
    pub exported_at: String,
    pub files: Vec<ValidationFileDigest>,
}

#[derive(Debug, Clone, Serialize)]
struct ValidationRow<'a> {
    validator: &'a str,
    message: &'a str,
    data: &'a Value,
}

/// Write every report's errors as NDJSON plus a manifest carrying the file digest.
///
/// # Errors
/// Returns an error when the output directory or files cannot be written.
pub fn export_reports(reports: &[ValidationReport], out_dir: &Path) -> Result<ValidationManifest> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

    let rows: Vec<ValidationRow<'_>> = reports
        .iter()
        .flat_map(|report| {
            report.errors.iter().map(|error| ValidationRow {
                validator: &report.validator,
                message: &error.message,
                data: &error.data,
            })
        })
        .collect();
    let (sha256, records) = write_ndjson_file(&out_dir.join(VALIDATION_ERRORS_FILE), &rows)?;

    let manifest = ValidationManifest {
        exported_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format export timestamp")?,
        files: vec![ValidationFileDigest {
            path: VALIDATION_ERRORS_FILE.to_string(),
            sha256,
            records,
        }],
    };
    let manifest_path = out_dir.join(VALIDATION_MANIFEST_FILE);
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).context("failed to serialize validation manifest")?;
    fs::write(&manifest_path, manifest_json)
        .with_context(|| format!("failed to write manifest {}", manifest_path.display()))?;
    Ok(manifest)
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(errors: &[&str]) -> ValidationReport {
        ValidationReport {
            validator: "progress".to_string(),
            migration_complete: true,
            checked: 3,
            errors: errors
                .iter()
                .map(|message| ValidationError { message: (*message).to_string(), data: json!({}) })
                .collect(),
        }
    }

    #[test]
    fn incomplete_migration_is_reported_first() {
        let report = ValidationReport::start("progress", &MigrationState::default());
        assert!(!report.migration_complete);
        assert_eq!(report.errors[0].message, "migration not complete");

        let done = MigrationState { completed_at: Some(1.0), ..MigrationState::default() };
        assert!(ValidationReport::start("progress", &done).is_valid());
    }

    #[test]
    fn child_comparison_reports_count_and_keyed_differences() {
        let mut report = report(&[]);
        let legacy =
            BTreeMap::from([(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())]);
        let relational = BTreeMap::from([(1, "a".to_string()), (2, "x".to_string())]);
        compare_children(&mut report, NaturalKey::new(4, 7), "answer", &legacy, &relational);

        let messages: Vec<_> = report.errors.iter().map(|error| error.message.as_str()).collect();
        assert_eq!(messages, vec![
            "quiz_submissions (4, 7) answer count mismatch",
            "quiz_submissions (4, 7) answer for question 3 missing from relational",
            "quiz_submissions (4, 7) answer for question 2 mismatch",
        ]);
        assert_eq!(report.errors[2].data["legacy"], json!("b"));
        assert_eq!(report.errors[2].data["user_id"], json!(7));
    }

    #[test]
    fn render_lists_every_error() {
        let lines = report(&["course_progress (1, 7) status mismatch"]).render();
        assert_eq!(lines, vec![
            "progress: 3 checked, 1 errors".to_string(),
            "  course_progress (1, 7) status mismatch".to_string(),
        ]);
    }

    #[test]
    fn export_writes_ndjson_and_manifest_digest() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "student-progress-validation-{}-{}",
            std::process::id(),
            OffsetDateTime::now_utc().unix_timestamp_nanos()
        ));
        let manifest = export_reports(&[report(&["a", "b"]), report(&["c"])], &dir)?;
        assert_eq!(manifest.files[0].records, 3);

        let bytes = fs::read(dir.join(VALIDATION_ERRORS_FILE))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        assert_eq!(format!("{:x}", hasher.finalize()), manifest.files[0].sha256);
        assert_eq!(String::from_utf8(bytes)?.lines().count(), 3);

        let stored: ValidationManifest =
            serde_json::from_slice(&fs::read(dir.join(VALIDATION_MANIFEST_FILE))?)?;
        assert_eq!(stored, manifest);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
