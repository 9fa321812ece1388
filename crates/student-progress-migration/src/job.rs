use serde::{Deserialize, Serialize};
use student_progress_core::{BatchRecord, JobCounters};

use crate::migration::Migration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    Running,
    Complete,
}

impl JobState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Complete => "complete",
        }
    }
}

/// Result of one job pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRun {
    pub scanned: usize,
    pub inserted: usize,
    pub cursor: i64,
    /// The batch found nothing left past the cursor.
    pub complete: bool,
    pub errors: Vec<String>,
}

impl JobRun {
    #[must_use]
    pub fn to_record(&self) -> BatchRecord {
        BatchRecord {
            scanned: self.scanned,
            inserted: self.inserted,
            cursor: self.cursor,
            complete: self.complete,
        }
    }
}

/// A named migration with its batch size.
///
/// Progress lives in the durable [`JobCounters`]: each run resumes from the recorded
/// cursor and a job is complete once a run finds nothing past it.
pub struct MigrationJob {
    name: String,
    migration: Box<dyn Migration>,
    batch_size: usize,
    errors: Vec<String>,
}

impl MigrationJob {
    #[must_use]
    pub fn new(name: impl Into<String>, migration: Box<dyn Migration>, batch_size: usize) -> Self {
        Self { name: name.into(), migration, batch_size: batch_size.max(1), errors: Vec::new() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run one batch after the cursor in `counters`. Failures are captured into the
    /// returned errors; a job never aborts the pipeline. A completed job does nothing.
    pub fn run(&mut self, counters: &JobCounters) -> JobRun {
        if counters.complete {
            return JobRun { cursor: counters.cursor, complete: true, ..JobRun::default() };
        }

        let mut run = JobRun { cursor: counters.cursor, ..JobRun::default() };
        match self.migration.run(counters.cursor, self.batch_size) {
            Ok(batch) => {
                run.scanned = batch.scanned;
                run.inserted = batch.inserted;
                run.cursor = batch.cursor.max(counters.cursor);
                run.complete = batch.is_exhausted();
            }
            Err(err) => {
                tracing::warn!(
                    job = %self.name,
                    error = %format!("{err:#}"),
                    "migration batch failed"
                );
                run.errors.push(format!("migration batch failed for {}: {err:#}", self.name));
            }
        }
        // Record errors were produced before any batch failure that ended the pass.
        let mut record_errors = self.migration.take_errors();
        record_errors.append(&mut run.errors);
        run.errors = record_errors;

        self.errors.extend(run.errors.iter().cloned());
        run
    }

    /// Every error this job instance has produced.
    #[must_use]
    pub fn get_errors(&self) -> &[String] {
        &self.errors
    }

    #[must_use]
    pub fn state(counters: Option<&JobCounters>) -> JobState {
        match counters {
            Some(counters) if counters.complete => JobState::Complete,
            Some(counters) if counters.batches > 0 => JobState::Running,
            _ => JobState::NotStarted,
        }
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }
}
