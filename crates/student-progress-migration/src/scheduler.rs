use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use student_progress_core::{
    JobCounters, KeyValueStore, MigrationState, MigrationStateStore, ProgressError, TaskQueue,
    MIGRATION_JOB_ACTION,
};
use time::OffsetDateTime;

use crate::job::{JobState, MigrationJob};

/// What one `run_job` call did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOutcome {
    pub job: String,
    pub scanned: usize,
    pub inserted: usize,
    /// Errors newly added to the durable list by this run.
    pub errors: Vec<String>,
    pub job_complete: bool,
    /// Job enqueued as the follow-up: this job again, the next job, or nothing.
    pub next_job: Option<String>,
    pub migration_complete: bool,
    pub counters: JobCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    pub counters: Option<JobCounters>,
}

/// Ordered job registry driving the pipeline through the persistent task queue.
///
/// Jobs run strictly in registration order: a job is enqueued only once every job
/// registered before it has completed. Completion and scan positions are read from the
/// durable job counters, so a freshly built scheduler picks up where another left off.
pub struct MigrationJobScheduler<K, Q> {
    state: MigrationStateStore<K>,
    queue: Q,
    jobs: Vec<MigrationJob>,
}

fn counters_for(state: &MigrationState, name: &str) -> JobCounters {
    state.jobs.get(name).copied().unwrap_or_default()
}

impl<K: KeyValueStore, Q: TaskQueue> MigrationJobScheduler<K, Q> {
    #[must_use]
    pub fn new(kv: K, queue: Q) -> Self {
        Self { state: MigrationStateStore::new(kv), queue, jobs: Vec::new() }
    }

    pub fn register(&mut self, job: MigrationJob) {
        self.jobs.push(job);
    }

    #[must_use]
    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(MigrationJob::name).collect()
    }

    #[must_use]
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// First job at or after `from` whose durable counters are not complete.
    fn next_incomplete(&self, state: &MigrationState, from: usize) -> Option<&MigrationJob> {
        self.jobs.iter().skip(from).find(|job| !counters_for(state, job.name()).complete)
    }

    /// Enqueue the first incomplete job, mark the migration started, and return the
    /// job's name; `None` when every registered job is already complete.
    ///
    /// A migration task that is already claimed or pending keeps its chain: the call
    /// enqueues nothing and returns that task's job.
    ///
    /// # Errors
    /// Returns [`ProgressError::SchedulerConfiguration`] when no jobs are registered, or
    /// an error when the queue cannot be written.
    pub fn schedule(&mut self) -> Result<Option<String>> {
        if self.jobs.is_empty() {
            return Err(ProgressError::SchedulerConfiguration.into());
        }

        if let Some(task) = self.queue.active(MIGRATION_JOB_ACTION)?.into_iter().next() {
            tracing::info!(job = %task.job_name, task_id = %task.task_id, "migration already queued");
            return Ok(Some(task.job_name));
        }

        let state = self.state.load()?;
        let Some(job) = self.next_incomplete(&state, 0) else {
            return Ok(None);
        };
        let name = job.name().to_string();
        self.queue
            .enqueue(MIGRATION_JOB_ACTION, &name)
            .with_context(|| format!("failed to schedule migration job {name}"))?;
        tracing::info!(job = %name, "migration scheduled");
        if self.state.mark_started(OffsetDateTime::now_utc())? {
            tracing::info!(job = %name, "migration started");
        }
        Ok(Some(name))
    }

    /// Run one batch of the named job and enqueue whatever follows it.
    ///
    /// # Errors
    /// Returns [`ProgressError::UnknownJob`] for an unregistered name, or an error when
    /// durable state or the queue cannot be written.
    pub fn run_job(&mut self, name: &str) -> Result<JobOutcome> {
        let index = self
            .jobs
            .iter()
            .position(|job| job.name() == name)
            .ok_or_else(|| ProgressError::UnknownJob(name.to_string()))?;

        if self.state.mark_started(OffsetDateTime::now_utc())? {
            tracing::info!(job = name, "migration started");
        }

        let before = counters_for(&self.state.load()?, name);
        if before.complete {
            // A stale task for a finished job; whoever completed it already moved on.
            tracing::debug!(job = name, "migration job already complete");
            return Ok(JobOutcome {
                job: name.to_string(),
                scanned: 0,
                inserted: 0,
                errors: Vec::new(),
                job_complete: true,
                next_job: None,
                migration_complete: self.state.load()?.is_complete(),
                counters: before,
            });
        }

        let run = self.jobs[index].run(&before);
        let errors = self.state.append_new_errors(&run.errors)?;
        let counters = self.state.record_batch(name, &run.to_record())?;

        let mut next_job = None;
        let mut migration_complete = false;
        if counters.complete {
            let state = self.state.load()?;
            match self.next_incomplete(&state, index + 1) {
                Some(next) => {
                    self.queue.enqueue(MIGRATION_JOB_ACTION, next.name())?;
                    tracing::info!(job = name, next = next.name(), "migration job complete");
                    next_job = Some(next.name().to_string());
                }
                None => {
                    if !state.is_complete() {
                        self.state.mark_completed(OffsetDateTime::now_utc())?;
                        tracing::info!(job = name, "migration complete");
                    }
                    migration_complete = true;
                }
            }
        } else {
            self.queue.enqueue(MIGRATION_JOB_ACTION, name)?;
            next_job = Some(name.to_string());
        }

        Ok(JobOutcome {
            job: name.to_string(),
            scanned: run.scanned,
            inserted: run.inserted,
            errors,
            job_complete: counters.complete,
            next_job,
            migration_complete,
            counters,
        })
    }

    /// # Errors
    /// Returns an error when durable state cannot be read.
    pub fn state(&self) -> Result<MigrationState> {
        self.state.load()
    }

    /// Per-job state in registration order, from the durable counters. A completed
    /// migration reports every job complete.
    ///
    /// # Errors
    /// Returns an error when durable state cannot be read.
    pub fn job_statuses(&self) -> Result<Vec<JobStatus>> {
        let state = self.state.load()?;
        Ok(self
            .jobs
            .iter()
            .map(|job| {
                let counters = state.jobs.get(job.name()).copied();
                let job_state = if state.is_complete() {
                    JobState::Complete
                } else {
                    MigrationJob::state(counters.as_ref())
                };
                JobStatus { name: job.name().to_string(), state: job_state, counters }
            })
            .collect())
    }

    /// # Errors
    /// Returns an error when durable state cannot be read.
    pub fn is_in_progress(&self) -> Result<bool> {
        Ok(self.state.load()?.is_in_progress())
    }

    /// # Errors
    /// Returns an error when durable state cannot be read.
    pub fn is_complete(&self) -> Result<bool> {
        Ok(self.state.load()?.is_complete())
    }

    /// Wipe every durable marker and job counter, cancel pending queue entries and
    /// clear the jobs' errors. Returns the number of cancelled tasks.
    ///
    /// # Errors
    /// Returns an error when durable state or the queue cannot be written.
    pub fn clear_state(&mut self) -> Result<usize> {
        self.state.clear()?;
        let cancelled = self.queue.cancel_pending(MIGRATION_JOB_ACTION)?;
        for job in &mut self.jobs {
            job.clear_errors();
        }
        tracing::info!(cancelled, "migration state cleared");
        Ok(cancelled)
    }

    /// Record that `job` stopped without finishing. Earlier errors are kept.
    ///
    /// # Errors
    /// Returns an error when durable state cannot be written.
    pub fn handle_unexpected_shutdown(&self, job: &str, reason: &str) -> Result<()> {
        tracing::warn!(job, reason, "migration job stopped unexpectedly");
        self.state
            .append_errors(&[format!("unexpected shutdown while running {job}: {reason}")])
    }
}
