use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use student_progress_core::{KeyValueStore, TaskQueue, MIGRATION_JOB_ACTION};

use crate::scheduler::{JobOutcome, MigrationJobScheduler};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DrainSummary {
    pub tasks_run: usize,
    pub recovered: Vec<String>,
    pub migration_complete: bool,
    pub outcomes: Vec<JobOutcome>,
}

/// Queue consumer for scheduler work units.
///
/// Each drain first turns tasks whose claim outlived the lease into crash errors and
/// puts them back on the queue, then runs pending tasks one at a time.
#[derive(Debug, Clone, Copy)]
pub struct MigrationWorker {
    lease: Duration,
}

impl MigrationWorker {
    #[must_use]
    pub fn new(lease: Duration) -> Self {
        Self { lease }
    }

    /// Run up to `max_tasks` queued jobs.
    ///
    /// # Errors
    /// Returns an error when the queue or durable state cannot be accessed, or when a
    /// claimed task names a job the scheduler does not know. The failing task is marked
    /// failed before the error is returned.
    pub fn drain<K, Q>(
        &self,
        scheduler: &mut MigrationJobScheduler<K, Q>,
        max_tasks: usize,
    ) -> Result<DrainSummary>
    where
        K: KeyValueStore,
        Q: TaskQueue,
    {
        let mut summary = DrainSummary::default();

        for abandoned in scheduler.queue().recover_abandoned(MIGRATION_JOB_ACTION, self.lease)? {
            let job = abandoned.task.job_name;
            scheduler.handle_unexpected_shutdown(&job, &abandoned.reason)?;
            scheduler.queue().enqueue(MIGRATION_JOB_ACTION, &job)?;
            summary.recovered.push(job);
        }

        while summary.tasks_run < max_tasks {
            let Some(task) = scheduler.queue().claim_next(MIGRATION_JOB_ACTION)? else {
                break;
            };
            match scheduler.run_job(&task.job_name) {
                Ok(outcome) => {
                    scheduler.queue().complete(&task.task_id)?;
                    summary.tasks_run += 1;
                    summary.outcomes.push(outcome);
                }
                Err(err) => {
                    scheduler.queue().fail(&task.task_id, &format!("{err:#}"))?;
                    return Err(err)
                        .with_context(|| format!("migration task {} failed", task.task_id));
                }
            }
        }

        summary.migration_complete = scheduler.is_complete()?;
        tracing::info!(
            tasks_run = summary.tasks_run,
            recovered = summary.recovered.len(),
            migration_complete = summary.migration_complete,
            "worker drain finished"
        );
        Ok(summary)
    }
}
