use anyhow::Result;
use student_progress_core::{KeyValueStore, MigrationState, TaskQueue};

use crate::scheduler::MigrationJobScheduler;

pub const ALREADY_COMPLETED: &str =
    "Migration has already completed. Reset the migration state to run it again.";

/// Status lines shown to the operator.
#[must_use]
pub fn render_status(state: &MigrationState) -> Vec<String> {
    let status = if state.is_complete() {
        "Completed"
    } else if state.is_in_progress() {
        "In progress"
    } else {
        "Not started"
    };
    let mut lines = vec![format!("Status: {status}")];
    if !state.errors.is_empty() {
        lines.push(format!("Errors: {}", state.errors.join(", ")));
    }
    lines
}

/// Operator entry point. Idempotent: while a migration task is queued or claimed,
/// scheduling again enqueues nothing and names that task's job.
///
/// # Errors
/// Returns an error when durable state cannot be read or scheduling fails.
pub fn process<K, Q>(scheduler: &mut MigrationJobScheduler<K, Q>) -> Result<String>
where
    K: KeyValueStore,
    Q: TaskQueue,
{
    let state = scheduler.state()?;
    if state.is_complete() {
        return Ok(ALREADY_COMPLETED.to_string());
    }
    Ok(match (scheduler.schedule()?, state.is_in_progress()) {
        (Some(job), false) => format!("Migration scheduled, starting with {job}."),
        (Some(job), true) => format!("Migration is already in progress; {job} is queued."),
        (None, _) => "Nothing to migrate: every job is already complete.".to_string(),
    })
}
