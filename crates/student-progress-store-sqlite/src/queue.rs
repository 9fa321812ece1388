use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use student_progress_core::{AbandonedTask, QueuedTask, TaskQueue};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{parse_rfc3339, rfc3339, SqliteStore};

/// Persistent task queue over the `task_queue` table.
///
/// Task states move `pending -> claimed -> done | failed | abandoned`; pending tasks may
/// also be `cancelled`. At most one pending row exists per `(action, job_name)` and at
/// most one row per action is claimed at a time.
#[derive(Clone)]
pub struct SqliteTaskQueue {
    store: SqliteStore,
}

impl SqliteTaskQueue {
    pub(crate) fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

fn task_from_row(
    action: &str,
    task_id: String,
    job_name: String,
    enqueued_at: &str,
) -> Result<QueuedTask> {
    Ok(QueuedTask {
        task_id,
        action: action.to_string(),
        job_name,
        enqueued_at: parse_rfc3339(enqueued_at)?,
    })
}

/// Tasks of `action` in `state`, oldest first, with their claim timestamps.
fn tasks_in_state(
    conn: &Connection,
    action: &str,
    state: &str,
) -> Result<Vec<(QueuedTask, Option<String>)>> {
    let mut stmt = conn
        .prepare(
            "SELECT task_id, job_name, enqueued_at, claimed_at FROM task_queue
             WHERE action = ?1 AND state = ?2
             ORDER BY seq ASC",
        )
        .context("failed to prepare task queue query")?;
    let rows = stmt.query_map(params![action, state], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut tasks = Vec::new();
    for row in rows {
        let (task_id, job_name, enqueued_at, claimed_at) = row?;
        tasks.push((task_from_row(action, task_id, job_name, &enqueued_at)?, claimed_at));
    }
    Ok(tasks)
}

fn finish_task(conn: &Connection, task_id: &str, state: &str, error: Option<&str>) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    let changed = conn
        .execute(
            "UPDATE task_queue SET state = ?1, finished_at = ?2, last_error = ?3
             WHERE task_id = ?4 AND state = 'claimed'",
            params![state, now, error, task_id],
        )
        .with_context(|| format!("failed to mark task {task_id} as {state}"))?;
    if changed == 0 {
        return Err(anyhow!("task {task_id} is not claimed"));
    }
    Ok(())
}

impl TaskQueue for SqliteTaskQueue {
    fn enqueue(&self, action: &str, job_name: &str) -> Result<QueuedTask> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start enqueue transaction")?;
            let existing = tx
                .query_row(
                    "SELECT task_id, enqueued_at FROM task_queue
                     WHERE action = ?1 AND job_name = ?2 AND state = 'pending'",
                    params![action, job_name],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .context("failed to look up pending task")?;
            if let Some((task_id, enqueued_at)) = existing {
                tracing::debug!(action, job_name, task_id = %task_id, "task already pending");
                return task_from_row(action, task_id, job_name.to_string(), &enqueued_at);
            }

            let task_id = Ulid::new().to_string();
            let enqueued_at = OffsetDateTime::now_utc();
            tx.execute(
                "INSERT INTO task_queue(task_id, action, job_name, state, enqueued_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![task_id, action, job_name, rfc3339(enqueued_at)?],
            )
            .context("failed to enqueue task")?;
            tx.commit().context("failed to commit enqueue")?;

            tracing::debug!(action, job_name, task_id = %task_id, "task enqueued");
            Ok(QueuedTask {
                task_id,
                action: action.to_string(),
                job_name: job_name.to_string(),
                enqueued_at,
            })
        })
    }

    fn claim_next(&self, action: &str) -> Result<Option<QueuedTask>> {
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start claim transaction")?;
            if !tasks_in_state(&tx, action, "claimed")?.is_empty() {
                return Ok(None);
            }
            let Some((task, _)) = tasks_in_state(&tx, action, "pending")?.into_iter().next() else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE task_queue SET state = 'claimed', claimed_at = ?1 WHERE task_id = ?2",
                params![rfc3339(OffsetDateTime::now_utc())?, task.task_id],
            )
            .context("failed to claim task")?;
            tx.commit().context("failed to commit claim")?;
            Ok(Some(task))
        })
    }

    fn complete(&self, task_id: &str) -> Result<()> {
        self.store.with_conn(|conn| finish_task(conn, task_id, "done", None))
    }

    fn fail(&self, task_id: &str, reason: &str) -> Result<()> {
        self.store.with_conn(|conn| finish_task(conn, task_id, "failed", Some(reason)))
    }

    fn recover_abandoned(&self, action: &str, lease: Duration) -> Result<Vec<AbandonedTask>> {
        let lease_limit =
            time::Duration::try_from(lease).context("lease timeout is out of range")?;
        self.store.with_conn(|conn| {
            let tx = conn.transaction().context("failed to start recovery transaction")?;
            let now = OffsetDateTime::now_utc();
            let mut abandoned = Vec::new();

            for (task, claimed_at) in tasks_in_state(&tx, action, "claimed")? {
                let claimed_at = match claimed_at.as_deref() {
                    Some(text) => parse_rfc3339(text)?,
                    None => task.enqueued_at,
                };
                if now - claimed_at < lease_limit {
                    continue;
                }
                let reason = format!(
                    "claimed at {} and not finished within {}s",
                    rfc3339(claimed_at)?,
                    lease.as_secs()
                );
                finish_task(&tx, &task.task_id, "abandoned", Some(&reason))?;
                tracing::warn!(
                    action,
                    job_name = %task.job_name,
                    task_id = %task.task_id,
                    "recovered abandoned task"
                );
                abandoned.push(AbandonedTask { task, reason });
            }

            tx.commit().context("failed to commit recovery")?;
            Ok(abandoned)
        })
    }

    fn pending(&self, action: &str) -> Result<Vec<QueuedTask>> {
        self.store.with_conn(|conn| {
            Ok(tasks_in_state(conn, action, "pending")?.into_iter().map(|(task, _)| task).collect())
        })
    }

    fn active(&self, action: &str) -> Result<Vec<QueuedTask>> {
        self.store.with_conn(|conn| {
            let mut tasks = tasks_in_state(conn, action, "claimed")?;
            tasks.extend(tasks_in_state(conn, action, "pending")?);
            Ok(tasks.into_iter().map(|(task, _)| task).collect())
        })
    }

    fn cancel_pending(&self, action: &str) -> Result<usize> {
        self.store.with_conn(|conn| {
            let now = rfc3339(OffsetDateTime::now_utc())?;
            conn.execute(
                "UPDATE task_queue SET state = 'cancelled', finished_at = ?1
                 WHERE action = ?2 AND state = 'pending'",
                params![now, action],
            )
            .context("failed to cancel pending tasks")
        })
    }
}
