//! Database query functions for the `steps` and `step_dependencies` tables.
//!
//! Everything that mutates a claimed step goes through [`update_step`],
//! which enforces the ownership and terminal-state guards. The claim itself
//! is [`acquire_ready_steps`], a `FOR UPDATE SKIP LOCKED` select-then-update
//! that is safe under concurrent workers.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::models::{Step, StepDependency};

/// Bulk-insert a task's steps and their dependency edges in one
/// transaction. All-or-nothing: any failure rolls the whole batch back.
pub async fn insert_steps(pool: &PgPool, steps: &[Step]) -> Result<()> {
    if steps.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO steps (id, task_id, agent, input, status, attempt, max_attempts, timeout_seconds, created_at, updated_at) ",
    );
    builder.push_values(steps, |mut b, step| {
        b.push_bind(step.id)
            .push_bind(step.task_id)
            .push_bind(step.agent.as_str())
            .push_bind(&step.input)
            .push_bind(step.status)
            .push_bind(step.attempt)
            .push_bind(step.max_attempts)
            .push_bind(step.timeout_seconds)
            .push_bind(step.created_at)
            .push_bind(step.updated_at);
    });
    builder
        .build()
        .execute(&mut *tx)
        .await
        .context("failed to insert steps")?;

    let edges: Vec<(Uuid, Uuid)> = steps
        .iter()
        .flat_map(|s| s.depends_on.iter().map(|dep| (s.id, *dep)))
        .collect();

    if !edges.is_empty() {
        let mut dep_builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO step_dependencies (step_id, depends_on) ");
        dep_builder.push_values(&edges, |mut b, (step_id, depends_on)| {
            b.push_bind(step_id).push_bind(depends_on);
        });
        dep_builder
            .build()
            .execute(&mut *tx)
            .await
            .context("failed to insert step dependencies")?;
    }

    tx.commit().await.context("failed to commit step batch")?;
    Ok(())
}

/// Fetch all steps of a task with their dependency sets hydrated,
/// ordered by creation time.
pub async fn get_steps_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Step>> {
    let mut steps = sqlx::query_as::<_, Step>(
        "SELECT * FROM steps WHERE task_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch steps for task")?;

    hydrate_dependencies(pool, task_id, &mut steps).await?;
    Ok(steps)
}

/// Write through a mutated step.
///
/// Two guards, both enforced in the WHERE clause:
/// - terminal monotonicity: a step already in `done`, `error`, or
///   `canceled` is never overwritten;
/// - lock ownership: the row must be unlocked or locked by `owner`.
///
/// Returns `true` if the write was applied. `false` means the step was
/// concurrently canceled, swept, or claimed by another worker; the caller's
/// result is discarded by design.
pub async fn update_step(pool: &PgPool, step: &Step, owner: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE steps \
         SET status = $2, \
             output = $3, \
             attempt = $4, \
             last_error = $5, \
             next_run_at = $6, \
             locked_at = $7, \
             locked_by = $8, \
             started_at = $9, \
             finished_at = $10, \
             updated_at = NOW() \
         WHERE id = $1 \
           AND status NOT IN ('done', 'error', 'canceled') \
           AND (locked_by IS NULL OR locked_by = $11)",
    )
    .bind(step.id)
    .bind(step.status)
    .bind(&step.output)
    .bind(step.attempt)
    .bind(step.last_error.as_deref())
    .bind(step.next_run_at)
    .bind(step.locked_at)
    .bind(step.locked_by.as_deref())
    .bind(step.started_at)
    .bind(step.finished_at)
    .bind(owner)
    .execute(pool)
    .await
    .context("failed to update step")?;

    Ok(result.rows_affected() > 0)
}

/// Atomically claim up to `limit` ready steps of a task for `worker_id`.
///
/// A step is ready when it is `waiting`, its `next_run_at` is null or past,
/// and every dependency edge points at an existing `done` step. Claimed
/// rows transition to `in_progress` with the lock fields set. Candidates
/// are ordered by `created_at` (FIFO within the task); ties resolve
/// arbitrarily.
///
/// `FOR UPDATE SKIP LOCKED` makes concurrent invocations from racing
/// workers safe: each candidate row is handed to exactly one claimant.
pub async fn acquire_ready_steps(
    pool: &PgPool,
    task_id: Uuid,
    limit: i64,
    worker_id: &str,
) -> Result<Vec<Step>> {
    let mut claimed = sqlx::query_as::<_, Step>(
        "WITH ready AS ( \
             SELECT s.id \
             FROM steps s \
             WHERE s.task_id = $1 \
               AND s.status = 'waiting' \
               AND (s.next_run_at IS NULL OR s.next_run_at <= NOW()) \
               AND NOT EXISTS ( \
                   SELECT 1 \
                   FROM step_dependencies sd \
                   LEFT JOIN steps dep ON dep.id = sd.depends_on \
                   WHERE sd.step_id = s.id \
                     AND (dep.id IS NULL OR dep.status != 'done') \
               ) \
             ORDER BY s.created_at ASC \
             LIMIT $2 \
             FOR UPDATE OF s SKIP LOCKED \
         ) \
         UPDATE steps \
         SET status = 'in_progress', \
             locked_by = $3, \
             locked_at = NOW(), \
             started_at = COALESCE(steps.started_at, NOW()), \
             updated_at = NOW() \
         FROM ready \
         WHERE steps.id = ready.id \
         RETURNING steps.*",
    )
    .bind(task_id)
    .bind(limit)
    .bind(worker_id)
    .fetch_all(pool)
    .await
    .context("failed to acquire ready steps")?;

    hydrate_dependencies(pool, task_id, &mut claimed).await?;
    Ok(claimed)
}

/// Transition every non-terminal step of a task to `canceled`.
///
/// Steps already `done`, `error`, or `canceled` are untouched. A step that
/// is `in_progress` is forced to `canceled` with its lock cleared; the
/// running worker discovers this when its write-back is rejected by
/// [`update_step`]'s terminal guard. Returns the number of steps canceled.
pub async fn cancel_steps_for_task(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE steps \
         SET status = 'canceled', \
             locked_at = NULL, \
             locked_by = NULL, \
             next_run_at = NULL, \
             finished_at = NOW(), \
             updated_at = NOW() \
         WHERE task_id = $1 \
           AND status NOT IN ('done', 'error', 'canceled')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to cancel steps for task")?;

    Ok(result.rows_affected())
}

/// Reset steps whose lock has expired back to `waiting`.
///
/// A step `in_progress` with `locked_at` older than `cutoff` was claimed by
/// a worker that died or stalled. The reset clears the lock and preserves
/// the attempt counter so retry accounting survives the crash. Returns the
/// number of steps released.
pub async fn release_stale_locks(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE steps \
         SET status = 'waiting', \
             locked_at = NULL, \
             locked_by = NULL, \
             updated_at = NOW() \
         WHERE status = 'in_progress' \
           AND locked_at < $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to release stale locks")?;

    Ok(result.rows_affected())
}

/// Fill in the `depends_on` sets for a batch of same-task steps.
async fn hydrate_dependencies(pool: &PgPool, task_id: Uuid, steps: &mut [Step]) -> Result<()> {
    if steps.is_empty() {
        return Ok(());
    }

    let edges: Vec<StepDependency> = sqlx::query_as(
        "SELECT sd.step_id, sd.depends_on \
         FROM step_dependencies sd \
         JOIN steps s ON s.id = sd.step_id \
         WHERE s.task_id = $1",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch step dependencies")?;

    let mut by_step: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for edge in edges {
        by_step.entry(edge.step_id).or_default().push(edge.depends_on);
    }

    for step in steps {
        step.depends_on = by_step.remove(&step.id).unwrap_or_default();
    }

    Ok(())
}
