//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, status, created_at).
pub async fn insert_task(pool: &PgPool, goal: &str) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>("INSERT INTO tasks (goal) VALUES ($1) RETURNING *")
        .bind(goal)
        .fetch_one(pool)
        .await
        .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Update the status of a task.
///
/// Monotonic: a task already in a terminal status is left untouched and the
/// call reports 0 rows affected. Callers that need to distinguish "already
/// terminal" from "missing" fetch the row afterwards.
pub async fn update_task_status(pool: &PgPool, id: Uuid, status: TaskStatus) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1 \
         WHERE id = $2 \
           AND status NOT IN ('completed', 'failed', 'canceled')",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task status")?;

    Ok(result.rows_affected())
}

/// List all tasks in `pending` or `running` status, oldest first.
///
/// The scheduler's tick loop uses this to enumerate work.
pub async fn list_active_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('pending', 'running') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active tasks")?;

    Ok(tasks)
}
