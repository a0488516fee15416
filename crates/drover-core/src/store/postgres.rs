//! Postgres-backed stores, thin wrappers over the `drover-db` query
//! functions. Every sqlx failure maps to [`StoreError::Unavailable`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{Step, Task, TaskStatus};
use drover_db::queries::{steps as step_db, tasks as task_db};

use super::{StepStore, StoreError, TaskStore};

/// Step store over the `steps` / `step_dependencies` tables.
///
/// The claim query uses `FOR UPDATE SKIP LOCKED`, so concurrent workers
/// (in this process or another) never receive the same step.
#[derive(Clone)]
pub struct PgStepStore {
    pool: PgPool,
}

impl PgStepStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StepStore for PgStepStore {
    async fn create_many(&self, steps: &[Step]) -> Result<(), StoreError> {
        step_db::insert_steps(&self.pool, steps)
            .await
            .map_err(StoreError::unavailable)
    }

    async fn get_by_task(&self, task_id: Uuid) -> Result<Vec<Step>, StoreError> {
        step_db::get_steps_for_task(&self.pool, task_id)
            .await
            .map_err(StoreError::unavailable)
    }

    async fn update(&self, step: &Step, owner: &str) -> Result<bool, StoreError> {
        step_db::update_step(&self.pool, step, owner)
            .await
            .map_err(StoreError::unavailable)
    }

    async fn acquire_ready_steps(
        &self,
        task_id: Uuid,
        limit: usize,
        worker_id: &str,
    ) -> Result<Vec<Step>, StoreError> {
        step_db::acquire_ready_steps(&self.pool, task_id, limit as i64, worker_id)
            .await
            .map_err(StoreError::unavailable)
    }

    async fn cancel_by_task(&self, task_id: Uuid) -> Result<u64, StoreError> {
        step_db::cancel_steps_for_task(&self.pool, task_id)
            .await
            .map_err(StoreError::unavailable)
    }

    async fn release_stale_locks(&self, ttl: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        step_db::release_stale_locks(&self.pool, cutoff)
            .await
            .map_err(StoreError::unavailable)
    }
}

/// Task store over the `tasks` table.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, goal: &str) -> Result<Task, StoreError> {
        task_db::insert_task(&self.pool, goal)
            .await
            .map_err(StoreError::unavailable)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        task_db::get_task(&self.pool, id)
            .await
            .map_err(StoreError::unavailable)
    }

    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        // 0 rows means the task is already terminal (or missing); the
        // monotonicity contract treats both as a no-op.
        task_db::update_task_status(&self.pool, id, status)
            .await
            .map(|_| ())
            .map_err(StoreError::unavailable)
    }

    async fn list_active(&self) -> Result<Vec<Task>, StoreError> {
        task_db::list_active_tasks(&self.pool)
            .await
            .map_err(StoreError::unavailable)
    }
}
