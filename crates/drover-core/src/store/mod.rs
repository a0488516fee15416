//! Storage contracts for tasks and steps.
//!
//! The step store is the single source of truth for execution state. A step
//! is only ever mutated through three paths: the atomic claim
//! ([`StepStore::acquire_ready_steps`]), the owning worker's write-back
//! ([`StepStore::update`]), or the cancellation / stale-lock sweep. Both
//! backends (Postgres and in-memory) honor the same contract.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use drover_db::models::{Step, Task, TaskStatus};

/// Storage failure kinds.
///
/// `Unavailable` is transient: the scheduler treats it as "nothing to do
/// this tick" and retries on the next one. It is never fatal to a task.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable")]
    Unavailable(#[source] anyhow::Error),
}

impl StoreError {
    pub(crate) fn unavailable(err: anyhow::Error) -> Self {
        Self::Unavailable(err)
    }
}

/// Durable state for a task's step DAG.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Atomic bulk insert of a task's steps; all-or-nothing.
    async fn create_many(&self, steps: &[Step]) -> Result<(), StoreError>;

    /// Snapshot read of every step of a task, with dependencies hydrated.
    async fn get_by_task(&self, task_id: Uuid) -> Result<Vec<Step>, StoreError>;

    /// Write through a mutated step on behalf of `owner` (the worker that
    /// claimed it).
    ///
    /// Implementations enforce terminal monotonicity (a `done`/`error`/
    /// `canceled` row is never overwritten) and lock ownership (the row
    /// must be unlocked or locked by `owner`). Returns `false` when the
    /// write was rejected by either guard.
    async fn update(&self, step: &Step, owner: &str) -> Result<bool, StoreError>;

    /// Atomically claim up to `limit` ready steps of a task.
    ///
    /// Ready means `waiting`, `next_run_at` null or past, and every
    /// dependency present with status `done`. Claimed steps transition to
    /// `in_progress` with `locked_by = worker_id` and `locked_at = now`.
    /// Safe under concurrent invocation: no step is handed to two workers.
    async fn acquire_ready_steps(
        &self,
        task_id: Uuid,
        limit: usize,
        worker_id: &str,
    ) -> Result<Vec<Step>, StoreError>;

    /// Transition every non-terminal step of a task to `canceled`.
    ///
    /// A step already claimed is forced to `canceled`; the running worker
    /// discovers it when its write-back is rejected. Returns the number of
    /// steps canceled.
    async fn cancel_by_task(&self, task_id: Uuid) -> Result<u64, StoreError>;

    /// Reset steps whose lock is older than `ttl` back to `waiting`,
    /// preserving the attempt counter. Returns the number released.
    async fn release_stale_locks(&self, ttl: Duration) -> Result<u64, StoreError>;
}

/// Durable task lifecycle state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task in `pending` status.
    async fn create(&self, goal: &str) -> Result<Task, StoreError>;

    /// Fetch a task by id.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Update a task's status. Monotonic: transitions out of a terminal
    /// status are silently ignored.
    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError>;

    /// List tasks in `pending` or `running` status.
    async fn list_active(&self) -> Result<Vec<Task>, StoreError>;
}
