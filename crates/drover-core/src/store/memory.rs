//! In-memory stores.
//!
//! A single exclusive lock around the candidate scan and mutation gives the
//! same atomic-claim semantics the Postgres backend gets from
//! `FOR UPDATE SKIP LOCKED`. Used by the engine test suites and for
//! single-process deployments without a database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use drover_db::models::{Step, StepStatus, Task, TaskStatus};

use super::{StepStore, StoreError, TaskStore};

/// Step store backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemStepStore {
    steps: Mutex<HashMap<Uuid, Step>>,
}

impl MemStepStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepStore for MemStepStore {
    async fn create_many(&self, steps: &[Step]) -> Result<(), StoreError> {
        let mut guard = self.steps.lock().await;
        // All-or-nothing: reject the whole batch on an id collision.
        for step in steps {
            if guard.contains_key(&step.id) {
                return Err(StoreError::unavailable(anyhow::anyhow!(
                    "step {} already exists",
                    step.id
                )));
            }
        }
        for step in steps {
            guard.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn get_by_task(&self, task_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let guard = self.steps.lock().await;
        let mut steps: Vec<Step> = guard
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| (s.created_at, s.id));
        Ok(steps)
    }

    async fn update(&self, step: &Step, owner: &str) -> Result<bool, StoreError> {
        let mut guard = self.steps.lock().await;
        let Some(current) = guard.get(&step.id) else {
            return Ok(false);
        };
        // Terminal monotonicity: a finished step never changes again.
        if current.status.is_terminal() {
            return Ok(false);
        }
        // Lock ownership: only the claiming worker may write back.
        if let Some(holder) = current.locked_by.as_deref() {
            if holder != owner {
                return Ok(false);
            }
        }
        let mut updated = step.clone();
        updated.updated_at = Utc::now();
        guard.insert(step.id, updated);
        Ok(true)
    }

    async fn acquire_ready_steps(
        &self,
        task_id: Uuid,
        limit: usize,
        worker_id: &str,
    ) -> Result<Vec<Step>, StoreError> {
        let now = Utc::now();
        let mut guard = self.steps.lock().await;

        let by_id: HashMap<Uuid, StepStatus> = guard
            .values()
            .filter(|s| s.task_id == task_id)
            .map(|s| (s.id, s.status))
            .collect();

        let mut candidates: Vec<Uuid> = guard
            .values()
            .filter(|s| {
                s.task_id == task_id
                    && s.status == StepStatus::Waiting
                    && s.next_run_at.is_none_or(|at| at <= now)
                    && s.depends_on
                        .iter()
                        .all(|dep| by_id.get(dep) == Some(&StepStatus::Done))
            })
            .map(|s| s.id)
            .collect();
        candidates.sort_by_key(|id| {
            let s = &guard[id];
            (s.created_at, s.id)
        });
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(step) = guard.get_mut(&id) {
                step.status = StepStatus::InProgress;
                step.locked_by = Some(worker_id.to_owned());
                step.locked_at = Some(now);
                step.started_at.get_or_insert(now);
                step.updated_at = now;
                claimed.push(step.clone());
            }
        }
        Ok(claimed)
    }

    async fn cancel_by_task(&self, task_id: Uuid) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut guard = self.steps.lock().await;
        let mut canceled = 0;
        for step in guard.values_mut() {
            if step.task_id != task_id || step.status.is_terminal() {
                continue;
            }
            step.status = StepStatus::Canceled;
            step.locked_at = None;
            step.locked_by = None;
            step.next_run_at = None;
            step.finished_at = Some(now);
            step.updated_at = now;
            canceled += 1;
        }
        Ok(canceled)
    }

    async fn release_stale_locks(&self, ttl: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut guard = self.steps.lock().await;
        let mut released = 0;
        for step in guard.values_mut() {
            let expired = step.status == StepStatus::InProgress
                && step.locked_at.is_some_and(|at| at < cutoff);
            if expired {
                step.status = StepStatus::Waiting;
                step.locked_at = None;
                step.locked_by = None;
                step.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }
}

/// Task store backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemTaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl MemTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemTaskStore {
    async fn create(&self, goal: &str) -> Result<Task, StoreError> {
        let task = Task {
            id: Uuid::new_v4(),
            goal: goal.to_owned(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        };
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn update_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let mut guard = self.tasks.lock().await;
        if let Some(task) = guard.get_mut(&id) {
            if !task.status.is_terminal() {
                task.status = status;
            }
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Task>, StoreError> {
        let guard = self.tasks.lock().await;
        let mut tasks: Vec<Task> = guard
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }
}
