//! Execution engine: plan ingestion, the per-task loop, and cancellation.
//!
//! The engine holds the scheduler; the scheduler knows nothing about the
//! engine. Task completion is detected by polling step states, not by
//! callback.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_db::models::{Step, StepStatus, Task, TaskStatus};

use crate::planner::{PlanRequest, PlannedStep, Planner};
use crate::scheduler::Scheduler;
use crate::store::{StepStore, TaskStore};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempt budget stamped onto every materialized step.
    pub max_attempts: i32,
    /// Per-step agent call deadline, in seconds.
    pub step_timeout_secs: i32,
    /// Cadence of the per-task progress loop.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step_timeout_secs: 30,
            poll_interval: Duration::from_millis(300),
        }
    }
}

/// A structurally invalid plan. Fatal to task creation; nothing is
/// persisted for the task's steps.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,
    #[error("duplicate step id {0}")]
    DuplicateId(Uuid),
    #[error("step {0} depends on itself")]
    SelfDependency(Uuid),
    #[error("step {0} depends on unknown step {1}")]
    UnknownDependency(Uuid, Uuid),
}

/// Drives tasks from goal to terminal status.
pub struct Engine {
    planner: Arc<dyn Planner>,
    tasks: Arc<dyn TaskStore>,
    steps: Arc<dyn StepStore>,
    scheduler: Arc<Scheduler>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        planner: Arc<dyn Planner>,
        tasks: Arc<dyn TaskStore>,
        steps: Arc<dyn StepStore>,
        scheduler: Arc<Scheduler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            planner,
            tasks,
            steps,
            scheduler,
            config,
        }
    }

    /// Plan the task's goal and materialize the resulting steps.
    ///
    /// The plan is validated before anything is written: it must be
    /// non-empty, step ids must be unique, and every dependency must
    /// reference a sibling step.
    pub async fn init_task_execution(&self, task: &Task) -> Result<()> {
        let plan = self
            .planner
            .plan(&PlanRequest {
                task_id: task.id,
                goal: task.goal.clone(),
            })
            .await
            .with_context(|| format!("planning failed for task {}", task.id))?;

        validate_plan(&plan.steps)?;

        let steps = self.map_planned_steps(task.id, &plan.steps);
        self.steps
            .create_many(&steps)
            .await
            .with_context(|| format!("failed to materialize steps for task {}", task.id))?;

        tracing::info!(
            task_id = %task.id,
            steps = steps.len(),
            "task plan materialized"
        );
        Ok(())
    }

    /// Drive one task until it reaches a terminal status or the token is
    /// cancelled.
    ///
    /// Each pulse claims and runs the task's ready steps synchronously,
    /// then reconciles task status from the step states: any `error` step
    /// fails the task; no active steps left completes it.
    pub async fn run_task_loop(&self, task_id: Uuid, cancel: CancellationToken) -> Result<()> {
        self.tasks
            .update_status(task_id, TaskStatus::Running)
            .await?;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.scheduler.schedule(task_id).await {
                let _ = self.tasks.update_status(task_id, TaskStatus::Failed).await;
                return Err(err.context(format!("scheduling failed for task {task_id}")));
            }

            let steps = self.steps.get_by_task(task_id).await?;
            let has_active = steps
                .iter()
                .any(|s| matches!(s.status, StepStatus::Waiting | StepStatus::InProgress));
            let has_error = steps.iter().any(|s| s.status == StepStatus::Error);

            if has_error {
                self.tasks
                    .update_status(task_id, TaskStatus::Failed)
                    .await?;
                tracing::warn!(task_id = %task_id, "task failed");
                return Ok(());
            }

            if !has_active {
                // Monotonic update: if the task was canceled meanwhile,
                // this is a no-op and the canceled status stands.
                self.tasks
                    .update_status(task_id, TaskStatus::Completed)
                    .await?;
                let status = self.tasks.get_by_id(task_id).await?.map(|t| t.status);
                tracing::info!(task_id = %task_id, status = ?status, "task finished");
                return Ok(());
            }
        }
    }

    /// Cancel a task: steps first, then the task row.
    ///
    /// The order matters. Once every step is terminal `canceled`, a claim
    /// racing with the cancel cannot make progress, and a running worker's
    /// write-back loses to the terminal state.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<()> {
        let canceled = self.steps.cancel_by_task(task_id).await?;
        self.tasks
            .update_status(task_id, TaskStatus::Canceled)
            .await?;
        tracing::info!(task_id = %task_id, steps_canceled = canceled, "task canceled");
        Ok(())
    }

    fn map_planned_steps(&self, task_id: Uuid, planned: &[PlannedStep]) -> Vec<Step> {
        let now = Utc::now();
        planned
            .iter()
            .map(|p| Step {
                id: p.id,
                task_id,
                agent: p.agent.clone(),
                input: p.input.clone(),
                output: None,
                status: StepStatus::Waiting,
                attempt: 0,
                max_attempts: self.config.max_attempts,
                last_error: None,
                next_run_at: None,
                locked_at: None,
                locked_by: None,
                timeout_seconds: self.config.step_timeout_secs,
                depends_on: p.depends_on.clone(),
                created_at: now,
                updated_at: now,
                started_at: None,
                finished_at: None,
            })
            .collect()
    }
}

/// Structural validation of a plan: non-empty, unique ids, no self-loops,
/// no dangling dependency references.
pub fn validate_plan(steps: &[PlannedStep]) -> Result<(), PlanError> {
    if steps.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut ids = HashSet::with_capacity(steps.len());
    for step in steps {
        if !ids.insert(step.id) {
            return Err(PlanError::DuplicateId(step.id));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if *dep == step.id {
                return Err(PlanError::SelfDependency(step.id));
            }
            if !ids.contains(dep) {
                return Err(PlanError::UnknownDependency(step.id, *dep));
            }
        }
    }

    Ok(())
}
