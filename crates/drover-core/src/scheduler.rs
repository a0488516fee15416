//! DAG scheduler: claims ready steps and feeds them to a fixed worker pool.
//!
//! Two loops share a bounded dispatch channel. The tick loop enumerates
//! active tasks and atomically claims ready steps; the worker pool drains
//! the channel into the step runner. A separate synchronous per-task path
//! ([`Scheduler::schedule`]) gives the engine a deterministic progress
//! pulse without depending on the global tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_db::models::Step;

use crate::runner::StepRunner;
use crate::store::{StepStore, TaskStore};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the worker pool and the per-claim batch limit.
    pub max_parallel: usize,
    /// Cadence of the background tick loop.
    pub tick_interval: Duration,
    /// Identity stamped into `locked_by` for every claim this process makes.
    pub worker_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            tick_interval: Duration::from_millis(500),
            worker_id: format!("drover-{}", Uuid::new_v4().simple()),
        }
    }
}

/// Claims ready steps and drives them through the runner.
pub struct Scheduler {
    tasks: Arc<dyn TaskStore>,
    steps: Arc<dyn StepStore>,
    runner: Arc<StepRunner>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        steps: Arc<dyn StepStore>,
        runner: Arc<StepRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            tasks,
            steps,
            runner,
            config,
        }
    }

    /// The identity this scheduler claims steps under.
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Spawn the background tick loop and worker pool. Runs until the
    /// token is cancelled.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(cancel).await })
    }

    /// The background loop body: tick, claim, dispatch.
    pub async fn run(&self, cancel: CancellationToken) {
        let (tx, rx) = mpsc::channel::<Step>(self.config.max_parallel * 2);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker_index in 0..self.config.max_parallel {
            let rx = Arc::clone(&rx);
            let runner = Arc::clone(&self.runner);
            let cancel = cancel.clone();
            let worker_id = self.config.worker_id.clone();
            workers.spawn(async move {
                loop {
                    let step = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            step = guard.recv() => step,
                        }
                    };
                    let Some(step) = step else { break };
                    if let Err(err) = runner.run(step, &worker_id).await {
                        tracing::warn!(worker = worker_index, error = %err, "step write-back failed");
                    }
                }
            });
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let active = match self.tasks.list_active().await {
                Ok(tasks) => tasks,
                Err(err) => {
                    // Transient storage failure: nothing to do this tick.
                    tracing::warn!(error = %err, "could not list active tasks, skipping tick");
                    continue;
                }
            };

            for task in active {
                let claimed = match self
                    .steps
                    .acquire_ready_steps(task.id, self.config.max_parallel, &self.config.worker_id)
                    .await
                {
                    Ok(steps) => steps,
                    Err(err) => {
                        tracing::warn!(task_id = %task.id, error = %err, "claim failed, skipping task this tick");
                        continue;
                    }
                };

                for step in claimed {
                    // Non-blocking push: a full channel means the pool is
                    // saturated. The step stays claimed by this worker; the
                    // lock-TTL sweeper returns it to the pool if we never
                    // get to it.
                    if let Err(mpsc::error::TrySendError::Full(step)) = tx.try_send(step) {
                        tracing::debug!(
                            step_id = %step.id,
                            "dispatch channel full, step held until a later tick"
                        );
                    }
                }
            }
        }

        drop(tx);
        while workers.join_next().await.is_some() {}
        tracing::info!("scheduler stopped");
    }

    /// Synchronous per-task pulse: claim up to `max_parallel` ready steps
    /// of one task, run them all, and wait for completion.
    ///
    /// Used by the engine's task loop. Bounded by an internal semaphore so
    /// a wide DAG level cannot exceed the concurrency budget.
    pub async fn schedule(&self, task_id: Uuid) -> Result<()> {
        let claimed = self
            .steps
            .acquire_ready_steps(task_id, self.config.max_parallel, &self.config.worker_id)
            .await?;

        if claimed.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut dispatched = JoinSet::new();

        for step in claimed {
            let permit = semaphore.clone().acquire_owned().await?;
            let runner = Arc::clone(&self.runner);
            let worker_id = self.config.worker_id.clone();
            dispatched.spawn(async move {
                let result = runner.run(step, &worker_id).await;
                drop(permit);
                result
            });
        }

        while let Some(joined) = dispatched.join_next().await {
            joined??;
        }
        Ok(())
    }
}
