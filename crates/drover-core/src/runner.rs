//! Step runner: executes one claimed step and translates the outcome into
//! the step's next state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use drover_db::models::{Step, StepStatus};

use crate::agent::router::AgentRouter;
use crate::agent::AgentError;
use crate::retry::BackoffStrategy;
use crate::store::{StepStore, StoreError};

/// Runs claimed steps against the agent routing layer.
///
/// The runner never propagates agent failures upward: every outcome is
/// translated into step state and written through the store. Only storage
/// failures surface to the caller.
pub struct StepRunner {
    steps: Arc<dyn StepStore>,
    router: Arc<AgentRouter>,
    backoff: Arc<dyn BackoffStrategy>,
}

impl StepRunner {
    pub fn new(
        steps: Arc<dyn StepStore>,
        router: Arc<AgentRouter>,
        backoff: Arc<dyn BackoffStrategy>,
    ) -> Self {
        Self {
            steps,
            router,
            backoff,
        }
    }

    /// Execute a step the caller has claimed (`locked_by = worker_id`).
    ///
    /// The agent call runs under the step's own deadline. `attempt` counts
    /// started attempts, so it advances up front. On success the step
    /// becomes `done`; on failure it either goes back to `waiting` with a
    /// backoff-stamped `next_run_at` or, once attempts are exhausted (or
    /// the failure is a configuration fault), to `error`.
    pub async fn run(&self, mut step: Step, worker_id: &str) -> Result<(), StoreError> {
        step.attempt += 1;
        tracing::debug!(
            step_id = %step.id,
            agent = %step.agent,
            attempt = step.attempt,
            "running step"
        );

        let call = self.router.call(&step.agent, &step.input);
        let outcome = if step.timeout_seconds > 0 {
            let deadline = Duration::from_secs(step.timeout_seconds as u64);
            match tokio::time::timeout(deadline, call).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout),
            }
        } else {
            call.await
        };

        let now = Utc::now();
        match outcome {
            Ok(output) => {
                step.status = StepStatus::Done;
                step.output = Some(output);
                step.last_error = None;
                step.next_run_at = None;
                step.finished_at = Some(now);
                step.locked_at = None;
                step.locked_by = None;

                let applied = self.steps.update(&step, worker_id).await?;
                if applied {
                    tracing::info!(step_id = %step.id, agent = %step.agent, "step done");
                } else {
                    // Canceled or swept while the call was in flight; the
                    // terminal row wins and the output is discarded.
                    tracing::info!(step_id = %step.id, "step finished but write-back was rejected");
                }
                Ok(())
            }
            Err(err) => {
                step.last_error = Some(err.to_string());
                step.locked_at = None;
                step.locked_by = None;

                let exhausted = step.attempt >= step.max_attempts;
                if exhausted || !err.is_retryable() {
                    step.status = StepStatus::Error;
                    step.next_run_at = None;
                    step.finished_at = Some(now);
                    tracing::warn!(
                        step_id = %step.id,
                        agent = %step.agent,
                        attempt = step.attempt,
                        error = %err,
                        "step failed permanently"
                    );
                } else {
                    let delay = self.backoff.next_delay(step.attempt as u32);
                    step.status = StepStatus::Waiting;
                    step.next_run_at = Some(
                        now + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                    tracing::info!(
                        step_id = %step.id,
                        agent = %step.agent,
                        attempt = step.attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "step failed, scheduling retry"
                    );
                }

                let applied = self.steps.update(&step, worker_id).await?;
                if !applied {
                    tracing::debug!(step_id = %step.id, "failure write-back rejected, step already terminal");
                }
                Ok(())
            }
        }
    }
}
