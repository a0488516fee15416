//! Planner client: turns a goal into a step plan.
//!
//! The engine consumes plans as input; planning itself happens in a remote
//! service reached via `POST {base}/plan`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Request body for `POST /plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub task_id: Uuid,
    pub goal: String,
}

/// One step of a plan as the planner emits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub id: Uuid,
    pub agent: String,
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
}

/// Response body of `POST /plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    pub steps: Vec<PlannedStep>,
}

/// A service that can decompose a goal into steps.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse>;
}

const DEFAULT_PLAN_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP planner client.
pub struct HttpPlanner {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPlanner {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
            timeout: DEFAULT_PLAN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse> {
        let response = self
            .client
            .post(format!("{}/plan", self.base_url))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .context("planner request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("planner returned status {status}");
        }

        let plan: PlanResponse = response
            .json()
            .await
            .context("failed to decode planner response")?;

        Ok(plan)
    }
}
