//! HTTP-backed agent handle.
//!
//! Speaks the agent wire protocol: `POST {base}/run` with the step input
//! and call metadata, `GET {base}/health` for liveness. Every call goes
//! through the handle's own circuit breaker, so a persistently failing
//! agent fails fast instead of eating a timeout per step.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::{Agent, AgentError, Callable, HealthCheckable};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Construction parameters for an [`HttpAgent`].
#[derive(Debug, Clone)]
pub struct HttpAgentConfig {
    pub name: String,
    pub base_url: String,
    /// Per-call deadline for `POST /run`.
    pub timeout: Duration,
    /// Deadline for the health probe.
    pub health_timeout: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl HttpAgentConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout: DEFAULT_CALL_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Serialize)]
struct RunRequest<'a> {
    input: &'a Value,
    metadata: RunMetadata<'a>,
}

#[derive(Serialize)]
struct RunMetadata<'a> {
    agent: &'a str,
    time: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RunResponse {
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    should_retry: Option<bool>,
}

/// A remote agent reached over HTTP.
pub struct HttpAgent {
    name: String,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    health_timeout: Duration,
    breaker: CircuitBreaker,
}

impl HttpAgent {
    pub fn new(config: HttpAgentConfig) -> Self {
        Self {
            name: config.name,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
            timeout: config.timeout,
            health_timeout: config.health_timeout,
            breaker: CircuitBreaker::new(config.breaker),
        }
    }

    /// This handle's breaker, for metrics snapshots.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn run_once(&self, input: &Value) -> Result<Value, AgentError> {
        let body = RunRequest {
            input,
            metadata: RunMetadata {
                agent: &self.name,
                time: Utc::now(),
            },
        };

        let response = self
            .client
            .post(format!("{}/run", self.base_url))
            .timeout(self.timeout)
            .header("X-Agent-Name", &self.name)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Transport(format!(
                "agent returned status {status}"
            )));
        }

        let out: RunResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Transport(format!("decode response: {e}")))?;

        if let Some(message) = out.error.filter(|m| !m.is_empty()) {
            tracing::debug!(
                agent = %self.name,
                should_retry = ?out.should_retry,
                "agent reported an application error"
            );
            return Err(AgentError::Application(message));
        }

        Ok(out.output.unwrap_or(Value::Null))
    }
}

fn classify_transport(err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        AgentError::Timeout
    } else {
        AgentError::Transport(err.to_string())
    }
}

impl Agent for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_callable(&self) -> Option<&dyn Callable> {
        Some(self)
    }

    fn as_health_checkable(&self) -> Option<&dyn HealthCheckable> {
        Some(self)
    }
}

#[async_trait]
impl Callable for HttpAgent {
    async fn call(&self, input: &Value) -> Result<Value, AgentError> {
        self.breaker.call(|| self.run_once(input)).await
    }
}

#[async_trait]
impl HealthCheckable for HttpAgent {
    async fn health_check(&self) -> Result<(), AgentError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| AgentError::Unhealthy(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Unhealthy(format!(
                "health check returned status {status}"
            )));
        }
        Ok(())
    }
}
