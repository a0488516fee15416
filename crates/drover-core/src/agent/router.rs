//! Agent router: resolve a name to a handle and invoke it.

use std::sync::Arc;

use serde_json::Value;

use super::registry::AgentRegistry;
use super::AgentError;

/// Resolves agent names through the registry and dispatches calls.
pub struct AgentRouter {
    registry: Arc<AgentRegistry>,
}

impl AgentRouter {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Invoke the named agent with a step input.
    ///
    /// Fails with [`AgentError::NotFound`] for unknown names and
    /// [`AgentError::NotCallable`] for handles without the invocation
    /// capability; both are configuration faults, not retryable.
    pub async fn call(&self, agent_name: &str, input: &Value) -> Result<Value, AgentError> {
        let agent = self
            .registry
            .get(agent_name)
            .ok_or_else(|| AgentError::NotFound(agent_name.to_owned()))?;

        let callable = agent
            .as_callable()
            .ok_or_else(|| AgentError::NotCallable(agent_name.to_owned()))?;

        callable.call(input).await
    }

    /// Like [`Self::call`], but probes the agent's health first and refuses
    /// to dispatch when the probe fails. Handles without the health
    /// capability are dispatched directly.
    pub async fn call_with_health_check(
        &self,
        agent_name: &str,
        input: &Value,
    ) -> Result<Value, AgentError> {
        let agent = self
            .registry
            .get(agent_name)
            .ok_or_else(|| AgentError::NotFound(agent_name.to_owned()))?;

        if let Some(checkable) = agent.as_health_checkable() {
            checkable.health_check().await?;
        }

        let callable = agent
            .as_callable()
            .ok_or_else(|| AgentError::NotCallable(agent_name.to_owned()))?;

        callable.call(input).await
    }
}
