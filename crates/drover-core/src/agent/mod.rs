//! Agent handles and the routing layer in front of them.
//!
//! An agent is a remotely callable worker identified by name. Handles are
//! polymorphic over a small capability set: every handle has a name, some
//! are callable, some can be health-checked. The registry stores handles,
//! the router resolves and invokes them, and each HTTP handle carries its
//! own circuit breaker.

pub mod breaker;
pub mod health;
pub mod http;
pub mod registry;
pub mod router;

use async_trait::async_trait;
use serde_json::Value;

/// Failure kinds for an agent call.
///
/// `NotFound` and `NotCallable` are configuration faults and never retried;
/// everything else feeds the step's retry accounting. `Timeout` renders as
/// `"timeout exceeded"`, which is what lands in a step's `last_error`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent {0} not registered")]
    NotFound(String),
    #[error("agent {0} is not callable")]
    NotCallable(String),
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("timeout exceeded")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("agent error: {0}")]
    Application(String),
    #[error("agent unhealthy: {0}")]
    Unhealthy(String),
}

impl AgentError {
    /// Whether a failed call should count against the step's retry budget
    /// rather than failing the step outright.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::NotCallable(_))
    }
}

/// A named agent handle with capability queries.
///
/// Implementations override the `as_*` methods for the capabilities they
/// satisfy; the defaults declare nothing.
pub trait Agent: Send + Sync {
    /// The agent's registered name.
    fn name(&self) -> &str;

    /// The invocation capability, if this handle supports it.
    fn as_callable(&self) -> Option<&dyn Callable> {
        None
    }

    /// The health-probe capability, if this handle supports it.
    fn as_health_checkable(&self) -> Option<&dyn HealthCheckable> {
        None
    }
}

/// An agent that can execute a step input.
#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(&self, input: &Value) -> Result<Value, AgentError>;
}

/// An agent that can be probed for liveness.
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    async fn health_check(&self) -> Result<(), AgentError>;
}

// Compile-time assertion: Agent must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};
