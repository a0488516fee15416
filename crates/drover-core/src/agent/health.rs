//! Background health checker for registered agents.
//!
//! Probes every agent with the health capability in parallel on a fixed
//! interval and keeps the latest result per agent in a snapshot table.
//! Agents without the capability are recorded healthy with zero latency.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::AgentRegistry;

/// Latest probe result for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub name: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Periodic prober with a thread-safe status table.
pub struct HealthChecker {
    registry: Arc<AgentRegistry>,
    statuses: RwLock<HashMap<String, HealthStatus>>,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<AgentRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            statuses: RwLock::new(HashMap::new()),
            interval,
        }
    }

    /// Spawn the probe loop. It runs one round per interval until the
    /// token is cancelled.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(checker.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("health checker stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        checker.check_all().await;
                    }
                }
            }
        })
    }

    /// Probe every registered agent once, in parallel.
    pub async fn check_all(&self) {
        let names = self.registry.list();
        let probes = names.into_iter().map(|name| self.check_agent(name));
        futures::future::join_all(probes).await;
    }

    async fn check_agent(&self, name: String) {
        let Some(agent) = self.registry.get(&name) else {
            // Removed between list() and get(); drop any stale status.
            self.write().remove(&name);
            return;
        };

        let status = match agent.as_health_checkable() {
            None => HealthStatus {
                name: name.clone(),
                healthy: true,
                last_check: Utc::now(),
                latency_ms: 0,
                error: None,
            },
            Some(checkable) => {
                let start = Instant::now();
                let result = checkable.health_check().await;
                let latency_ms = start.elapsed().as_millis() as u64;
                match result {
                    Ok(()) => HealthStatus {
                        name: name.clone(),
                        healthy: true,
                        last_check: Utc::now(),
                        latency_ms,
                        error: None,
                    },
                    Err(err) => HealthStatus {
                        name: name.clone(),
                        healthy: false,
                        last_check: Utc::now(),
                        latency_ms,
                        error: Some(err.to_string()),
                    },
                }
            }
        };

        if !status.healthy {
            tracing::warn!(
                agent = %name,
                error = status.error.as_deref().unwrap_or(""),
                "agent health probe failed"
            );
        }

        self.write().insert(name, status);
    }

    /// Latest status for one agent, if it has been probed.
    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        self.read().get(name).cloned()
    }

    /// Snapshot of all statuses, sorted by agent name.
    pub fn all_statuses(&self) -> Vec<HealthStatus> {
        let mut statuses: Vec<HealthStatus> = self.read().values().cloned().collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, HealthStatus>> {
        self.statuses.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, HealthStatus>> {
        self.statuses.write().unwrap_or_else(PoisonError::into_inner)
    }
}
