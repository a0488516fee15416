//! Agent registry -- the named collection of registered agent handles.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::Agent;

/// A thread-safe map from agent name to handle.
///
/// Reads (lookup, list) take a shared lock; membership changes take the
/// exclusive lock. Handles are `Arc`ed so a resolved handle outlives a
/// concurrent `remove`.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under the name it reports.
    ///
    /// If a handle with the same name is already registered, it is replaced
    /// and the old one is returned.
    pub fn register(&self, agent: Arc<dyn Agent>) -> Option<Arc<dyn Agent>> {
        let name = agent.name().to_owned();
        self.write().insert(name, agent)
    }

    /// Look up a handle by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.read().get(name).cloned()
    }

    /// List the names of all registered agents.
    ///
    /// The order is not guaranteed (HashMap iteration order).
    pub fn list(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Remove a handle by name, returning it if it was present.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.write().remove(name)
    }

    /// Whether an agent with this name is registered.
    pub fn has(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Agent>>> {
        self.agents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Agent>>> {
        self.agents.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
