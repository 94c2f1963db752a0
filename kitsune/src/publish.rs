//! Where converted state is published

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use kitsune_common::{Entity, EntityKey, Patch, merge_patch};

/// Where converted state goes
#[async_trait]
pub trait StateSink: Send + Sync {
    /// Merges `patch` into the entity's published state
    async fn publish(&self, entity: &Entity, patch: Patch);

    /// Last known state of the entity; empty if nothing was published yet
    async fn state(&self, entity: &Entity) -> Patch;
}

/// Keeps published state in memory, along with the history of every publication
#[derive(Debug, Default)]
pub struct MemoryStateSink {
    states: Mutex<HashMap<EntityKey, Patch>>,
    history: Mutex<Vec<(Entity, Patch)>>,
}

impl MemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<(Entity, Patch)> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn forget(&self, entity: &Entity) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entity.key());
    }
}

#[async_trait]
impl StateSink for MemoryStateSink {
    async fn publish(&self, entity: &Entity, patch: Patch) {
        tracing::debug!(%entity, ?patch, "publishing state");

        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((entity.clone(), patch.clone()));

        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        merge_patch(states.entry(entity.key()).or_default(), patch);
    }

    async fn state(&self, entity: &Entity) -> Patch {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entity.key())
            .cloned()
            .unwrap_or_default()
    }
}
