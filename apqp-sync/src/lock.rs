//! Keyed per-project mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use apqp_core::types::ProjectKey;

use crate::error::SyncError;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
pub struct ProjectLocks {
    slots: Mutex<HashMap<ProjectKey, Slot>>,
}

/// Held for the whole of one sync or resolution batch.
#[derive(Debug)]
pub struct ProjectGuard {
    key: ProjectKey,
    _guard: OwnedMutexGuard<()>,
}

impl ProjectGuard {
    pub fn key(&self) -> &ProjectKey {
        &self.key
    }
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &ProjectKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Idle slots are referenced only by the map.
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Wait for the project's lock. Dropping the future while queued gives up
    /// the place in line.
    pub async fn acquire(&self, key: &ProjectKey) -> ProjectGuard {
        let guard = self.slot(key).lock_owned().await;
        ProjectGuard {
            key: key.clone(),
            _guard: guard,
        }
    }

    /// Take the lock only if it is free.
    pub fn try_acquire(&self, key: &ProjectKey) -> Result<ProjectGuard, SyncError> {
        let guard = self
            .slot(key)
            .try_lock_owned()
            .map_err(|_| SyncError::SyncInProgress {
                project: key.clone(),
            })?;
        Ok(ProjectGuard {
            key: key.clone(),
            _guard: guard,
        })
    }

    pub fn is_locked(&self, key: &ProjectKey) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }
}
