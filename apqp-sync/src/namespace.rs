//! Namespace Registry: makes a project's storage ready exactly once.
//!
//! Each key has one `watch` channel carrying its [`ReadinessState`]. The first
//! caller to find a key uninitialized (or failed) becomes the provisioner;
//! everyone else subscribes and waits for the state to leave `Provisioning`.
//! Provisioning runs on its own task, so a caller that gives up on its
//! timeout does not abandon an attempt halfway.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use apqp_core::types::{ProjectKey, ProjectNamespace, ReadinessState};

use crate::error::SyncError;
use crate::store::NamespaceStore;

pub struct NamespaceRegistry<S> {
    store: Arc<S>,
    states: Mutex<HashMap<ProjectKey, Arc<watch::Sender<ReadinessState>>>>,
}

impl<S: NamespaceStore> NamespaceRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until `key`'s namespace is provisioned, starting provisioning if
    /// nobody has yet.
    pub async fn ensure_ready(
        &self,
        key: &ProjectKey,
        timeout: Duration,
    ) -> Result<ProjectNamespace, SyncError> {
        let mut rx = self.claim(key);
        let state = match tokio::time::timeout(
            timeout,
            rx.wait_for(|state| !matches!(state, ReadinessState::Provisioning)),
        )
        .await
        {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => {
                return Err(SyncError::NamespaceProvisioning {
                    project: key.clone(),
                    reason: "provisioning task ended without a result".to_string(),
                })
            }
            Err(_) => {
                return Err(SyncError::SyncTimeout {
                    project: key.clone(),
                    stage: "provisioning",
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        };

        match state {
            ReadinessState::Ready => Ok(ProjectNamespace {
                key: key.clone(),
                state,
            }),
            ReadinessState::Failed(reason) => Err(SyncError::NamespaceProvisioning {
                project: key.clone(),
                reason,
            }),
            other => Err(SyncError::NamespaceProvisioning {
                project: key.clone(),
                reason: format!("namespace left in state {other}"),
            }),
        }
    }

    /// Current readiness without starting anything.
    pub fn state(&self, key: &ProjectKey) -> ReadinessState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        match states.get(key) {
            Some(tx) => tx.borrow().clone(),
            None if self.store.is_provisioned(key) => ReadinessState::Ready,
            None => ReadinessState::Uninitialized,
        }
    }

    /// Subscribe to `key`'s state, becoming the provisioner if no attempt is
    /// live.
    fn claim(&self, key: &ProjectKey) -> watch::Receiver<ReadinessState> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = states.get(key) {
            if !matches!(*tx.borrow(), ReadinessState::Failed(_)) {
                return tx.subscribe();
            }
        }

        let (tx, rx) = watch::channel(ReadinessState::Provisioning);
        let tx = Arc::new(tx);
        states.insert(key.clone(), Arc::clone(&tx));
        drop(states);

        self.spawn_provisioner(key.clone(), tx);
        rx
    }

    fn spawn_provisioner(&self, key: ProjectKey, tx: Arc<watch::Sender<ReadinessState>>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tracing::debug!(project = %key, "provisioning namespace");
            let task_key = key.clone();
            let result = tokio::task::spawn_blocking(move || store.provision(&task_key)).await;
            let state = match result {
                Ok(Ok(())) => ReadinessState::Ready,
                Ok(Err(err)) => ReadinessState::Failed(err.to_string()),
                Err(err) => ReadinessState::Failed(format!("provisioning task failed: {err}")),
            };
            match &state {
                ReadinessState::Failed(reason) => {
                    tracing::error!(project = %key, %reason, "namespace provisioning failed")
                }
                _ => tracing::info!(project = %key, "namespace ready"),
            }
            tx.send_replace(state);
        });
    }
}
