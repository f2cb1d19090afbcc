//! Sync Orchestrator: drives one sync from request to log entry.
//!
//! ```text
//! Requested -> (lock) -> NamespaceReady -> Mapped -> Detected -> Resolving
//!           -> Applying -> Logged -> Completed | Failed
//! ```
//!
//! The per-project lock is taken before the namespace check and released once
//! the outcome is logged. Mapping, detection and resolution are pure; only
//! provisioning, loading and the apply transaction touch storage, each on the
//! blocking pool. The apply commits document rows, watermark, pending set and
//! log entry in one transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use apqp_core::config::Config;
use apqp_core::types::{
    Acknowledgement, ConflictId, ConflictKind, ConflictResolution, ConflictSummary, ConflictValue,
    Direction, DocumentKind, LogOperation, ProjectKey, ReadinessState, ResolutionOutcome,
    SyncConflict, SyncLogEntry, SyncOutcome, SyncPolicy, SyncWatermark,
};

use crate::detector::detect;
use crate::error::{StorageError, SyncError};
use crate::lock::{ProjectGuard, ProjectLocks};
use crate::log::{query_page, LogPage, LogQuery};
use crate::mapper::map_to_target;
use crate::namespace::NamespaceRegistry;
use crate::plan::{apply_order, still_current, ApplyPlan, PlanBuilder};
use crate::resolver::{resolve, ResolvedConflict};
use crate::sqlite::{now_micros, SqliteStore};
use crate::store::{
    DocumentChange, DocumentSnapshot, NamespaceCommit, NamespaceStore, PendingReplacement,
    SyncState,
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub project_key: ProjectKey,
    pub direction: Direction,
    #[serde(default)]
    pub policy: SyncPolicy,
    #[serde(default)]
    pub allow_deletions: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Fail with `SyncInProgress` instead of waiting for the project lock.
    #[serde(default)]
    pub non_blocking: bool,
    /// Map, detect and resolve, but neither apply nor log.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_timeout_ms() -> u64 {
    Config::default().timeout_ms
}

impl SyncRequest {
    /// A request carrying the configured defaults.
    pub fn new(project_key: ProjectKey, direction: Direction, config: &Config) -> Self {
        Self {
            project_key,
            direction,
            policy: config.default_policy,
            allow_deletions: config.allow_deletions,
            timeout_ms: config.timeout_ms,
            non_blocking: false,
            dry_run: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub outcome: SyncOutcome,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Source nodes excluded because their parent has no counterpart.
    #[serde(default)]
    pub orphans: usize,
    #[serde(default)]
    pub conflicts: Vec<ConflictSummary>,
    #[serde(default)]
    pub pending_conflict_ids: Vec<ConflictId>,
    /// Pending conflicts that were not pending before this sync.
    #[serde(default)]
    pub new_conflict_ids: Vec<ConflictId>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl SyncResponse {
    /// A `Failed` response describing `err`.
    pub fn from_error(err: &SyncError) -> Self {
        Self {
            outcome: SyncOutcome::Failed,
            added: 0,
            updated: 0,
            removed: 0,
            orphans: 0,
            conflicts: vec![],
            pending_conflict_ids: vec![],
            new_conflict_ids: vec![],
            dry_run: false,
            log_seq: None,
            error_detail: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedResolution {
    pub conflict_id: ConflictId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub applied: usize,
    #[serde(default)]
    pub rejected: Vec<RejectedResolution>,
    #[serde(default)]
    pub remaining_pending: Vec<ConflictId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub project_key: ProjectKey,
    pub readiness: ReadinessState,
    /// Document name → revision; empty until provisioned.
    #[serde(default)]
    pub revisions: BTreeMap<String, u64>,
    #[serde(default)]
    pub watermarks: Vec<SyncWatermark>,
    pub pending_conflicts: usize,
    pub sync_in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_entry: Option<SyncLogEntry>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator<S> {
    store: Arc<S>,
    registry: NamespaceRegistry<S>,
    locks: ProjectLocks,
}

impl SyncOrchestrator<SqliteStore> {
    /// Orchestrator over the SQLite namespaces under `<home>/.apqp/`.
    pub fn open_at(home: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(SqliteStore::new(home)))
    }
}

impl<S: NamespaceStore> SyncOrchestrator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            registry: NamespaceRegistry::new(Arc::clone(&store)),
            store,
            locks: ProjectLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn ensure_ready(&self, key: &ProjectKey, timeout: Duration) -> Result<(), SyncError> {
        key.validate()?;
        self.registry.ensure_ready(key, timeout).await.map(|_| ())
    }

    /// Run one sync. Errors after the namespace is ready are also recorded in
    /// the sync log as `Failed` entries.
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, SyncError> {
        let requested_at = now_micros();
        let key = &request.project_key;
        key.validate()?;
        let deadline = Instant::now() + request.timeout();

        let guard = self.lock(key, request.non_blocking, deadline, request.timeout_ms).await?;
        self.registry
            .ensure_ready(key, deadline.saturating_duration_since(Instant::now()))
            .await?;

        let guard = Arc::new(guard);
        let result = self
            .run_sync(request, Arc::clone(&guard), requested_at, deadline)
            .await;
        let result = match result {
            Ok(response) => Ok(response),
            Err(err) => Err(self
                .record_failure(key, request.direction, LogOperation::Sync, requested_at, err)
                .await),
        };
        drop(guard);
        result
    }

    async fn lock(
        &self,
        key: &ProjectKey,
        non_blocking: bool,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<ProjectGuard, SyncError> {
        if non_blocking {
            return self.locks.try_acquire(key);
        }
        tokio::time::timeout_at(deadline, self.locks.acquire(key))
            .await
            .map_err(|_| SyncError::SyncTimeout {
                project: key.clone(),
                stage: "lock",
                timeout_ms,
            })
    }

    async fn run_sync(
        &self,
        request: &SyncRequest,
        guard: Arc<ProjectGuard>,
        requested_at: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<SyncResponse, SyncError> {
        let key = request.project_key.clone();
        let direction = request.direction;

        let (source, target, state) = {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            blocking(move || -> Result<(DocumentSnapshot, DocumentSnapshot, SyncState), StorageError> {
                Ok((
                    store.load_document(&key, direction.source())?,
                    store.load_document(&key, direction.target())?,
                    store.load_sync_state(&key, direction)?,
                ))
            })
            .await?
        };

        let mapped = map_to_target(&source.tree, direction)?;
        let applied_at = now_micros();
        let report = detect(
            &mapped.tree,
            &target.tree,
            state.watermark.as_ref(),
            direction,
            applied_at,
        )?;
        let outcome = resolve(
            report.conflicts,
            request.policy,
            request.allow_deletions,
            &state.acknowledgements,
            applied_at,
        );

        let mut builder = PlanBuilder::new(&target.tree, applied_at);
        let apply_failure = |reason: String| SyncError::ApplyFailure {
            project: key.clone(),
            reason,
        };
        for root in &report.removals {
            builder
                .remove_subtree(root)
                .map_err(|err| apply_failure(err.to_string()))?;
        }
        for update in &report.field_updates {
            builder
                .apply_field_update(update)
                .map_err(|err| apply_failure(err.to_string()))?;
        }
        let mut decisions: Vec<&ResolvedConflict> = outcome.resolved.iter().collect();
        decisions.sort_by_cached_key(|decision| apply_order(&decision.conflict));
        for decision in decisions {
            builder
                .apply_decision(
                    &decision.conflict,
                    decision.resolution.outcome,
                    decision.resolution.value.as_deref(),
                )
                .map_err(|err| apply_failure(format!("{}: {err}", decision.conflict.id)))?;
        }
        let plan = builder.finish();

        let mut held: BTreeSet<_> = outcome.pending.iter().map(|c| c.node_id.clone()).collect();
        held.extend(
            outcome
                .resolved
                .iter()
                .filter(|r| r.resolution.outcome == ResolutionOutcome::KeepTarget)
                .map(|r| r.conflict.node_id.clone()),
        );
        let watermark = SyncWatermark {
            direction,
            synced_at: applied_at,
            version: state.watermark.as_ref().map_or(1, |w| w.version + 1),
            held,
        };

        let previous: BTreeSet<&ConflictId> = state.pending.iter().map(|c| &c.id).collect();
        let pending_conflict_ids: Vec<ConflictId> =
            outcome.pending.iter().map(|c| c.id.clone()).collect();
        let new_conflict_ids: Vec<ConflictId> = pending_conflict_ids
            .iter()
            .filter(|id| !previous.contains(id))
            .cloned()
            .collect();

        let mut conflicts: Vec<ConflictSummary> = outcome
            .resolved
            .iter()
            .map(|r| ConflictSummary::new(&r.conflict, Some(r.resolution.outcome)))
            .chain(outcome.pending.iter().map(|c| ConflictSummary::new(c, None)))
            .collect();
        conflicts.sort_by(|a, b| a.node_id.cmp(&b.node_id).then_with(|| a.id.cmp(&b.id)));

        let sync_outcome = if outcome.pending.is_empty() {
            SyncOutcome::Success
        } else {
            SyncOutcome::PartialSuccess
        };

        let mut response = SyncResponse {
            outcome: sync_outcome,
            added: plan.added,
            updated: plan.updated,
            removed: plan.removed,
            orphans: mapped.orphans.len(),
            conflicts,
            pending_conflict_ids,
            new_conflict_ids,
            dry_run: request.dry_run,
            log_seq: None,
            error_detail: None,
        };

        if request.dry_run {
            tracing::info!(
                project = %key,
                direction = %direction,
                outcome = %response.outcome,
                added = response.added,
                updated = response.updated,
                removed = response.removed,
                "dry run finished"
            );
            return Ok(response);
        }

        let commit = NamespaceCommit {
            changes: vec![DocumentChange {
                document: direction.target(),
                expected_revision: target.revision,
                plan,
            }],
            watermarks: vec![watermark],
            replace_pending: Some(PendingReplacement {
                direction,
                conflicts: outcome.pending,
            }),
            clear_pending: vec![],
            acknowledgements: vec![],
            log: SyncLogEntry {
                seq: 0,
                project: key.clone(),
                direction,
                operation: LogOperation::Sync,
                requested_at,
                completed_at: now_micros(),
                outcome: response.outcome,
                added: response.added,
                updated: response.updated,
                removed: response.removed,
                orphans: response.orphans,
                conflicts: response.conflicts.clone(),
                error_detail: None,
            },
        };

        let seq = self
            .apply(&key, commit, guard, deadline, request.timeout_ms)
            .await?;
        response.log_seq = Some(seq);

        tracing::info!(
            project = %key,
            direction = %direction,
            outcome = %response.outcome,
            added = response.added,
            updated = response.updated,
            removed = response.removed,
            orphans = response.orphans,
            pending = response.pending_conflict_ids.len(),
            seq,
            "sync finished"
        );
        Ok(response)
    }

    /// Commit on the blocking pool. The guard travels with the transaction, so
    /// the lock outlives a caller that stops waiting.
    async fn apply(
        &self,
        key: &ProjectKey,
        commit: NamespaceCommit,
        guard: Arc<ProjectGuard>,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<u64, SyncError> {
        let store = Arc::clone(&self.store);
        let deadline = deadline.into_std();
        let result = tokio::task::spawn_blocking(move || {
            store.commit(guard.key(), &commit, Some(deadline))
        })
        .await
        .map_err(|err| SyncError::Join(err.to_string()))?;

        result.map_err(|err| match err {
            StorageError::DeadlineExceeded => SyncError::SyncTimeout {
                project: key.clone(),
                stage: "apply",
                timeout_ms,
            },
            StorageError::LogAppend(reason) => SyncError::LogWrite {
                project: key.clone(),
                reason,
            },
            other => SyncError::ApplyFailure {
                project: key.clone(),
                reason: other.to_string(),
            },
        })
    }

    /// Append a `Failed` entry for `err` and hand `err` back. If the append
    /// itself fails the returned error names both failures.
    async fn record_failure(
        &self,
        key: &ProjectKey,
        direction: Direction,
        operation: LogOperation,
        requested_at: DateTime<Utc>,
        err: SyncError,
    ) -> SyncError {
        tracing::error!(project = %key, direction = %direction, error = %err, "sync failed");
        let entry = SyncLogEntry {
            seq: 0,
            project: key.clone(),
            direction,
            operation,
            requested_at,
            completed_at: now_micros(),
            outcome: SyncOutcome::Failed,
            added: 0,
            updated: 0,
            removed: 0,
            orphans: 0,
            conflicts: vec![],
            error_detail: Some(err.to_string()),
        };
        let store = Arc::clone(&self.store);
        let task_key = key.clone();
        match blocking(move || store.append_log(&task_key, &entry)).await {
            Ok(_) => err,
            Err(log_err) => SyncError::LogWrite {
                project: key.clone(),
                reason: format!("{log_err} (while recording failure: {err})"),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Resolution submission
    // -----------------------------------------------------------------------

    /// Apply human decisions to pending conflicts.
    ///
    /// Each resolution must name a pending conflict; `ManualValue` is accepted
    /// for field divergences only. Accepted resolutions are applied per
    /// direction in one transaction with their log entry, leave the pending
    /// set, and (for `KeepTarget` and `ManualValue`) are remembered so a later
    /// sync does not raise the same conflict again.
    pub async fn submit_resolutions(
        &self,
        key: &ProjectKey,
        resolutions: Vec<ConflictResolution>,
        timeout: Duration,
    ) -> Result<ResolutionResult, SyncError> {
        let requested_at = now_micros();
        key.validate()?;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let deadline = Instant::now() + timeout;
        let guard = self.lock(key, false, deadline, timeout_ms).await?;
        self.registry
            .ensure_ready(key, deadline.saturating_duration_since(Instant::now()))
            .await?;
        let guard = Arc::new(guard);

        let pending = {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            blocking(move || store.pending_conflicts(&key, None)).await?
        };
        let by_id: BTreeMap<&ConflictId, &SyncConflict> =
            pending.iter().map(|c| (&c.id, c)).collect();

        let mut result = ResolutionResult::default();
        let mut seen: BTreeSet<ConflictId> = BTreeSet::new();
        let mut accepted: BTreeMap<Direction, Vec<(SyncConflict, ConflictResolution)>> =
            BTreeMap::new();
        for resolution in resolutions {
            let id = resolution.conflict_id.clone();
            let reject = |reason: &str| RejectedResolution {
                conflict_id: id.clone(),
                reason: reason.to_string(),
            };
            if !seen.insert(id.clone()) {
                result.rejected.push(reject("duplicate resolution in this batch"));
                continue;
            }
            let Some(conflict) = by_id.get(&id) else {
                result.rejected.push(reject("no pending conflict with this id"));
                continue;
            };
            if resolution.outcome == ResolutionOutcome::ManualValue
                && conflict.kind != ConflictKind::FieldValueDivergence
            {
                result
                    .rejected
                    .push(reject("ManualValue only applies to field divergences"));
                continue;
            }
            if resolution.outcome == ResolutionOutcome::ManualValue && resolution.value.is_none() {
                result.rejected.push(reject("ManualValue needs a value"));
                continue;
            }
            accepted
                .entry(conflict.direction)
                .or_default()
                .push(((*conflict).clone(), resolution));
        }

        for (direction, batch) in accepted {
            match self
                .apply_resolutions(key, direction, batch, Arc::clone(&guard), requested_at, deadline, timeout_ms)
                .await
            {
                Ok((applied, rejected)) => {
                    result.applied += applied;
                    result.rejected.extend(rejected);
                }
                Err(err) => {
                    return Err(self
                        .record_failure(key, direction, LogOperation::Resolution, requested_at, err)
                        .await)
                }
            }
        }

        let remaining = {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            blocking(move || store.pending_conflicts(&key, None)).await?
        };
        result.remaining_pending = remaining.into_iter().map(|c| c.id).collect();
        drop(guard);

        tracing::info!(
            project = %key,
            applied = result.applied,
            rejected = result.rejected.len(),
            remaining = result.remaining_pending.len(),
            "resolutions submitted"
        );
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_resolutions(
        &self,
        key: &ProjectKey,
        direction: Direction,
        mut batch: Vec<(SyncConflict, ConflictResolution)>,
        guard: Arc<ProjectGuard>,
        requested_at: DateTime<Utc>,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<(usize, Vec<RejectedResolution>), SyncError> {
        let target = {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            blocking(move || store.load_document(&key, direction.target())).await?
        };

        let applied_at = now_micros();
        batch.sort_by_cached_key(|(conflict, _)| apply_order(conflict));

        let mut builder = PlanBuilder::new(&target.tree, applied_at);
        let mut rejected = Vec::new();
        let mut done: Vec<(SyncConflict, ConflictResolution)> = Vec::new();
        for (conflict, resolution) in batch {
            if !still_current(&conflict, &target.tree) {
                tracing::warn!(project = %key, conflict = %conflict.id, "resolution refused, target changed");
                rejected.push(RejectedResolution {
                    conflict_id: conflict.id.clone(),
                    reason: "stale: target changed since detection".to_string(),
                });
                continue;
            }
            match builder.apply_decision(&conflict, resolution.outcome, resolution.value.as_deref()) {
                Ok(()) => done.push((conflict, resolution)),
                Err(err) => rejected.push(RejectedResolution {
                    conflict_id: conflict.id.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        if done.is_empty() {
            return Ok((0, rejected));
        }
        let plan: ApplyPlan = builder.finish();

        let acknowledgements: Vec<Acknowledgement> = done
            .iter()
            .filter_map(|(conflict, resolution)| {
                let target_value = match resolution.outcome {
                    ResolutionOutcome::KeepSource => return None,
                    ResolutionOutcome::KeepTarget => conflict.target_value.clone(),
                    ResolutionOutcome::ManualValue => {
                        ConflictValue::field(resolution.value.as_deref())
                    }
                };
                Some(Acknowledgement {
                    conflict_id: conflict.id.clone(),
                    direction,
                    source_value: conflict.source_value.clone(),
                    target_value,
                    resolution: resolution.clone(),
                })
            })
            .collect();

        let conflicts: Vec<ConflictSummary> = done
            .iter()
            .map(|(conflict, resolution)| ConflictSummary::new(conflict, Some(resolution.outcome)))
            .collect();
        let applied = done.len();
        let commit = NamespaceCommit {
            log: SyncLogEntry {
                seq: 0,
                project: key.clone(),
                direction,
                operation: LogOperation::Resolution,
                requested_at,
                completed_at: now_micros(),
                outcome: SyncOutcome::Success,
                added: plan.added,
                updated: plan.updated,
                removed: plan.removed,
                orphans: 0,
                conflicts,
                error_detail: None,
            },
            changes: vec![DocumentChange {
                document: direction.target(),
                expected_revision: target.revision,
                plan,
            }],
            watermarks: vec![],
            replace_pending: None,
            clear_pending: done.into_iter().map(|(conflict, _)| conflict.id).collect(),
            acknowledgements,
        };
        self.apply(key, commit, guard, deadline, timeout_ms).await?;
        Ok((applied, rejected))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn pending_conflicts(
        &self,
        key: &ProjectKey,
        direction: Option<Direction>,
    ) -> Result<Vec<SyncConflict>, SyncError> {
        key.validate()?;
        let store = Arc::clone(&self.store);
        let key = key.clone();
        blocking(move || store.pending_conflicts(&key, direction)).await
    }

    pub async fn query_log(&self, query: LogQuery) -> Result<LogPage, SyncError> {
        query.project_key.validate()?;
        let store = Arc::clone(&self.store);
        blocking(move || query_page(store.as_ref(), &query)).await
    }

    pub async fn status(&self, key: &ProjectKey) -> Result<ProjectStatus, SyncError> {
        key.validate()?;
        let readiness = self.registry.state(key);
        let sync_in_progress = self.locks.is_locked(key);
        let mut status = ProjectStatus {
            project_key: key.clone(),
            readiness,
            revisions: BTreeMap::new(),
            watermarks: vec![],
            pending_conflicts: 0,
            sync_in_progress,
            last_entry: None,
        };
        if !self.store.is_provisioned(key) {
            return Ok(status);
        }

        let store = Arc::clone(&self.store);
        let task_key = key.clone();
        let (revisions, watermarks, pending, last) = blocking(move || {
            let mut revisions = BTreeMap::new();
            for document in [DocumentKind::Pfmea, DocumentKind::ControlPlan] {
                let snapshot = store.load_document(&task_key, document)?;
                revisions.insert(document.as_str().to_string(), snapshot.revision);
            }
            let mut watermarks = Vec::new();
            for direction in Direction::ALL {
                if let Some(watermark) = store.load_sync_state(&task_key, direction)?.watermark {
                    watermarks.push(watermark);
                }
            }
            let pending = store.pending_conflicts(&task_key, None)?.len();
            let last = store
                .query_log(&task_key, &Default::default(), None, 1)?
                .into_iter()
                .next();
            Ok((revisions, watermarks, pending, last))
        })
        .await?;

        status.revisions = revisions;
        status.watermarks = watermarks;
        status.pending_conflicts = pending;
        status.last_entry = last;
        Ok(status)
    }
}

/// Run storage work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, SyncError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| SyncError::Join(err.to_string()))?
        .map_err(SyncError::from)
}
