//! Storage seam between the sync engine and a namespace's database.
//!
//! Every method blocks; async callers run them on `spawn_blocking`.

use std::time::Instant;

use chrono::{DateTime, Utc};

use apqp_core::tree::DocumentTree;
use apqp_core::types::{
    Acknowledgement, ConflictId, Direction, DocumentKind, ProjectKey, SyncConflict, SyncLogEntry,
    SyncOutcome, SyncWatermark,
};

use crate::error::StorageError;
use crate::plan::ApplyPlan;

/// One document as loaded, with the revision it was loaded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub tree: DocumentTree,
    pub revision: u64,
}

/// Per-direction sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub watermark: Option<SyncWatermark>,
    pub pending: Vec<SyncConflict>,
    pub acknowledgements: Vec<Acknowledgement>,
}

/// Row changes for one document, guarded by the revision they were planned
/// against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub document: DocumentKind,
    pub expected_revision: u64,
    pub plan: ApplyPlan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReplacement {
    pub direction: Direction,
    pub conflicts: Vec<SyncConflict>,
}

/// Everything one sync or one resolution batch writes. Committed in a single
/// transaction together with its log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceCommit {
    pub changes: Vec<DocumentChange>,
    pub watermarks: Vec<SyncWatermark>,
    /// Replace the whole pending set of one direction.
    pub replace_pending: Option<PendingReplacement>,
    /// Drop individual pending conflicts.
    pub clear_pending: Vec<ConflictId>,
    pub acknowledgements: Vec<Acknowledgement>,
    pub log: SyncLogEntry,
}

/// Filters for a sync log query. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub direction: Option<Direction>,
    pub outcome: Option<SyncOutcome>,
    /// Only entries requested at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

pub trait NamespaceStore: Send + Sync + 'static {
    /// Create every table, index and trigger. Idempotent.
    fn provision(&self, key: &ProjectKey) -> Result<(), StorageError>;

    fn is_provisioned(&self, key: &ProjectKey) -> bool;

    fn load_document(
        &self,
        key: &ProjectKey,
        document: DocumentKind,
    ) -> Result<DocumentSnapshot, StorageError>;

    fn load_sync_state(
        &self,
        key: &ProjectKey,
        direction: Direction,
    ) -> Result<SyncState, StorageError>;

    /// Pending conflicts, optionally for one direction only, oldest first.
    fn pending_conflicts(
        &self,
        key: &ProjectKey,
        direction: Option<Direction>,
    ) -> Result<Vec<SyncConflict>, StorageError>;

    /// Apply `commit` atomically and return the log sequence number.
    ///
    /// Fails with [`StorageError::RevisionConflict`] if a document moved on,
    /// [`StorageError::DeadlineExceeded`] if `deadline` passes before
    /// `COMMIT`, and [`StorageError::LogAppend`] if the log row is refused.
    /// Nothing is written on failure.
    fn commit(
        &self,
        key: &ProjectKey,
        commit: &NamespaceCommit,
        deadline: Option<Instant>,
    ) -> Result<u64, StorageError>;

    /// Append a log entry outside any apply (failed attempts).
    fn append_log(&self, key: &ProjectKey, entry: &SyncLogEntry) -> Result<u64, StorageError>;

    /// Up to `limit` entries older than `before`, newest first.
    fn query_log(
        &self,
        key: &ProjectKey,
        filter: &LogFilter,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, StorageError>;
}
