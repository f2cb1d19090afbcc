//! Error types for apqp-sync.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use apqp_core::error::{InvalidProjectKey, MalformedIdentifierError, TreeError};
use apqp_core::types::{DocumentKind, NodeId, ProjectKey};

/// Errors from the namespace database.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON column could not be encoded or decoded.
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("namespace for project '{0}' has not been provisioned")]
    NotProvisioned(ProjectKey),

    /// Stored nodes do not form a valid document.
    #[error("stored document is invalid: {0}")]
    InvalidTree(#[from] TreeError),

    #[error("corrupt namespace data: {0}")]
    Corrupt(String),

    #[error("{document} changed during sync: expected revision {expected}, found {found}")]
    RevisionConflict {
        document: DocumentKind,
        expected: u64,
        found: u64,
    },

    #[error("node {id} not found in the {document} document")]
    NodeNotFound { document: DocumentKind, id: NodeId },

    #[error("parent {parent} of node {id} does not exist")]
    MissingParent { id: NodeId, parent: NodeId },

    #[error("edit rejected: {0}")]
    InvalidEdit(String),

    /// The deadline passed before `COMMIT`; the transaction was rolled back.
    #[error("deadline passed before commit")]
    DeadlineExceeded,

    /// The sync log row could not be written; the transaction was rolled back.
    #[error("sync log append failed: {0}")]
    LogAppend(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.into(),
        source,
    }
}

/// All errors that can end a sync operation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage for the namespace could not be created. Retryable.
    #[error("namespace for project '{project}' could not be provisioned: {reason}")]
    NamespaceProvisioning { project: ProjectKey, reason: String },

    /// Data corruption; never repaired automatically.
    #[error(transparent)]
    MalformedIdentifier(#[from] MalformedIdentifierError),

    #[error("invalid document tree: {0}")]
    InvalidTree(TreeError),

    #[error(transparent)]
    InvalidProjectKey(#[from] InvalidProjectKey),

    #[error("expected a {expected} tree, got {found}")]
    DocumentMismatch {
        expected: DocumentKind,
        found: DocumentKind,
    },

    #[error("a sync for project '{project}' is already in progress")]
    SyncInProgress { project: ProjectKey },

    #[error("project '{project}' timed out during {stage} after {timeout_ms} ms")]
    SyncTimeout {
        project: ProjectKey,
        stage: &'static str,
        timeout_ms: u64,
    },

    /// The apply transaction was rolled back; the namespace is unchanged.
    #[error("apply failed for project '{project}': {reason}; namespace unchanged")]
    ApplyFailure { project: ProjectKey, reason: String },

    #[error("sync log write failed for project '{project}': {reason}")]
    LogWrite { project: ProjectKey, reason: String },

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("background task failed: {0}")]
    Join(String),
}

impl SyncError {
    /// Whether the caller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::NamespaceProvisioning { .. })
    }
}

impl From<TreeError> for SyncError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::Malformed(err) => SyncError::MalformedIdentifier(err),
            other => SyncError::InvalidTree(other),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidTree(err) => err.into(),
            other => SyncError::Storage(other),
        }
    }
}

/// A source node left out of the candidate tree because its parent has no
/// mapped counterpart. Reported as a warning; the sync continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("node {node_id} excluded: parent {parent} has no counterpart in the {target} document")]
pub struct OrphanMappingError {
    pub node_id: NodeId,
    pub parent: NodeId,
    pub target: DocumentKind,
}
