//! SQLite-backed [`NamespaceStore`]: one database file per project.
//!
//! # Storage layout
//!
//! ```text
//! ~/.apqp/projects/<project_key>/namespace.db   (dir mode 0700)
//! ```
//!
//! Timestamps are stored as RFC 3339 text with fixed microsecond precision,
//! so string order equals time order. `sync_log` is append-only: triggers
//! abort any UPDATE or DELETE against it.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};

use apqp_core::paths::{namespace_db_path, namespace_dir};
use apqp_core::tree::DocumentTree;
use apqp_core::types::{
    Acknowledgement, Direction, DocumentKind, HierarchyNode, NodeId, NodeKind, ProjectKey,
    SyncConflict, SyncLogEntry, SyncWatermark,
};

use crate::error::{io_err, StorageError};
use crate::plan::{ApplyPlan, PlanBuilder, PlanError};
use crate::store::{
    DocumentSnapshot, LogFilter, NamespaceCommit, NamespaceStore, SyncState,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS namespace_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
INSERT OR IGNORE INTO namespace_meta (key, value) VALUES ('schema_version', '1');

CREATE TABLE IF NOT EXISTS documents (
    document TEXT PRIMARY KEY,
    revision INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO documents (document, revision) VALUES ('pfmea', 0), ('control_plan', 0);

CREATE TABLE IF NOT EXISTS nodes (
    document      TEXT NOT NULL,
    id            TEXT NOT NULL,
    kind          TEXT NOT NULL,
    parent_id     TEXT,
    ordinal       INTEGER NOT NULL,
    fields        TEXT NOT NULL,
    last_modified TEXT NOT NULL,
    origin        TEXT NOT NULL,
    PRIMARY KEY (document, id)
);
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes (document, parent_id);

CREATE TABLE IF NOT EXISTS watermarks (
    direction TEXT PRIMARY KEY,
    synced_at TEXT NOT NULL,
    version   INTEGER NOT NULL,
    held      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_conflicts (
    id        TEXT PRIMARY KEY,
    direction TEXT NOT NULL,
    payload   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS acknowledgements (
    conflict_id TEXT PRIMARY KEY,
    direction   TEXT NOT NULL,
    payload     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_log (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    direction    TEXT NOT NULL,
    operation    TEXT NOT NULL,
    outcome      TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    payload      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_log_requested ON sync_log (requested_at);

CREATE TRIGGER IF NOT EXISTS sync_log_no_update BEFORE UPDATE ON sync_log
BEGIN
    SELECT RAISE(ABORT, 'sync_log is append-only');
END;
CREATE TRIGGER IF NOT EXISTS sync_log_no_delete BEFORE DELETE ON sync_log
BEGIN
    SELECT RAISE(ABORT, 'sync_log is append-only');
END;
";

/// Namespace databases under `<home>/.apqp/projects/`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    home: PathBuf,
}

impl SqliteStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn open(&self, key: &ProjectKey) -> Result<Connection, StorageError> {
        let path = namespace_db_path(&self.home, key);
        if !path.exists() {
            return Err(StorageError::NotProvisioned(key.clone()));
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Document editing
    // -----------------------------------------------------------------------

    /// Replace the whole document. Nodes whose content is unchanged keep their
    /// modification time; every other node is stamped now.
    pub fn replace_document(
        &self,
        key: &ProjectKey,
        document: DocumentKind,
        nodes: Vec<HierarchyNode>,
    ) -> Result<ApplyPlan, StorageError> {
        let incoming = DocumentTree::from_nodes(document, nodes)?;
        self.edit(key, document, |builder, current| {
            for node in current.iter() {
                if !incoming.contains(&node.id) && builder.contains(&node.id) {
                    builder.remove_subtree(&node.id)?;
                }
            }
            for node in incoming.depth_order() {
                builder.put_node(node)?;
            }
            Ok(())
        })
    }

    /// Insert or replace one node. Its parent must already exist.
    pub fn upsert_node(
        &self,
        key: &ProjectKey,
        document: DocumentKind,
        node: &HierarchyNode,
    ) -> Result<ApplyPlan, StorageError> {
        self.edit(key, document, |builder, _| builder.put_node(node))
    }

    /// Set (`Some`) or clear (`None`) one field of one node.
    pub fn set_field(
        &self,
        key: &ProjectKey,
        document: DocumentKind,
        id: &NodeId,
        field: &str,
        value: Option<&str>,
    ) -> Result<ApplyPlan, StorageError> {
        self.edit(key, document, |builder, _| builder.set_field(id, field, value))
    }

    /// Remove a node and everything below it.
    pub fn remove_subtree(
        &self,
        key: &ProjectKey,
        document: DocumentKind,
        id: &NodeId,
    ) -> Result<ApplyPlan, StorageError> {
        self.edit(key, document, |builder, _| builder.remove_subtree(id))
    }

    fn edit<F>(
        &self,
        key: &ProjectKey,
        document: DocumentKind,
        f: F,
    ) -> Result<ApplyPlan, StorageError>
    where
        F: FnOnce(&mut PlanBuilder<'_>, &DocumentTree) -> Result<(), PlanError>,
    {
        let mut conn = self.open(key)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = DocumentTree::from_nodes(document, read_nodes(&tx, document)?)?;
        let mut builder = PlanBuilder::new(&current, now_micros());
        f(&mut builder, &current).map_err(|err| plan_error(document, err))?;
        let plan = builder.finish();
        write_plan(&tx, document, &plan)?;
        tx.commit()?;
        tracing::info!(
            project = %key,
            document = %document,
            added = plan.added,
            updated = plan.updated,
            removed = plan.removed,
            "document edited"
        );
        Ok(plan)
    }
}

impl NamespaceStore for SqliteStore {
    fn provision(&self, key: &ProjectKey) -> Result<(), StorageError> {
        let dir = namespace_dir(&self.home, key);
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            set_dir_permissions(&dir)?;
        }
        let conn = Connection::open(namespace_db_path(&self.home, key))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn is_provisioned(&self, key: &ProjectKey) -> bool {
        namespace_db_path(&self.home, key).exists()
    }

    fn load_document(
        &self,
        key: &ProjectKey,
        document: DocumentKind,
    ) -> Result<DocumentSnapshot, StorageError> {
        let mut conn = self.open(key)?;
        let tx = conn.transaction()?;
        let revision = read_revision(&tx, document)?;
        let tree = DocumentTree::from_nodes(document, read_nodes(&tx, document)?)?;
        tx.commit()?;
        Ok(DocumentSnapshot { tree, revision })
    }

    fn load_sync_state(
        &self,
        key: &ProjectKey,
        direction: Direction,
    ) -> Result<SyncState, StorageError> {
        let conn = self.open(key)?;
        let watermark = conn
            .query_row(
                "SELECT synced_at, version, held FROM watermarks WHERE direction = ?1",
                params![direction.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .map(|(synced_at, version, held)| -> Result<SyncWatermark, StorageError> {
                Ok(SyncWatermark {
                    direction,
                    synced_at: parse_ts(&synced_at)?,
                    version: to_u64(version)?,
                    held: serde_json::from_str(&held)?,
                })
            })
            .transpose()?;

        let pending = read_pending(&conn, Some(direction))?;

        let mut stmt = conn.prepare(
            "SELECT payload FROM acknowledgements WHERE direction = ?1 ORDER BY conflict_id",
        )?;
        let acknowledgements = stmt
            .query_map(params![direction.as_str()], |row| row.get::<_, String>(0))?
            .map(|payload| Ok(serde_json::from_str::<Acknowledgement>(&payload?)?))
            .collect::<Result<Vec<_>, StorageError>>()?;

        Ok(SyncState {
            watermark,
            pending,
            acknowledgements,
        })
    }

    fn pending_conflicts(
        &self,
        key: &ProjectKey,
        direction: Option<Direction>,
    ) -> Result<Vec<SyncConflict>, StorageError> {
        if !self.is_provisioned(key) {
            return Ok(vec![]);
        }
        let conn = self.open(key)?;
        read_pending(&conn, direction)
    }

    fn commit(
        &self,
        key: &ProjectKey,
        commit: &NamespaceCommit,
        deadline: Option<Instant>,
    ) -> Result<u64, StorageError> {
        let mut conn = self.open(key)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for change in &commit.changes {
            let found = read_revision(&tx, change.document)?;
            if found != change.expected_revision {
                return Err(StorageError::RevisionConflict {
                    document: change.document,
                    expected: change.expected_revision,
                    found,
                });
            }
            write_plan(&tx, change.document, &change.plan)?;
        }

        for watermark in &commit.watermarks {
            tx.execute(
                "INSERT OR REPLACE INTO watermarks (direction, synced_at, version, held)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    watermark.direction.as_str(),
                    format_ts(watermark.synced_at),
                    to_i64(watermark.version)?,
                    serde_json::to_string(&watermark.held)?,
                ],
            )?;
        }

        if let Some(replacement) = &commit.replace_pending {
            tx.execute(
                "DELETE FROM pending_conflicts WHERE direction = ?1",
                params![replacement.direction.as_str()],
            )?;
            for conflict in &replacement.conflicts {
                tx.execute(
                    "INSERT OR REPLACE INTO pending_conflicts (id, direction, payload)
                     VALUES (?1, ?2, ?3)",
                    params![
                        conflict.id.as_str(),
                        conflict.direction.as_str(),
                        serde_json::to_string(conflict)?,
                    ],
                )?;
            }
        }
        for id in &commit.clear_pending {
            tx.execute(
                "DELETE FROM pending_conflicts WHERE id = ?1",
                params![id.as_str()],
            )?;
        }

        for ack in &commit.acknowledgements {
            tx.execute(
                "INSERT OR REPLACE INTO acknowledgements (conflict_id, direction, payload)
                 VALUES (?1, ?2, ?3)",
                params![
                    ack.conflict_id.as_str(),
                    ack.direction.as_str(),
                    serde_json::to_string(ack)?,
                ],
            )?;
        }

        let seq = insert_log(&tx, &commit.log)
            .map_err(|err| StorageError::LogAppend(err.to_string()))?;

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            // Dropping `tx` rolls everything back.
            return Err(StorageError::DeadlineExceeded);
        }
        tx.commit()?;
        Ok(seq)
    }

    fn append_log(&self, key: &ProjectKey, entry: &SyncLogEntry) -> Result<u64, StorageError> {
        let mut conn = self.open(key)?;
        let tx = conn.transaction()?;
        let seq = insert_log(&tx, entry)?;
        tx.commit()?;
        Ok(seq)
    }

    fn query_log(
        &self,
        key: &ProjectKey,
        filter: &LogFilter,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, StorageError> {
        if !self.is_provisioned(key) {
            return Ok(vec![]);
        }
        let conn = self.open(key)?;
        let mut stmt = conn.prepare(
            "SELECT seq, payload FROM sync_log
             WHERE (?1 IS NULL OR direction = ?1)
               AND (?2 IS NULL OR outcome = ?2)
               AND (?3 IS NULL OR requested_at >= ?3)
               AND (?4 IS NULL OR seq < ?4)
             ORDER BY seq DESC
             LIMIT ?5",
        )?;
        let before = before.map(to_i64).transpose()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(
            params![
                filter.direction.map(|d| d.as_str()),
                filter.outcome.map(|o| o.to_string()),
                filter.since.map(format_ts),
                before,
                limit,
            ],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, payload) = row?;
            let mut entry: SyncLogEntry = serde_json::from_str(&payload)?;
            entry.seq = to_u64(seq)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn read_revision(conn: &Connection, document: DocumentKind) -> Result<u64, StorageError> {
    let revision: i64 = conn.query_row(
        "SELECT revision FROM documents WHERE document = ?1",
        params![document.as_str()],
        |row| row.get(0),
    )?;
    to_u64(revision)
}

fn read_nodes(conn: &Connection, document: DocumentKind) -> Result<Vec<HierarchyNode>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, parent_id, ordinal, fields, last_modified, origin
         FROM nodes WHERE document = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![document.as_str()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;

    let mut nodes = Vec::new();
    for row in rows {
        let (id, kind, parent, ordinal, fields, last_modified, origin) = row?;
        let kind = NodeKind::from_code(&kind)
            .ok_or_else(|| StorageError::Corrupt(format!("node {id} has unknown kind '{kind}'")))?;
        nodes.push(HierarchyNode {
            kind,
            parent: parent.map(NodeId::from),
            ordinal: u32::try_from(ordinal)
                .map_err(|_| StorageError::Corrupt(format!("node {id} has ordinal {ordinal}")))?,
            fields: serde_json::from_str(&fields)?,
            last_modified: parse_ts(&last_modified)?,
            origin: DocumentKind::from_str(&origin).map_err(StorageError::Corrupt)?,
            id: NodeId::from(id),
        });
    }
    Ok(nodes)
}

fn read_pending(
    conn: &Connection,
    direction: Option<Direction>,
) -> Result<Vec<SyncConflict>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT payload FROM pending_conflicts
         WHERE (?1 IS NULL OR direction = ?1)
         ORDER BY rowid",
    )?;
    let conflicts = stmt
        .query_map(params![direction.map(|d| d.as_str())], |row| row.get::<_, String>(0))?
        .map(|payload| Ok(serde_json::from_str::<SyncConflict>(&payload?)?))
        .collect::<Result<Vec<_>, StorageError>>()?;
    Ok(conflicts)
}

/// Write one plan and bump the document revision if anything changed.
fn write_plan(tx: &Transaction<'_>, document: DocumentKind, plan: &ApplyPlan) -> Result<(), StorageError> {
    if plan.is_empty() {
        return Ok(());
    }
    for id in &plan.deletes {
        tx.execute(
            "DELETE FROM nodes WHERE document = ?1 AND id = ?2",
            params![document.as_str(), id.as_str()],
        )?;
    }
    for node in &plan.writes {
        tx.execute(
            "INSERT OR REPLACE INTO nodes
                 (document, id, kind, parent_id, ordinal, fields, last_modified, origin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                document.as_str(),
                node.id.as_str(),
                node.kind.code(),
                node.parent.as_ref().map(NodeId::as_str),
                i64::from(node.ordinal),
                serde_json::to_string(&node.fields)?,
                format_ts(node.last_modified),
                node.origin.as_str(),
            ],
        )?;
    }
    tx.execute(
        "UPDATE documents SET revision = revision + 1 WHERE document = ?1",
        params![document.as_str()],
    )?;
    Ok(())
}

fn insert_log(tx: &Transaction<'_>, entry: &SyncLogEntry) -> Result<u64, StorageError> {
    tx.execute(
        "INSERT INTO sync_log (direction, operation, outcome, requested_at, payload)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.direction.as_str(),
            entry.operation.as_str(),
            entry.outcome.to_string(),
            format_ts(entry.requested_at),
            serde_json::to_string(entry)?,
        ],
    )?;
    to_u64(tx.last_insert_rowid())
}

fn plan_error(document: DocumentKind, err: PlanError) -> StorageError {
    match err {
        PlanError::MissingNode(id) => StorageError::NodeNotFound { document, id },
        PlanError::MissingParent { id, parent } => StorageError::MissingParent { id, parent },
        other => StorageError::InvalidEdit(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Current time truncated to the precision timestamps are stored with.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Corrupt(format!("bad timestamp '{raw}': {err}")))
}

fn to_u64(value: i64) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::Corrupt(format!("negative counter {value}")))
}

fn to_i64(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::Corrupt(format!("counter {value} overflows")))
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
