#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use apqp_core::config::Config;
use apqp_core::ident;
use apqp_core::types::{
    Direction, DocumentKind, HierarchyNode, NodeId, ProjectKey, SyncConflict, SyncLogEntry,
    SyncPolicy,
};
use apqp_sync::store::{DocumentSnapshot, LogFilter, NamespaceCommit, NamespaceStore, SyncState};
use apqp_sync::{SqliteStore, StorageError, SyncOrchestrator, SyncRequest};
use chrono::Utc;
use tempfile::TempDir;

pub const FORWARD: Direction = Direction::PfmeaToControlPlan;
pub const BACKWARD: Direction = Direction::ControlPlanToPfmea;

pub fn key() -> ProjectKey {
    ProjectKey::from("brake")
}

/// A node whose kind and parent come from its identifier.
pub fn node(id: &str, origin: DocumentKind, fields: &[(&str, &str)]) -> HierarchyNode {
    let decoded = ident::decode(id).expect("valid id");
    HierarchyNode {
        id: NodeId::from(id),
        kind: decoded.kind,
        parent: decoded.parent().map(|parent| parent.to_id()),
        ordinal: decoded.ordinal,
        fields: fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        last_modified: Utc::now(),
        origin,
    }
}

/// One process with one work element, one characteristic and one risk row.
pub fn weld_pfmea() -> Vec<HierarchyNode> {
    let pfmea = DocumentKind::Pfmea;
    vec![
        node("PRJ-P-001", pfmea, &[("name", "Weld"), ("description", "MIG weld bracket")]),
        node(
            "PRJ-WE-P001-001",
            pfmea,
            &[("name", "Station 1"), ("equipment", "camera"), ("detection_method", "visual")],
        ),
        node(
            "PRJ-PC-P001-WE001-001",
            pfmea,
            &[("characteristic", "bead width"), ("specification", "4 +/- 0.5 mm")],
        ),
        node("PRJ-FM-P001-WE001-001", pfmea, &[("failure_mode", "porosity"), ("severity", "7")]),
    ]
}

pub fn request(direction: Direction, policy: SyncPolicy) -> SyncRequest {
    SyncRequest {
        policy,
        ..SyncRequest::new(key(), direction, &Config::default())
    }
}

/// Let the clock move past the last apply before editing by hand.
pub fn tick() {
    std::thread::sleep(Duration::from_millis(5));
}

pub async fn sqlite_orchestrator(home: &TempDir) -> SyncOrchestrator<SqliteStore> {
    let orch = SyncOrchestrator::open_at(home.path());
    orch.ensure_ready(&key(), Duration::from_secs(10))
        .await
        .expect("ready");
    orch
}

pub fn load(store: &SqliteStore, document: DocumentKind) -> DocumentSnapshot {
    store.load_document(&key(), document).expect("load")
}

pub fn field(store: &SqliteStore, document: DocumentKind, id: &str, name: &str) -> Option<String> {
    load(store, document)
        .tree
        .get(&NodeId::from(id))
        .and_then(|node| node.field(name).map(str::to_string))
}

pub fn log(store: &impl NamespaceStore) -> Vec<SyncLogEntry> {
    store
        .query_log(&key(), &LogFilter::default(), None, 100)
        .expect("log")
}

// ---------------------------------------------------------------------------
// Instrumented store
// ---------------------------------------------------------------------------

type Hook = Box<dyn Fn(&SqliteStore, &ProjectKey) + Send + Sync>;

/// Delegates to SQLite, counting commits that overlap and optionally running
/// a hook or a delay before each commit or provisioning.
pub struct InstrumentedStore {
    pub inner: SqliteStore,
    commit_delay: Duration,
    provision_delay: Duration,
    pub provisions: AtomicUsize,
    before_commit: Option<Hook>,
    in_flight: Mutex<HashMap<ProjectKey, usize>>,
    total_in_flight: AtomicUsize,
    pub max_per_project: AtomicUsize,
    pub max_total: AtomicUsize,
}

impl InstrumentedStore {
    pub fn new(home: &TempDir) -> Self {
        Self {
            inner: SqliteStore::new(home.path()),
            commit_delay: Duration::ZERO,
            provision_delay: Duration::ZERO,
            provisions: AtomicUsize::new(0),
            before_commit: None,
            in_flight: Mutex::new(HashMap::new()),
            total_in_flight: AtomicUsize::new(0),
            max_per_project: AtomicUsize::new(0),
            max_total: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = delay;
        self
    }

    pub fn with_hook(mut self, hook: impl Fn(&SqliteStore, &ProjectKey) + Send + Sync + 'static) -> Self {
        self.before_commit = Some(Box::new(hook));
        self
    }

    pub fn committing(&self) -> usize {
        self.total_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, key: &ProjectKey) {
        let mut map = self.in_flight.lock().expect("in-flight lock");
        let count = map.entry(key.clone()).or_default();
        *count += 1;
        self.max_per_project.fetch_max(*count, Ordering::SeqCst);
        let total = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total.fetch_max(total, Ordering::SeqCst);
    }

    fn leave(&self, key: &ProjectKey) {
        let mut map = self.in_flight.lock().expect("in-flight lock");
        if let Some(count) = map.get_mut(key) {
            *count -= 1;
        }
        self.total_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NamespaceStore for InstrumentedStore {
    fn provision(&self, key: &ProjectKey) -> Result<(), StorageError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.provision_delay);
        self.inner.provision(key)
    }

    fn is_provisioned(&self, key: &ProjectKey) -> bool {
        self.inner.is_provisioned(key)
    }

    fn load_document(
        &self,
        key: &ProjectKey,
        document: DocumentKind,
    ) -> Result<DocumentSnapshot, StorageError> {
        self.inner.load_document(key, document)
    }

    fn load_sync_state(
        &self,
        key: &ProjectKey,
        direction: Direction,
    ) -> Result<SyncState, StorageError> {
        self.inner.load_sync_state(key, direction)
    }

    fn pending_conflicts(
        &self,
        key: &ProjectKey,
        direction: Option<Direction>,
    ) -> Result<Vec<SyncConflict>, StorageError> {
        self.inner.pending_conflicts(key, direction)
    }

    fn commit(
        &self,
        key: &ProjectKey,
        commit: &NamespaceCommit,
        deadline: Option<Instant>,
    ) -> Result<u64, StorageError> {
        self.enter(key);
        if let Some(hook) = &self.before_commit {
            hook(&self.inner, key);
        }
        std::thread::sleep(self.commit_delay);
        let result = self.inner.commit(key, commit, deadline);
        self.leave(key);
        result
    }

    fn append_log(&self, key: &ProjectKey, entry: &SyncLogEntry) -> Result<u64, StorageError> {
        self.inner.append_log(key, entry)
    }

    fn query_log(
        &self,
        key: &ProjectKey,
        filter: &LogFilter,
        before: Option<u64>,
        limit: usize,
    ) -> Result<Vec<SyncLogEntry>, StorageError> {
        self.inner.query_log(key, filter, before, limit)
    }
}

pub async fn instrumented_orchestrator(store: InstrumentedStore, keys: &[ProjectKey]) -> Arc<SyncOrchestrator<InstrumentedStore>> {
    let orch = Arc::new(SyncOrchestrator::new(Arc::new(store)));
    for key in keys {
        orch.ensure_ready(key, Duration::from_secs(10))
            .await
            .expect("ready");
        orch.store()
            .inner
            .replace_document(key, DocumentKind::Pfmea, weld_pfmea())
            .expect("seed");
    }
    orch
}
