//! apqp sync engine: keeps the PFMEA and the Control Plan of one project
//! structurally aligned.
//!
//! Pipeline for one sync (see [`orchestrator`]):
//!
//! 1. [`lock`]: per-project serialization
//! 2. [`namespace`]: provision the project's storage once
//! 3. [`mapper`]: source tree → candidate target tree
//! 4. [`detector`]: candidate vs. current target, gated by the watermark
//! 5. [`resolver`]: policy, acknowledgements, deletion guard
//! 6. [`plan`] + [`store`]: one transaction for rows, watermark, pending set and log entry

pub mod detector;
pub mod error;
pub mod lock;
pub mod log;
pub mod mapper;
pub mod namespace;
pub mod orchestrator;
pub mod plan;
pub mod resolver;
pub mod retry;
pub mod sqlite;
pub mod store;

pub use error::{OrphanMappingError, StorageError, SyncError};
pub use log::{LogPage, LogPages, LogQuery};
pub use orchestrator::{
    ProjectStatus, RejectedResolution, ResolutionResult, SyncOrchestrator, SyncRequest,
    SyncResponse,
};
pub use retry::with_backoff;
pub use sqlite::SqliteStore;
pub use store::{LogFilter, NamespaceStore};
