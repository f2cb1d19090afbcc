//! apqp core library: domain types, identifier codec, document schemas,
//! tree validation, config and errors.
//!
//! - [`types`]: newtypes and domain structs shared by every crate
//! - [`ident`]: encode/decode of hybrid hierarchical identifiers
//! - [`schema`]: fixed node kinds per document and the PFMEA ↔ control-plan pairing
//! - [`tree`]: validated per-document node snapshots
//! - [`config`] and [`paths`]: `~/.apqp/` layout and defaults

pub mod config;
pub mod error;
pub mod ident;
pub mod paths;
pub mod schema;
pub mod tree;
pub mod types;

pub use config::Config;
pub use error::{ConfigError, InvalidProjectKey, MalformedIdentifierError, TreeError};
pub use ident::{DecodedId, PathSegment};
pub use tree::DocumentTree;
pub use types::{
    Acknowledgement, ConflictId, ConflictKind, ConflictResolution, ConflictSummary,
    ConflictValue, Direction, DocumentKind, HierarchyNode, LogOperation, NodeId, NodeKind,
    ProjectKey, ProjectNamespace, ReadinessState, ResolutionOutcome, SyncConflict, SyncLogEntry,
    SyncOutcome, SyncPolicy, SyncWatermark,
};
