//! Domain types shared by the sync engine, the daemon and the CLI.
//!
//! Every type here is serde-serializable: the same structs travel over the
//! daemon socket, land in JSON columns of the namespace database, and are
//! printed by `apqp --json`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidProjectKey;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Key of one project's isolated storage namespace.
    ProjectKey
);

string_newtype!(
    /// A hybrid hierarchical identifier, e.g. `PRJ-D-P001-001`.
    ///
    /// Ordering is plain string ordering; for siblings this equals ordinal
    /// order because ordinals are zero-padded to a fixed width per kind.
    NodeId
);

string_newtype!(
    /// Deterministic identifier of a detected conflict (`cf-<hex>`).
    ConflictId
);

impl ProjectKey {
    /// Reject keys that cannot be used as a directory name.
    pub fn validate(&self) -> Result<(), InvalidProjectKey> {
        let valid = !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            && !self.0.starts_with('-');
        if valid {
            Ok(())
        } else {
            Err(InvalidProjectKey(self.0.clone()))
        }
    }
}

// ---------------------------------------------------------------------------
// Document and node kinds
// ---------------------------------------------------------------------------

/// The two document types kept structurally consistent with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Process failure mode and effects analysis.
    Pfmea,
    ControlPlan,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 2] = [DocumentKind::Pfmea, DocumentKind::ControlPlan];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Pfmea => "pfmea",
            DocumentKind::ControlPlan => "control_plan",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pfmea" => Ok(DocumentKind::Pfmea),
            "control_plan" | "cp" => Ok(DocumentKind::ControlPlan),
            other => Err(format!(
                "unknown document '{other}'; expected: pfmea, control-plan"
            )),
        }
    }
}

/// Node kinds across both documents. The serialized form is the type code
/// used inside identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    #[serde(rename = "P")]
    Process,
    #[serde(rename = "WE")]
    WorkElement,
    #[serde(rename = "PC")]
    ProductCharacteristic,
    #[serde(rename = "FM")]
    FailureMode,
    #[serde(rename = "D")]
    Detector,
    #[serde(rename = "CI")]
    ControlItem,
    #[serde(rename = "CM")]
    ControlMethod,
    #[serde(rename = "RP")]
    ReactionPlan,
}

impl NodeKind {
    pub const ALL: [NodeKind; 8] = [
        NodeKind::Process,
        NodeKind::WorkElement,
        NodeKind::ProductCharacteristic,
        NodeKind::FailureMode,
        NodeKind::Detector,
        NodeKind::ControlItem,
        NodeKind::ControlMethod,
        NodeKind::ReactionPlan,
    ];

    /// Short uppercase code used in identifiers.
    pub fn code(self) -> &'static str {
        match self {
            NodeKind::Process => "P",
            NodeKind::WorkElement => "WE",
            NodeKind::ProductCharacteristic => "PC",
            NodeKind::FailureMode => "FM",
            NodeKind::Detector => "D",
            NodeKind::ControlItem => "CI",
            NodeKind::ControlMethod => "CM",
            NodeKind::ReactionPlan => "RP",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Number of digits every ordinal of this kind is padded to.
    pub fn ordinal_width(self) -> usize {
        match self {
            NodeKind::ControlMethod | NodeKind::ReactionPlan => 2,
            _ => 3,
        }
    }

    /// Largest ordinal that fits in [`Self::ordinal_width`] digits.
    pub fn max_ordinal(self) -> u32 {
        10u32.pow(self.ordinal_width() as u32) - 1
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Direction of one sync: which document is the source and which the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    PfmeaToControlPlan,
    ControlPlanToPfmea,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::PfmeaToControlPlan, Direction::ControlPlanToPfmea];

    pub fn source(self) -> DocumentKind {
        match self {
            Direction::PfmeaToControlPlan => DocumentKind::Pfmea,
            Direction::ControlPlanToPfmea => DocumentKind::ControlPlan,
        }
    }

    pub fn target(self) -> DocumentKind {
        match self {
            Direction::PfmeaToControlPlan => DocumentKind::ControlPlan,
            Direction::ControlPlanToPfmea => DocumentKind::Pfmea,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::PfmeaToControlPlan => Direction::ControlPlanToPfmea,
            Direction::ControlPlanToPfmea => Direction::PfmeaToControlPlan,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::PfmeaToControlPlan => "pfmea_to_control_plan",
            Direction::ControlPlanToPfmea => "control_plan_to_pfmea",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pfmea_to_control_plan" | "forward" => Ok(Direction::PfmeaToControlPlan),
            "control_plan_to_pfmea" | "backward" => Ok(Direction::ControlPlanToPfmea),
            other => Err(format!(
                "unknown direction '{other}'; expected: pfmea-to-control-plan, control-plan-to-pfmea"
            )),
        }
    }
}

/// Caller-selected rule for resolving conflicts automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    SourceWins,
    TargetWins,
    #[default]
    ManualOnly,
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPolicy::SourceWins => write!(f, "source_wins"),
            SyncPolicy::TargetWins => write!(f, "target_wins"),
            SyncPolicy::ManualOnly => write!(f, "manual_only"),
        }
    }
}

impl FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "source_wins" => Ok(SyncPolicy::SourceWins),
            "target_wins" => Ok(SyncPolicy::TargetWins),
            "manual_only" | "manual" => Ok(SyncPolicy::ManualOnly),
            other => Err(format!(
                "unknown policy '{other}'; expected: source-wins, target-wins, manual-only"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes and watermarks
// ---------------------------------------------------------------------------

/// One node of either document's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<NodeId>,
    /// Display position among siblings (1-based).
    pub ordinal: u32,
    /// Field name → value. Shared fields are copied verbatim by the mapper.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
    /// Document the node was first authored in.
    pub origin: DocumentKind,
}

impl HierarchyNode {
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Last structure successfully applied in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub direction: Direction,
    pub synced_at: DateTime<Utc>,
    /// Incremented on every successful apply in this direction.
    pub version: u64,
    /// Nodes whose divergence was left pending or kept in favour of the
    /// target. They count as locally edited regardless of `synced_at`.
    #[serde(default)]
    pub held: BTreeSet<NodeId>,
}

impl SyncWatermark {
    /// Whether `node` was changed on the target side after this watermark.
    pub fn is_edited_after(&self, node: &HierarchyNode) -> bool {
        node.last_modified > self.synced_at || self.held.contains(&node.id)
    }
}

// ---------------------------------------------------------------------------
// Conflicts and resolutions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    StructuralAdd,
    StructuralRemove,
    StructuralMove,
    FieldValueDivergence,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConflictKind::StructuralAdd => "StructuralAdd",
            ConflictKind::StructuralRemove => "StructuralRemove",
            ConflictKind::StructuralMove => "StructuralMove",
            ConflictKind::FieldValueDivergence => "FieldValueDivergence",
        };
        f.write_str(label)
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictValue {
    Absent,
    Field {
        value: String,
    },
    Position {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<NodeId>,
        ordinal: u32,
    },
    Node {
        node: Box<HierarchyNode>,
    },
}

impl ConflictValue {
    pub fn field(value: Option<&str>) -> Self {
        match value {
            Some(value) => ConflictValue::Field {
                value: value.to_string(),
            },
            None => ConflictValue::Absent,
        }
    }

    /// Short human-readable rendering for summaries and CLI output.
    pub fn render(&self) -> String {
        match self {
            ConflictValue::Absent => "<absent>".to_string(),
            ConflictValue::Field { value } => format!("{value:?}"),
            ConflictValue::Position { parent, ordinal } => match parent {
                Some(parent) => format!("{parent} #{ordinal}"),
                None => format!("<root> #{ordinal}"),
            },
            ConflictValue::Node { node } => format!("{} ({})", node.id, node.kind),
        }
    }
}

/// A divergence detected between the mapped source and the current target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    pub direction: Direction,
    pub node_id: NodeId,
    pub kind: ConflictKind,
    /// Set for [`ConflictKind::FieldValueDivergence`] only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub source_value: ConflictValue,
    pub target_value: ConflictValue,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    KeepSource,
    KeepTarget,
    ManualValue,
}

impl fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionOutcome::KeepSource => write!(f, "KeepSource"),
            ResolutionOutcome::KeepTarget => write!(f, "KeepTarget"),
            ResolutionOutcome::ManualValue => write!(f, "ManualValue"),
        }
    }
}

impl FromStr for ResolutionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "keepsource" | "source" => Ok(ResolutionOutcome::KeepSource),
            "keeptarget" | "target" => Ok(ResolutionOutcome::KeepTarget),
            "manualvalue" | "manual" => Ok(ResolutionOutcome::ManualValue),
            other => Err(format!(
                "unknown resolution '{other}'; expected: keep-source, keep-target, manual-value"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: ConflictId,
    pub outcome: ResolutionOutcome,
    /// Required when `outcome` is [`ResolutionOutcome::ManualValue`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub resolver: String,
    pub resolved_at: DateTime<Utc>,
}

/// A human decision remembered so the same conflict is not raised again while
/// neither side changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub conflict_id: ConflictId,
    pub direction: Direction,
    pub source_value: ConflictValue,
    pub target_value: ConflictValue,
    pub resolution: ConflictResolution,
}

// ---------------------------------------------------------------------------
// Namespaces and the sync log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ReadinessState {
    Uninitialized,
    Provisioning,
    Ready,
    Failed(String),
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::Uninitialized => write!(f, "uninitialized"),
            ReadinessState::Provisioning => write!(f, "provisioning"),
            ReadinessState::Ready => write!(f, "ready"),
            ReadinessState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// One project's isolated storage area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectNamespace {
    pub key: ProjectKey,
    pub state: ReadinessState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncOutcome {
    Success,
    PartialSuccess,
    Failed,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Success => write!(f, "Success"),
            SyncOutcome::PartialSuccess => write!(f, "PartialSuccess"),
            SyncOutcome::Failed => write!(f, "Failed"),
        }
    }
}

impl FromStr for SyncOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "success" => Ok(SyncOutcome::Success),
            "partialsuccess" | "partial" => Ok(SyncOutcome::PartialSuccess),
            "failed" => Ok(SyncOutcome::Failed),
            other => Err(format!(
                "unknown outcome '{other}'; expected: success, partial-success, failed"
            )),
        }
    }
}

/// What kind of operation a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogOperation {
    #[default]
    Sync,
    /// A batch of manual conflict resolutions.
    Resolution,
}

impl LogOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            LogOperation::Sync => "sync",
            LogOperation::Resolution => "resolution",
        }
    }
}

/// Compact description of a conflict as reported in responses and the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSummary {
    pub id: ConflictId,
    pub node_id: NodeId,
    pub kind: ConflictKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub source_value: String,
    pub target_value: String,
    /// `None` while the conflict is pending manual resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionOutcome>,
}

impl ConflictSummary {
    pub fn new(conflict: &SyncConflict, resolution: Option<ResolutionOutcome>) -> Self {
        Self {
            id: conflict.id.clone(),
            node_id: conflict.node_id.clone(),
            kind: conflict.kind,
            field: conflict.field.clone(),
            source_value: conflict.source_value.render(),
            target_value: conflict.target_value.render(),
            resolution,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }
}

/// Immutable record of one sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Assigned by the log store on append; `0` before that.
    #[serde(default)]
    pub seq: u64,
    pub project: ProjectKey,
    pub direction: Direction,
    #[serde(default)]
    pub operation: LogOperation,
    pub requested_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: SyncOutcome,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Source nodes excluded because their parent had no mapped counterpart.
    #[serde(default)]
    pub orphans: usize,
    #[serde(default)]
    pub conflicts: Vec<ConflictSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
