//! Conflict Detector: candidate target tree vs. current target tree.
//!
//! | Candidate | Target | Target edited after watermark | Result                       |
//! |-----------|--------|-------------------------------|------------------------------|
//! | present   | absent | -                             | `StructuralAdd`              |
//! | absent    | present| no (whole subtree)            | intentional removal          |
//! | absent    | present| yes (any node in subtree)     | `StructuralRemove`           |
//! | present   | present| - (parent/ordinal differ)     | `StructuralMove`             |
//! | present   | present| no (shared field differs)     | field update                 |
//! | present   | present| yes (shared field differs)    | `FieldValueDivergence`       |
//!
//! With no watermark every target node counts as edited.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use apqp_core::schema::{produces, shared_fields};
use apqp_core::tree::DocumentTree;
use apqp_core::types::{
    ConflictId, ConflictKind, ConflictValue, Direction, HierarchyNode, NodeId, SyncConflict,
    SyncWatermark,
};

use crate::error::SyncError;

/// A shared field to overwrite without asking: the target was not edited
/// since the last sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    pub node_id: NodeId,
    pub field: String,
    /// `None` clears the field.
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionReport {
    pub conflicts: Vec<SyncConflict>,
    pub field_updates: Vec<FieldUpdate>,
    /// Roots of subtrees to delete without asking.
    pub removals: Vec<NodeId>,
}

pub fn detect(
    candidate: &DocumentTree,
    current: &DocumentTree,
    watermark: Option<&SyncWatermark>,
    direction: Direction,
    detected_at: DateTime<Utc>,
) -> Result<DetectionReport, SyncError> {
    for tree in [candidate, current] {
        if tree.document() != direction.target() {
            return Err(SyncError::DocumentMismatch {
                expected: direction.target(),
                found: tree.document(),
            });
        }
    }

    let edited = |node: &HierarchyNode| watermark.map_or(true, |w| w.is_edited_after(node));
    let conflict = |node_id: &NodeId,
                    kind: ConflictKind,
                    field: Option<&str>,
                    source_value: ConflictValue,
                    target_value: ConflictValue| SyncConflict {
        id: conflict_id(direction, kind, node_id, field),
        direction,
        node_id: node_id.clone(),
        kind,
        field: field.map(str::to_string),
        source_value,
        target_value,
        detected_at,
    };

    let mut report = DetectionReport::default();

    for incoming in candidate.iter() {
        let Some(existing) = current.get(&incoming.id) else {
            report.conflicts.push(conflict(
                &incoming.id,
                ConflictKind::StructuralAdd,
                None,
                ConflictValue::Node {
                    node: Box::new(incoming.clone()),
                },
                ConflictValue::Absent,
            ));
            continue;
        };

        if incoming.parent != existing.parent || incoming.ordinal != existing.ordinal {
            report.conflicts.push(conflict(
                &incoming.id,
                ConflictKind::StructuralMove,
                None,
                ConflictValue::Position {
                    parent: incoming.parent.clone(),
                    ordinal: incoming.ordinal,
                },
                ConflictValue::Position {
                    parent: existing.parent.clone(),
                    ordinal: existing.ordinal,
                },
            ));
        }

        for &field in shared_fields(existing.kind) {
            let source = incoming.field(field);
            let target = existing.field(field);
            if source == target {
                continue;
            }
            if edited(existing) {
                report.conflicts.push(conflict(
                    &incoming.id,
                    ConflictKind::FieldValueDivergence,
                    Some(field),
                    ConflictValue::field(source),
                    ConflictValue::field(target),
                ));
            } else {
                report.field_updates.push(FieldUpdate {
                    node_id: incoming.id.clone(),
                    field: field.to_string(),
                    value: source.map(str::to_string),
                });
            }
        }
    }

    let vanished: BTreeSet<&NodeId> = current
        .iter()
        .filter(|node| produces(direction, node.kind) && !candidate.contains(&node.id))
        .map(|node| &node.id)
        .collect();

    for &id in &vanished {
        let Some(root) = current.get(id) else {
            continue;
        };
        if root.parent.as_ref().is_some_and(|parent| vanished.contains(parent)) {
            continue;
        }
        if current.subtree(id).into_iter().any(|node| edited(node)) {
            report.conflicts.push(conflict(
                id,
                ConflictKind::StructuralRemove,
                None,
                ConflictValue::Absent,
                ConflictValue::Node {
                    node: Box::new(root.clone()),
                },
            ));
        } else {
            report.removals.push(id.clone());
        }
    }

    report
        .conflicts
        .sort_by(|a, b| a.node_id.cmp(&b.node_id).then_with(|| a.id.cmp(&b.id)));

    tracing::debug!(
        direction = %direction,
        conflicts = report.conflicts.len(),
        field_updates = report.field_updates.len(),
        removals = report.removals.len(),
        "detection finished"
    );
    Ok(report)
}

/// Deterministic id for a divergence: the same divergence detected twice
/// gets the same id.
pub fn conflict_id(
    direction: Direction,
    kind: ConflictKind,
    node_id: &NodeId,
    field: Option<&str>,
) -> ConflictId {
    let kind = kind.to_string();
    let mut hasher = Sha256::new();
    for part in [
        direction.as_str(),
        kind.as_str(),
        node_id.as_str(),
        field.unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    ConflictId(format!("cf-{}", &digest[..16]))
}
