//! Turns decisions into concrete row changes against one target document.
//!
//! A [`PlanBuilder`] starts from the current target tree and records the
//! final state of every node it touches. Touched nodes are stamped with the
//! apply time. Only shared fields are ever written; target-only fields and
//! nodes pass through unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};

use apqp_core::ident;
use apqp_core::tree::{validate_node, DocumentTree};
use apqp_core::types::{
    ConflictKind, ConflictValue, HierarchyNode, NodeId, ResolutionOutcome, SyncConflict,
};

use crate::detector::FieldUpdate;

/// Row changes for one document, committed as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyPlan {
    /// Final state of every added or updated node.
    pub writes: Vec<HierarchyNode>,
    /// Every node removed, descendants included.
    pub deletes: Vec<NodeId>,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ApplyPlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Why a change cannot be applied to the current target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    MissingNode(NodeId),
    AlreadyExists(NodeId),
    MissingParent { id: NodeId, parent: NodeId },
    Unsupported(String),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::MissingNode(id) => write!(f, "node {id} no longer exists in the target"),
            PlanError::AlreadyExists(id) => write!(f, "node {id} already exists in the target"),
            PlanError::MissingParent { id, parent } => {
                write!(f, "parent {parent} of {id} does not exist in the target")
            }
            PlanError::Unsupported(reason) => f.write_str(reason),
        }
    }
}

pub struct PlanBuilder<'a> {
    target: &'a DocumentTree,
    applied_at: DateTime<Utc>,
    touched: BTreeMap<NodeId, HierarchyNode>,
    added: BTreeSet<NodeId>,
    deleted: BTreeSet<NodeId>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(target: &'a DocumentTree, applied_at: DateTime<Utc>) -> Self {
        Self {
            target,
            applied_at,
            touched: BTreeMap::new(),
            added: BTreeSet::new(),
            deleted: BTreeSet::new(),
        }
    }

    /// Whether `id` exists in the target as edited so far.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.exists(id)
    }

    fn exists(&self, id: &NodeId) -> bool {
        !self.deleted.contains(id) && (self.touched.contains_key(id) || self.target.contains(id))
    }

    fn node_mut(&mut self, id: &NodeId) -> Result<&mut HierarchyNode, PlanError> {
        if self.deleted.contains(id) {
            return Err(PlanError::MissingNode(id.clone()));
        }
        if !self.touched.contains_key(id) {
            let node = self
                .target
                .get(id)
                .ok_or_else(|| PlanError::MissingNode(id.clone()))?;
            self.touched.insert(id.clone(), node.clone());
        }
        let applied_at = self.applied_at;
        let node = self
            .touched
            .get_mut(id)
            .ok_or_else(|| PlanError::MissingNode(id.clone()))?;
        node.last_modified = applied_at;
        Ok(node)
    }

    pub fn add_node(&mut self, node: &HierarchyNode) -> Result<(), PlanError> {
        if self.exists(&node.id) {
            return Err(PlanError::AlreadyExists(node.id.clone()));
        }
        if let Some(parent) = &node.parent {
            if !self.exists(parent) {
                return Err(PlanError::MissingParent {
                    id: node.id.clone(),
                    parent: parent.clone(),
                });
            }
        }
        validate_node(self.target.document(), node)
            .map_err(|err| PlanError::Unsupported(err.to_string()))?;
        let mut node = node.clone();
        node.last_modified = self.applied_at;
        self.added.insert(node.id.clone());
        self.deleted.remove(&node.id);
        self.touched.insert(node.id.clone(), node);
        Ok(())
    }

    /// Add `node`, or replace the existing node with the same identifier.
    pub fn put_node(&mut self, node: &HierarchyNode) -> Result<(), PlanError> {
        if !self.exists(&node.id) {
            return self.add_node(node);
        }
        validate_node(self.target.document(), node)
            .map_err(|err| PlanError::Unsupported(err.to_string()))?;
        let existing = self.node_mut(&node.id)?;
        existing.ordinal = node.ordinal;
        existing.fields = node.fields.clone();
        existing.origin = node.origin;
        Ok(())
    }

    pub fn set_field(&mut self, id: &NodeId, field: &str, value: Option<&str>) -> Result<(), PlanError> {
        let node = self.node_mut(id)?;
        match value {
            Some(value) => node.fields.insert(field.to_string(), value.to_string()),
            None => node.fields.remove(field),
        };
        Ok(())
    }

    pub fn move_node(&mut self, id: &NodeId, parent: Option<&NodeId>, ordinal: u32) -> Result<(), PlanError> {
        let document = self.target.document();
        let node = self.node_mut(id)?;
        node.parent = parent.cloned();
        node.ordinal = ordinal;
        validate_node(document, node).map_err(|err| PlanError::Unsupported(err.to_string()))
    }

    /// Remove `id` and every node below it, target-only kinds included.
    pub fn remove_subtree(&mut self, id: &NodeId) -> Result<(), PlanError> {
        if !self.exists(id) {
            return Err(PlanError::MissingNode(id.clone()));
        }
        let doomed: Vec<NodeId> = self
            .target
            .subtree(id)
            .into_iter()
            .map(|node| node.id.clone())
            .collect();
        for id in doomed {
            self.touched.remove(&id);
            self.added.remove(&id);
            self.deleted.insert(id);
        }
        Ok(())
    }

    pub fn apply_field_update(&mut self, update: &FieldUpdate) -> Result<(), PlanError> {
        self.set_field(&update.node_id, &update.field, update.value.as_deref())
    }

    /// Carry out a decision taken for `conflict`. `KeepTarget` changes nothing.
    pub fn apply_decision(
        &mut self,
        conflict: &SyncConflict,
        outcome: ResolutionOutcome,
        manual_value: Option<&str>,
    ) -> Result<(), PlanError> {
        match outcome {
            ResolutionOutcome::KeepTarget => Ok(()),
            ResolutionOutcome::ManualValue => match (&conflict.field, conflict.kind) {
                (Some(field), ConflictKind::FieldValueDivergence) => {
                    self.set_field(&conflict.node_id, field, manual_value)
                }
                _ => Err(PlanError::Unsupported(format!(
                    "ManualValue only applies to field divergences, not {}",
                    conflict.kind
                ))),
            },
            ResolutionOutcome::KeepSource => match (conflict.kind, &conflict.source_value) {
                (ConflictKind::StructuralAdd, ConflictValue::Node { node }) => self.add_node(node),
                (ConflictKind::StructuralRemove, _) => self.remove_subtree(&conflict.node_id),
                (ConflictKind::StructuralMove, ConflictValue::Position { parent, ordinal }) => {
                    self.move_node(&conflict.node_id, parent.as_ref(), *ordinal)
                }
                (ConflictKind::FieldValueDivergence, value) => match &conflict.field {
                    Some(field) => self.set_field(&conflict.node_id, field, field_value(value)),
                    None => Err(PlanError::Unsupported(
                        "field divergence without a field name".to_string(),
                    )),
                },
                (kind, value) => Err(PlanError::Unsupported(format!(
                    "{kind} cannot carry source value {}",
                    value.render()
                ))),
            },
        }
    }

    pub fn finish(self) -> ApplyPlan {
        let target = self.target;
        let deletes: Vec<NodeId> = self
            .deleted
            .into_iter()
            .filter(|id| target.contains(id))
            .collect();
        let added = self.added.len();
        let writes: Vec<HierarchyNode> = self
            .touched
            .into_values()
            .filter(|node| match target.get(&node.id) {
                Some(before) => !same_content(before, node),
                None => true,
            })
            .collect();
        ApplyPlan {
            updated: writes.len().saturating_sub(added),
            removed: deletes.len(),
            writes,
            deletes,
            added,
        }
    }
}

/// Equal in everything but the modification time.
fn same_content(a: &HierarchyNode, b: &HierarchyNode) -> bool {
    a.kind == b.kind
        && a.parent == b.parent
        && a.ordinal == b.ordinal
        && a.fields == b.fields
        && a.origin == b.origin
}

/// Sort key for applying decisions: removals first, then additions parents
/// before children, then moves and field changes.
pub fn apply_order(conflict: &SyncConflict) -> (u8, usize, NodeId) {
    let rank = match conflict.kind {
        ConflictKind::StructuralRemove => 0,
        ConflictKind::StructuralAdd => 1,
        ConflictKind::StructuralMove => 2,
        ConflictKind::FieldValueDivergence => 3,
    };
    let depth = ident::decode(conflict.node_id.as_str())
        .map(|decoded| decoded.depth())
        .unwrap_or_default();
    (rank, depth, conflict.node_id.clone())
}

/// Whether `target` still holds what `conflict` recorded when it was
/// detected. A removal also goes stale when anything in the subtree was
/// edited after detection.
pub fn still_current(conflict: &SyncConflict, target: &DocumentTree) -> bool {
    let existing = target.get(&conflict.node_id);
    match (conflict.kind, existing) {
        (ConflictKind::StructuralAdd, existing) => existing.is_none(),
        (_, None) => false,
        (ConflictKind::FieldValueDivergence, Some(node)) => {
            let field = conflict.field.as_deref().unwrap_or_default();
            ConflictValue::field(node.field(field)) == conflict.target_value
        }
        (ConflictKind::StructuralMove, Some(node)) => {
            conflict.target_value
                == ConflictValue::Position {
                    parent: node.parent.clone(),
                    ordinal: node.ordinal,
                }
        }
        (ConflictKind::StructuralRemove, Some(node)) => {
            let root_unchanged = match &conflict.target_value {
                ConflictValue::Node { node: recorded } => same_content(recorded, node),
                _ => true,
            };
            root_unchanged
                && target
                    .subtree(&conflict.node_id)
                    .into_iter()
                    .all(|node| node.last_modified <= conflict.detected_at)
        }
    }
}

fn field_value(value: &ConflictValue) -> Option<&str> {
    match value {
        ConflictValue::Field { value } => Some(value.as_str()),
        _ => None,
    }
}
