//! Structure Mapper: source-document tree → candidate target-document tree.
//!
//! Pure and deterministic. Nodes are visited shallowest first so a node's
//! parent is always decided before the node itself:
//!
//! 1. Kinds with no target concept are omitted (never fabricated).
//! 2. A node whose parent has no mapped counterpart is an orphan and is
//!    excluded together with everything below it.
//! 3. Everything else gets its identifier rewritten segment by segment,
//!    keeps prefix, ordinals and origin, and carries only the shared fields
//!    of its kind, copied verbatim.

use std::collections::{BTreeMap, HashMap};

use apqp_core::ident::{self, PathSegment};
use apqp_core::schema::{map_kind, shared_fields};
use apqp_core::tree::DocumentTree;
use apqp_core::types::{Direction, HierarchyNode, NodeId, NodeKind};
use apqp_core::MalformedIdentifierError;

use crate::error::{OrphanMappingError, SyncError};

/// Result of one mapping pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingOutput {
    pub tree: DocumentTree,
    pub orphans: Vec<OrphanMappingError>,
    /// Source nodes whose kind has no target counterpart.
    pub omitted: usize,
}

pub fn map_to_target(source: &DocumentTree, direction: Direction) -> Result<MappingOutput, SyncError> {
    if source.document() != direction.source() {
        return Err(SyncError::DocumentMismatch {
            expected: direction.source(),
            found: source.document(),
        });
    }

    let mut tree = DocumentTree::new(direction.target());
    let mut mapped: HashMap<&NodeId, NodeId> = HashMap::new();
    let mut orphans = Vec::new();
    let mut omitted = 0;

    for node in source.depth_order() {
        let Some(kind) = map_kind(direction, node.kind) else {
            omitted += 1;
            continue;
        };

        let parent = match &node.parent {
            None => None,
            Some(parent) => match mapped.get(parent) {
                Some(mapped_parent) => Some(mapped_parent.clone()),
                None => {
                    orphans.push(OrphanMappingError {
                        node_id: node.id.clone(),
                        parent: parent.clone(),
                        target: direction.target(),
                    });
                    continue;
                }
            },
        };

        let id = translate_id(&node.id, direction)?;
        let fields: BTreeMap<String, String> = shared_fields(node.kind)
            .iter()
            .filter_map(|name| {
                node.fields
                    .get(*name)
                    .map(|value| ((*name).to_string(), value.clone()))
            })
            .collect();

        tree.insert(HierarchyNode {
            id: id.clone(),
            kind,
            parent,
            ordinal: node.ordinal,
            fields,
            last_modified: node.last_modified,
            origin: node.origin,
        })?;
        mapped.insert(&node.id, id);
    }

    if !orphans.is_empty() {
        tracing::warn!(
            direction = %direction,
            orphans = orphans.len(),
            "source nodes excluded from candidate tree"
        );
    }

    Ok(MappingOutput {
        tree,
        orphans,
        omitted,
    })
}

/// Rewrite every type code of `id` into the target document's vocabulary.
pub fn translate_id(id: &NodeId, direction: Direction) -> Result<NodeId, MalformedIdentifierError> {
    let mut decoded = ident::decode(id.as_str())?;
    let unmapped = |code: NodeKind| {
        MalformedIdentifierError::new(
            id.as_str(),
            format!("{code} has no counterpart for {direction}"),
        )
    };
    let kind = decoded.kind;
    decoded.kind = map_kind(direction, kind).ok_or_else(|| unmapped(kind))?;
    decoded.path = decoded
        .path
        .iter()
        .map(|segment| {
            map_kind(direction, segment.kind)
                .map(|kind| PathSegment {
                    kind,
                    ordinal: segment.ordinal,
                })
                .ok_or_else(|| unmapped(segment.kind))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(decoded.to_id())
}
