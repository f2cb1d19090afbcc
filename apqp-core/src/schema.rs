//! Fixed document schemas and the PFMEA ↔ control-plan kind pairing.
//!
//! ```text
//! PFMEA                          Control plan
//! P   process step        <->    P   process
//! WE  work element        <->    D   detector
//! PC  product charact.    <->    CI  control item
//! FM  failure mode        (risk analysis, never mapped)
//!                                CM  control method  (control plan only)
//!                                RP  reaction plan   (control plan only)
//! ```

use crate::types::{Direction, DocumentKind, NodeKind};

/// Kinds that may appear in `document`.
pub fn document_kinds(document: DocumentKind) -> &'static [NodeKind] {
    match document {
        DocumentKind::Pfmea => &[
            NodeKind::Process,
            NodeKind::WorkElement,
            NodeKind::ProductCharacteristic,
            NodeKind::FailureMode,
        ],
        DocumentKind::ControlPlan => &[
            NodeKind::Process,
            NodeKind::Detector,
            NodeKind::ControlItem,
            NodeKind::ControlMethod,
            NodeKind::ReactionPlan,
        ],
    }
}

pub fn document_allows(document: DocumentKind, kind: NodeKind) -> bool {
    document_kinds(document).contains(&kind)
}

/// Kind of the parent a node of `kind` must have; `None` for roots.
pub fn parent_kind(kind: NodeKind) -> Option<NodeKind> {
    match kind {
        NodeKind::Process => None,
        NodeKind::WorkElement | NodeKind::Detector => Some(NodeKind::Process),
        NodeKind::ProductCharacteristic | NodeKind::FailureMode => Some(NodeKind::WorkElement),
        NodeKind::ControlItem => Some(NodeKind::Detector),
        NodeKind::ControlMethod | NodeKind::ReactionPlan => Some(NodeKind::ControlItem),
    }
}

/// Fields carried across documents for nodes of `kind`. Everything else on a
/// node is local to its document.
pub fn shared_fields(kind: NodeKind) -> &'static [&'static str] {
    match kind {
        NodeKind::Process => &["name", "description"],
        NodeKind::WorkElement | NodeKind::Detector => &["name", "equipment", "detection_method"],
        NodeKind::ProductCharacteristic | NodeKind::ControlItem => {
            &["characteristic", "specification", "special_class"]
        }
        NodeKind::FailureMode | NodeKind::ControlMethod | NodeKind::ReactionPlan => &[],
    }
}

/// Target-side kind for a source node of `kind`, or `None` when the target
/// document has no corresponding concept.
pub fn map_kind(direction: Direction, kind: NodeKind) -> Option<NodeKind> {
    match (direction, kind) {
        (_, NodeKind::Process) => Some(NodeKind::Process),
        (Direction::PfmeaToControlPlan, NodeKind::WorkElement) => Some(NodeKind::Detector),
        (Direction::PfmeaToControlPlan, NodeKind::ProductCharacteristic) => {
            Some(NodeKind::ControlItem)
        }
        (Direction::ControlPlanToPfmea, NodeKind::Detector) => Some(NodeKind::WorkElement),
        (Direction::ControlPlanToPfmea, NodeKind::ControlItem) => {
            Some(NodeKind::ProductCharacteristic)
        }
        _ => None,
    }
}

/// Whether a sync in `direction` can ever produce target nodes of `kind`.
///
/// Target nodes of other kinds are outside the sync's scope and are never
/// added, moved or removed on their own.
pub fn produces(direction: Direction, kind: NodeKind) -> bool {
    document_kinds(direction.source())
        .iter()
        .any(|source| map_kind(direction, *source) == Some(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_bijective_on_mapped_kinds() {
        for kind in document_kinds(DocumentKind::Pfmea) {
            if let Some(target) = map_kind(Direction::PfmeaToControlPlan, *kind) {
                assert_eq!(
                    map_kind(Direction::ControlPlanToPfmea, target),
                    Some(*kind),
                    "{kind} should map back to itself"
                );
                assert_eq!(shared_fields(*kind), shared_fields(target));
            }
        }
    }

    #[test]
    fn mapped_kinds_belong_to_target_document() {
        for direction in Direction::ALL {
            for kind in document_kinds(direction.source()) {
                if let Some(target) = map_kind(direction, *kind) {
                    assert!(document_allows(direction.target(), target));
                }
            }
        }
    }

    #[test]
    fn risk_and_reaction_kinds_are_never_produced() {
        assert!(!produces(Direction::ControlPlanToPfmea, NodeKind::FailureMode));
        assert!(!produces(Direction::PfmeaToControlPlan, NodeKind::ReactionPlan));
        assert!(!produces(Direction::PfmeaToControlPlan, NodeKind::ControlMethod));
        assert!(produces(Direction::PfmeaToControlPlan, NodeKind::Detector));
    }

    #[test]
    fn parent_chain_matches_documents() {
        for document in DocumentKind::ALL {
            for kind in document_kinds(document) {
                if let Some(parent) = parent_kind(*kind) {
                    assert!(document_allows(document, parent));
                }
            }
        }
    }
}
