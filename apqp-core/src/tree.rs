//! Identifier-indexed snapshot of one document.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MalformedIdentifierError, TreeError};
use crate::ident;
use crate::schema::document_allows;
use crate::types::{DocumentKind, HierarchyNode, NodeId};

/// All nodes of one document, keyed by identifier.
///
/// Every node is validated on insert: its identifier must decode, the decoded
/// kind must equal `node.kind` and belong to the document, and `node.parent`
/// must equal the identifier-derived parent. A parent that is absent from the
/// snapshot is allowed here; the mapper reports such nodes as orphans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTree {
    document: DocumentKind,
    nodes: BTreeMap<NodeId, HierarchyNode>,
}

impl DocumentTree {
    pub fn new(document: DocumentKind) -> Self {
        Self {
            document,
            nodes: BTreeMap::new(),
        }
    }

    pub fn from_nodes(
        document: DocumentKind,
        nodes: impl IntoIterator<Item = HierarchyNode>,
    ) -> Result<Self, TreeError> {
        let mut tree = Self::new(document);
        for node in nodes {
            tree.insert(node)?;
        }
        Ok(tree)
    }

    pub fn document(&self) -> DocumentKind {
        self.document
    }

    /// Insert a new node. Fails on duplicates and on identifier mismatches.
    pub fn insert(&mut self, node: HierarchyNode) -> Result<(), TreeError> {
        validate_node(self.document, &node)?;
        if self.nodes.contains_key(&node.id) {
            return Err(TreeError::Duplicate(node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Insert or replace a node.
    pub fn upsert(&mut self, node: HierarchyNode) -> Result<Option<HierarchyNode>, TreeError> {
        validate_node(self.document, &node)?;
        Ok(self.nodes.insert(node.id.clone(), node))
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<HierarchyNode> {
        self.nodes.remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&HierarchyNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut HierarchyNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &HierarchyNode> {
        self.nodes.values()
    }

    pub fn ids(&self) -> BTreeSet<&NodeId> {
        self.nodes.keys().collect()
    }

    /// Direct children of `id`, by ordinal then identifier.
    pub fn children(&self, id: &NodeId) -> Vec<&HierarchyNode> {
        let mut children: Vec<&HierarchyNode> = self
            .nodes
            .values()
            .filter(|node| node.parent.as_ref() == Some(id))
            .collect();
        children.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then_with(|| a.id.cmp(&b.id)));
        children
    }

    /// `id` followed by every node below it, parents before children.
    pub fn subtree(&self, id: &NodeId) -> Vec<&HierarchyNode> {
        let mut children_of: BTreeMap<&NodeId, Vec<&HierarchyNode>> = BTreeMap::new();
        for node in self.nodes.values() {
            if let Some(parent) = &node.parent {
                children_of.entry(parent).or_default().push(node);
            }
        }

        let Some(root) = self.nodes.get(id) else {
            return Vec::new();
        };
        let mut out = vec![root];
        let mut cursor = 0;
        while cursor < out.len() {
            if let Some(children) = children_of.get(&out[cursor].id) {
                out.extend(children.iter().copied());
            }
            cursor += 1;
        }
        out
    }

    /// Nodes ordered shallowest first, then by identifier.
    ///
    /// Depth comes from the identifier, which was validated on insert.
    pub fn depth_order(&self) -> Vec<&HierarchyNode> {
        let mut nodes: Vec<(usize, &HierarchyNode)> = self
            .nodes
            .values()
            .map(|node| {
                let depth = ident::decode(node.id.as_str())
                    .map(|decoded| decoded.depth())
                    .unwrap_or_default();
                (depth, node)
            })
            .collect();
        nodes.sort_by(|(da, a), (db, b)| da.cmp(db).then_with(|| a.id.cmp(&b.id)));
        nodes.into_iter().map(|(_, node)| node).collect()
    }
}

/// Check a node against its identifier and its document's schema.
pub fn validate_node(document: DocumentKind, node: &HierarchyNode) -> Result<(), MalformedIdentifierError> {
    let decoded = ident::decode(node.id.as_str())?;
    if decoded.kind != node.kind {
        return Err(MalformedIdentifierError::new(
            node.id.as_str(),
            format!("identifier encodes {} but node kind is {}", decoded.kind, node.kind),
        ));
    }
    if !document_allows(document, node.kind) {
        return Err(MalformedIdentifierError::new(
            node.id.as_str(),
            format!("{} nodes do not belong in the {document} document", node.kind),
        ));
    }
    let derived_parent = decoded.parent().map(|parent| parent.to_id());
    if derived_parent != node.parent {
        return Err(MalformedIdentifierError::new(
            node.id.as_str(),
            format!(
                "parent field {} does not match identifier-derived parent {}",
                display_parent(node.parent.as_ref()),
                display_parent(derived_parent.as_ref()),
            ),
        ));
    }
    if node.ordinal == 0 {
        return Err(MalformedIdentifierError::new(
            node.id.as_str(),
            "sibling ordinal must be 1-based",
        ));
    }
    Ok(())
}

fn display_parent(parent: Option<&NodeId>) -> String {
    parent.map_or_else(|| "<root>".to_string(), |id| id.to_string())
}
