//! Identifier codec for hybrid hierarchical identifiers.
//!
//! # Grammar
//!
//! ```text
//! PREFIX-TYPE[-SEG]*-SEQ
//!
//! PREFIX  [A-Za-z0-9]+          project tag
//! TYPE    P | WE | PC | FM | D | CI | CM | RP
//! SEG     <TYPE><ordinal>       one per ancestor, outermost first
//! SEQ     <ordinal>             the node's own ordinal
//! ```
//!
//! Every ordinal is 1-based and zero-padded to its kind's fixed width, so for
//! siblings lexicographic order of the identifier equals ordinal order.
//!
//! This module is the only place the string form is handled; everything else
//! works on [`DecodedId`].

use std::fmt;

use crate::error::MalformedIdentifierError;
use crate::schema::parent_kind;
use crate::types::{NodeId, NodeKind};

const SEPARATOR: char = '-';

/// One ancestor reference inside an identifier path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub kind: NodeKind,
    pub ordinal: u32,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:0width$}",
            self.kind.code(),
            self.ordinal,
            width = self.kind.ordinal_width()
        )
    }
}

/// Structured form of a [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedId {
    pub prefix: String,
    pub kind: NodeKind,
    /// Ancestors, outermost first.
    pub path: Vec<PathSegment>,
    pub ordinal: u32,
}

impl DecodedId {
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Path of this node's own children: ancestors plus this node.
    pub fn lineage(&self) -> Vec<PathSegment> {
        let mut lineage = self.path.clone();
        lineage.push(PathSegment {
            kind: self.kind,
            ordinal: self.ordinal,
        });
        lineage
    }

    pub fn parent(&self) -> Option<DecodedId> {
        let mut path = self.path.clone();
        let last = path.pop()?;
        Some(DecodedId {
            prefix: self.prefix.clone(),
            kind: last.kind,
            path,
            ordinal: last.ordinal,
        })
    }

    pub fn to_id(&self) -> NodeId {
        NodeId(self.to_string())
    }
}

impl fmt::Display for DecodedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.prefix, self.kind.code())?;
        for segment in &self.path {
            write!(f, "{SEPARATOR}{segment}")?;
        }
        write!(
            f,
            "{SEPARATOR}{:0width$}",
            self.ordinal,
            width = self.kind.ordinal_width()
        )
    }
}

/// Encode a new identifier for a node of `kind` under `parent`.
///
/// Roots take `prefix` directly; children inherit the parent's prefix and
/// `prefix` must match it.
pub fn encode(
    prefix: &str,
    kind: NodeKind,
    parent: Option<&NodeId>,
    ordinal: u32,
) -> Result<NodeId, MalformedIdentifierError> {
    let path = match parent {
        Some(parent_id) => {
            let parent = decode(parent_id.as_str())?;
            if parent.prefix != prefix {
                return Err(MalformedIdentifierError::new(
                    parent_id.as_str(),
                    format!("parent prefix '{}' differs from '{prefix}'", parent.prefix),
                ));
            }
            parent.lineage()
        }
        None => Vec::new(),
    };

    let decoded = DecodedId {
        prefix: prefix.to_string(),
        kind,
        path,
        ordinal,
    };
    let rendered = decoded.to_string();
    check_prefix(&rendered, prefix)?;
    check_ordinal(&rendered, kind, ordinal)?;
    check_chain(&rendered, &decoded)?;
    Ok(NodeId(rendered))
}

/// Decode `id` into its structured form.
pub fn decode(id: &str) -> Result<DecodedId, MalformedIdentifierError> {
    let parts: Vec<&str> = id.split(SEPARATOR).collect();
    if parts.len() < 3 {
        return Err(MalformedIdentifierError::new(
            id,
            "expected at least PREFIX-TYPE-SEQ",
        ));
    }

    let prefix = parts[0];
    check_prefix(id, prefix)?;

    let kind = NodeKind::from_code(parts[1])
        .ok_or_else(|| MalformedIdentifierError::new(id, format!("unknown type code '{}'", parts[1])))?;

    let seq = parts[parts.len() - 1];
    let ordinal = parse_ordinal(id, kind, seq)?;

    let path = parts[2..parts.len() - 1]
        .iter()
        .map(|segment| parse_segment(id, segment))
        .collect::<Result<Vec<_>, _>>()?;

    let decoded = DecodedId {
        prefix: prefix.to_string(),
        kind,
        path,
        ordinal,
    };
    check_chain(id, &decoded)?;
    Ok(decoded)
}

/// Whether `id` lies strictly below `ancestor` in the same hierarchy.
pub fn is_descendant(id: &NodeId, ancestor: &NodeId) -> Result<bool, MalformedIdentifierError> {
    let node = decode(id.as_str())?;
    let ancestor = decode(ancestor.as_str())?;
    if node.prefix != ancestor.prefix {
        return Ok(false);
    }
    let lineage = ancestor.lineage();
    Ok(node.path.len() >= lineage.len() && node.path[..lineage.len()] == lineage[..])
}

/// Parent identifier derived from `id` alone.
pub fn parent_of(id: &NodeId) -> Result<Option<NodeId>, MalformedIdentifierError> {
    Ok(decode(id.as_str())?.parent().map(|parent| parent.to_id()))
}

fn parse_segment(id: &str, segment: &str) -> Result<PathSegment, MalformedIdentifierError> {
    let split = segment
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| MalformedIdentifierError::new(id, format!("path segment '{segment}' has no ordinal")))?;
    let (code, digits) = segment.split_at(split);
    let kind = NodeKind::from_code(code).ok_or_else(|| {
        MalformedIdentifierError::new(id, format!("unknown type code '{code}' in path segment"))
    })?;
    let ordinal = parse_ordinal(id, kind, digits)?;
    Ok(PathSegment { kind, ordinal })
}

fn parse_ordinal(id: &str, kind: NodeKind, digits: &str) -> Result<u32, MalformedIdentifierError> {
    let width = kind.ordinal_width();
    if digits.len() != width || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(MalformedIdentifierError::new(
            id,
            format!("ordinal '{digits}' for {kind} must be exactly {width} digits"),
        ));
    }
    let ordinal: u32 = digits
        .parse()
        .map_err(|_| MalformedIdentifierError::new(id, format!("ordinal '{digits}' is not a number")))?;
    if ordinal == 0 {
        return Err(MalformedIdentifierError::new(id, "ordinals are 1-based"));
    }
    Ok(ordinal)
}

fn check_prefix(id: &str, prefix: &str) -> Result<(), MalformedIdentifierError> {
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(MalformedIdentifierError::new(
            id,
            format!("prefix '{prefix}' must be non-empty and alphanumeric"),
        ));
    }
    Ok(())
}

fn check_ordinal(id: &str, kind: NodeKind, ordinal: u32) -> Result<(), MalformedIdentifierError> {
    if ordinal == 0 {
        return Err(MalformedIdentifierError::new(id, "ordinals are 1-based"));
    }
    if ordinal > kind.max_ordinal() {
        return Err(MalformedIdentifierError::new(
            id,
            format!("ordinal {ordinal} exceeds {} for {kind}", kind.max_ordinal()),
        ));
    }
    Ok(())
}

/// Every element of the path must be the schema parent of the next one, and
/// the outermost must be a root kind.
fn check_chain(id: &str, decoded: &DecodedId) -> Result<(), MalformedIdentifierError> {
    let chain: Vec<NodeKind> = decoded
        .path
        .iter()
        .map(|segment| segment.kind)
        .chain(std::iter::once(decoded.kind))
        .collect();

    let mut expected_parent = None;
    for kind in chain {
        if parent_kind(kind) != expected_parent {
            let reason = match parent_kind(kind) {
                Some(parent) => format!("{kind} must sit under {parent}"),
                None => format!("{kind} must be a root"),
            };
            return Err(MalformedIdentifierError::new(id, reason));
        }
        expected_parent = Some(kind);
    }
    Ok(())
}
