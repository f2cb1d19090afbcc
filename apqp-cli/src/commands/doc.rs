//! `apqp doc`: read and edit a project's PFMEA or Control Plan.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use apqp_core::ident;
use apqp_core::types::{DocumentKind, HierarchyNode, NodeId};
use apqp_sync::plan::ApplyPlan;
use apqp_sync::NamespaceStore;

use super::{home_dir, local_store, print_json, project_key};

#[derive(Subcommand, Debug)]
pub enum DocCommand {
    /// Print every node of a document.
    Show(ShowArgs),
    /// Replace a whole document with the nodes of a JSON file.
    Import(ImportArgs),
    /// Insert a node, or overwrite an existing node's fields.
    Put(PutArgs),
    /// Set or clear one field of a node.
    Set(SetArgs),
    /// Remove a node and everything under it.
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
pub struct DocTarget {
    pub project: String,

    /// `pfmea` or `control-plan`.
    pub document: DocumentKind,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    #[command(flatten)]
    pub target: DocTarget,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    #[command(flatten)]
    pub target: DocTarget,

    /// JSON array of `{ "id", "ordinal"?, "fields"? }` objects.
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct PutArgs {
    #[command(flatten)]
    pub target: DocTarget,

    /// Node identifier, e.g. `PRJ-WE-P001-002`.
    pub id: String,

    /// Display position among siblings; defaults to the identifier's sequence.
    #[arg(long)]
    pub ordinal: Option<u32>,

    /// `name=value`, repeatable.
    #[arg(long = "field", short = 'f', value_parser = parse_field)]
    pub fields: Vec<(String, String)>,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    #[command(flatten)]
    pub target: DocTarget,

    pub id: String,
    pub field: String,

    /// New value; omit to clear the field.
    pub value: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    #[command(flatten)]
    pub target: DocTarget,

    pub id: String,
}

/// Import row: kind and parent come from the identifier.
#[derive(Debug, Deserialize)]
struct ImportNode {
    id: String,
    #[serde(default)]
    ordinal: Option<u32>,
    #[serde(default)]
    fields: BTreeMap<String, String>,
    #[serde(default)]
    origin: Option<DocumentKind>,
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "#")]
    ordinal: u32,
    #[tabled(rename = "fields")]
    fields: String,
    #[tabled(rename = "modified")]
    modified: String,
}

pub fn run(command: DocCommand) -> Result<()> {
    let home = home_dir()?;
    let store = local_store(&home);

    match command {
        DocCommand::Show(args) => {
            let key = project_key(&args.target.project)?;
            let snapshot = store
                .load_document(&key, args.target.document)
                .with_context(|| format!("failed to load {} of '{key}'", args.target.document))?;
            let nodes: Vec<&HierarchyNode> = snapshot.tree.depth_order();
            if args.json {
                return print_json(&nodes);
            }
            println!(
                "{} of '{key}' (revision {}, {} nodes)",
                args.target.document,
                snapshot.revision,
                nodes.len()
            );
            if nodes.is_empty() {
                return Ok(());
            }
            let rows: Vec<NodeRow> = nodes.into_iter().map(node_row).collect();
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{table}");
        }
        DocCommand::Import(args) => {
            let key = project_key(&args.target.project)?;
            let document = args.target.document;
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("cannot read '{}'", args.file.display()))?;
            let rows: Vec<ImportNode> = serde_json::from_str(&raw)
                .with_context(|| format!("'{}' is not a JSON node list", args.file.display()))?;
            let nodes = rows
                .into_iter()
                .map(|row| {
                    let mut node = new_node(&row.id, document, row.ordinal)?;
                    node.fields = row.fields;
                    node.origin = row.origin.unwrap_or(document);
                    Ok(node)
                })
                .collect::<Result<Vec<_>>>()?;
            let plan = store
                .replace_document(&key, document, nodes)
                .with_context(|| format!("failed to import {document} of '{key}'"))?;
            print_plan(document, &plan);
        }
        DocCommand::Put(args) => {
            let key = project_key(&args.target.project)?;
            let document = args.target.document;
            let id = NodeId::from(args.id);
            let current = store
                .load_document(&key, document)
                .with_context(|| format!("failed to load {document} of '{key}'"))?;
            let mut node = match current.tree.get(&id) {
                Some(existing) => existing.clone(),
                None => new_node(id.as_str(), document, None)?,
            };
            if let Some(ordinal) = args.ordinal {
                node.ordinal = ordinal;
            }
            node.fields.extend(args.fields);
            let plan = store
                .upsert_node(&key, document, &node)
                .with_context(|| format!("failed to write {id}"))?;
            print_plan(document, &plan);
        }
        DocCommand::Set(args) => {
            let key = project_key(&args.target.project)?;
            let id = NodeId::from(args.id);
            let plan = store
                .set_field(
                    &key,
                    args.target.document,
                    &id,
                    &args.field,
                    args.value.as_deref(),
                )
                .with_context(|| format!("failed to set {}.{}", id, args.field))?;
            print_plan(args.target.document, &plan);
        }
        DocCommand::Remove(args) => {
            let key = project_key(&args.target.project)?;
            let id = NodeId::from(args.id);
            let plan = store
                .remove_subtree(&key, args.target.document, &id)
                .with_context(|| format!("failed to remove {id}"))?;
            print_plan(args.target.document, &plan);
        }
    }

    Ok(())
}

fn new_node(id: &str, document: DocumentKind, ordinal: Option<u32>) -> Result<HierarchyNode> {
    let decoded = ident::decode(id)?;
    Ok(HierarchyNode {
        id: decoded.to_id(),
        kind: decoded.kind,
        parent: decoded.parent().map(|parent| parent.to_id()),
        ordinal: ordinal.unwrap_or(decoded.ordinal),
        fields: BTreeMap::new(),
        last_modified: Utc::now(),
        origin: document,
    })
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    if name.trim().is_empty() {
        return Err(format!("field name is empty in '{raw}'"));
    }
    Ok((name.trim().to_string(), value.to_string()))
}

fn node_row(node: &HierarchyNode) -> NodeRow {
    NodeRow {
        id: node.id.to_string(),
        kind: node.kind.to_string(),
        ordinal: node.ordinal,
        fields: node
            .fields
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", "),
        modified: node.last_modified.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

fn print_plan(document: DocumentKind, plan: &ApplyPlan) {
    if plan.is_empty() {
        println!("✓ {document} unchanged");
        return;
    }
    println!(
        "✓ {document} updated ({} added, {} updated, {} removed)",
        plan.added, plan.updated, plan.removed
    );
}
