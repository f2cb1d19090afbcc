//! `apqp sync`: propagate structure between a project's documents.

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use apqp_core::types::{ConflictSummary, Direction, SyncOutcome, SyncPolicy};
use apqp_sync::{SyncRequest, SyncResponse};

use super::{print_json, project_key, Backend};

/// Arguments for `apqp sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    pub project: String,

    /// `pfmea-to-control-plan` (alias `forward`) or `control-plan-to-pfmea`
    /// (alias `backward`).
    #[arg(long, short = 'd', default_value = "forward")]
    pub direction: Direction,

    /// Overrides `default_policy` from config.
    #[arg(long, short = 'p')]
    pub policy: Option<SyncPolicy>,

    /// Let removals take locally edited target subtrees with them.
    #[arg(long)]
    pub allow_deletions: bool,

    /// Overrides `timeout_ms` from config.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Fail immediately if another sync of this project is running.
    #[arg(long)]
    pub no_wait: bool,

    /// Report what would change without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Emit the sync response as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ConflictRow {
    #[tabled(rename = "conflict")]
    id: String,
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "node")]
    node: String,
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "target")]
    target: String,
    #[tabled(rename = "resolution")]
    resolution: String,
}

impl SyncArgs {
    pub fn run(self, via_daemon: bool) -> Result<()> {
        let backend = Backend::select(via_daemon)?;
        let key = project_key(&self.project)?;

        let mut request = SyncRequest::new(key.clone(), self.direction, backend.config());
        if let Some(policy) = self.policy {
            request.policy = policy;
        }
        request.allow_deletions |= self.allow_deletions;
        if let Some(timeout_ms) = self.timeout_ms {
            request.timeout_ms = timeout_ms;
        }
        request.non_blocking = self.no_wait;
        request.dry_run = self.dry_run;

        let response = backend.sync(request)?;
        if self.json {
            print_json(&response)?;
        } else {
            print_response(&key.to_string(), self.direction, &response);
        }

        if response.outcome == SyncOutcome::Failed {
            bail!(
                "sync of '{key}' failed: {}",
                response.error_detail.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(())
    }
}

fn print_response(project: &str, direction: Direction, response: &SyncResponse) {
    let prefix = if response.dry_run { "[dry-run] " } else { "" };
    let status = match response.outcome {
        SyncOutcome::Success => "✓".green().bold(),
        SyncOutcome::PartialSuccess => "◐".yellow().bold(),
        SyncOutcome::Failed => "✗".red().bold(),
    };

    println!(
        "{prefix}{status} '{project}' {direction}: {} ({} added, {} updated, {} removed)",
        response.outcome, response.added, response.updated, response.removed
    );
    if response.orphans > 0 {
        println!(
            "  {} source node(s) skipped: parent has no counterpart",
            response.orphans
        );
    }
    if let Some(detail) = &response.error_detail {
        println!("  {}", detail.red());
    }

    if !response.conflicts.is_empty() {
        let rows: Vec<ConflictRow> = response.conflicts.iter().map(conflict_row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }

    if !response.pending_conflict_ids.is_empty() {
        println!(
            "{} conflict(s) pending ({} new). Run 'apqp conflicts {project}' to review.",
            response.pending_conflict_ids.len(),
            response.new_conflict_ids.len()
        );
    }
}

fn conflict_row(summary: &ConflictSummary) -> ConflictRow {
    let node = match &summary.field {
        Some(field) => format!("{}.{}", summary.node_id, field),
        None => summary.node_id.to_string(),
    };
    ConflictRow {
        id: summary.id.to_string(),
        kind: summary.kind.to_string(),
        node,
        source: summary.source_value.clone(),
        target: summary.target_value.clone(),
        resolution: summary
            .resolution
            .map_or_else(|| "pending".to_string(), |outcome| outcome.to_string()),
    }
}
