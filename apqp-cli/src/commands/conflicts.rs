//! `apqp conflicts <project>`

use anyhow::Result;
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use apqp_core::types::{Direction, SyncConflict};

use super::{print_json, project_key, Backend};

#[derive(Args, Debug)]
pub struct ConflictsArgs {
    pub project: String,

    #[arg(long, short = 'd')]
    pub direction: Option<Direction>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct PendingRow {
    #[tabled(rename = "conflict")]
    id: String,
    #[tabled(rename = "direction")]
    direction: String,
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "node")]
    node: String,
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "target")]
    target: String,
    #[tabled(rename = "detected")]
    detected: String,
}

impl ConflictsArgs {
    pub fn run(self, via_daemon: bool) -> Result<()> {
        let backend = Backend::select(via_daemon)?;
        let key = project_key(&self.project)?;
        let pending = backend.conflicts(&key, self.direction)?;

        if self.json {
            return print_json(&pending);
        }
        if pending.is_empty() {
            println!("✓ No pending conflicts for '{key}'.");
            return Ok(());
        }

        let rows: Vec<PendingRow> = pending.iter().map(pending_row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!(
            "Resolve with: apqp resolve {key} <conflict> keep-source|keep-target|manual-value [--value V]"
        );
        Ok(())
    }
}

fn pending_row(conflict: &SyncConflict) -> PendingRow {
    PendingRow {
        id: conflict.id.to_string(),
        direction: conflict.direction.to_string(),
        kind: conflict.kind.to_string(),
        node: match &conflict.field {
            Some(field) => format!("{}.{}", conflict.node_id, field),
            None => conflict.node_id.to_string(),
        },
        source: conflict.source_value.render(),
        target: conflict.target_value.render(),
        detected: conflict.detected_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}
