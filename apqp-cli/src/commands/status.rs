//! `apqp status`: namespace readiness and sync position per project.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use apqp_core::paths::list_project_keys;
use apqp_core::types::{Direction, ReadinessState};
use apqp_sync::ProjectStatus;

use super::{home_dir, print_json, project_key, Backend};

/// Arguments for `apqp status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Limit to one project.
    pub project: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "project")]
    project: String,
    #[tabled(rename = "namespace")]
    readiness: String,
    #[tabled(rename = "pfmea rev")]
    pfmea: String,
    #[tabled(rename = "cp rev")]
    control_plan: String,
    #[tabled(rename = "pfmea → cp")]
    forward: String,
    #[tabled(rename = "cp → pfmea")]
    backward: String,
    #[tabled(rename = "pending")]
    pending: usize,
    #[tabled(rename = "last sync")]
    last: String,
}

impl StatusArgs {
    pub fn run(self, via_daemon: bool) -> Result<()> {
        let keys = match &self.project {
            Some(project) => vec![project_key(project)?],
            None => {
                let home = home_dir()?;
                list_project_keys(&home).context("failed to list projects")?
            }
        };
        let backend = Backend::select(via_daemon)?;
        let statuses = keys
            .iter()
            .map(|key| backend.status(key))
            .collect::<Result<Vec<_>>>()?;

        if self.json {
            return print_json(&statuses);
        }

        println!(
            "apqp v{} | {} project(s)",
            env!("CARGO_PKG_VERSION"),
            statuses.len()
        );
        if statuses.is_empty() {
            println!("No projects. Run 'apqp init <project>' first.");
            return Ok(());
        }

        let rows: Vec<StatusRow> = statuses.iter().map(status_row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");

        let pending: usize = statuses.iter().map(|s| s.pending_conflicts).sum();
        if pending > 0 {
            println!(
                "{}",
                format!("{pending} conflict(s) pending. Run 'apqp conflicts <project>'.").yellow()
            );
        }
        Ok(())
    }
}

fn status_row(status: &ProjectStatus) -> StatusRow {
    let revision = |name: &str| {
        status
            .revisions
            .get(name)
            .map_or_else(|| "-".to_string(), u64::to_string)
    };
    let watermark = |direction: Direction| {
        status
            .watermarks
            .iter()
            .find(|w| w.direction == direction)
            .map_or_else(
                || "never".to_string(),
                |w| format!("v{} {}", w.version, w.synced_at.format("%Y-%m-%d %H:%M")),
            )
    };
    let readiness = match &status.readiness {
        ReadinessState::Ready if status.sync_in_progress => "ready (syncing)".to_string(),
        other => other.to_string(),
    };

    StatusRow {
        project: status.project_key.to_string(),
        readiness,
        pfmea: revision("pfmea"),
        control_plan: revision("control_plan"),
        forward: watermark(Direction::PfmeaToControlPlan),
        backward: watermark(Direction::ControlPlanToPfmea),
        pending: status.pending_conflicts,
        last: status.last_entry.as_ref().map_or_else(
            || "-".to_string(),
            |entry| {
                format!(
                    "#{} {} {}",
                    entry.seq,
                    entry.outcome,
                    entry.completed_at.format("%Y-%m-%d %H:%M")
                )
            },
        ),
    }
}
