//! `apqp log`: newest-first pages of the sync log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use apqp_core::types::{Direction, SyncLogEntry, SyncOutcome};
use apqp_sync::LogQuery;

use super::{print_json, project_key, Backend};

#[derive(Args, Debug)]
pub struct LogArgs {
    pub project: String,

    #[arg(long, short = 'd')]
    pub direction: Option<Direction>,

    /// `success`, `partial-success` or `failed`.
    #[arg(long)]
    pub outcome: Option<SyncOutcome>,

    /// RFC 3339 timestamp; only entries requested at or after it.
    #[arg(long, value_parser = parse_since)]
    pub since: Option<DateTime<Utc>>,

    /// Page size; defaults to `log_page_size` from config.
    #[arg(long, short = 'n')]
    pub limit: Option<usize>,

    /// Continue below this sequence number.
    #[arg(long)]
    pub before: Option<u64>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct LogRow {
    #[tabled(rename = "seq")]
    seq: u64,
    #[tabled(rename = "requested")]
    requested: String,
    #[tabled(rename = "operation")]
    operation: String,
    #[tabled(rename = "direction")]
    direction: String,
    #[tabled(rename = "outcome")]
    outcome: String,
    #[tabled(rename = "+/~/-")]
    counts: String,
    #[tabled(rename = "conflicts")]
    conflicts: String,
}

impl LogArgs {
    pub fn run(self, via_daemon: bool) -> Result<()> {
        let backend = Backend::select(via_daemon)?;
        let key = project_key(&self.project)?;

        let mut query = LogQuery::new(key.clone());
        query.direction = self.direction;
        query.outcome = self.outcome;
        query.since = self.since;
        query.limit = self.limit.unwrap_or(backend.config().log_page_size);
        query.before = self.before;

        let page = backend.log(query).context("log query failed")?;
        if self.json {
            return print_json(&page);
        }

        if page.entries.is_empty() {
            println!("No log entries for '{key}'.");
            return Ok(());
        }
        let rows: Vec<LogRow> = page.entries.iter().map(log_row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        if let Some(next) = page.next {
            println!("More entries: apqp log {key} --before {next}");
        }
        Ok(())
    }
}

fn parse_since(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC 3339 timestamp '{raw}': {err}"))
}

fn log_row(entry: &SyncLogEntry) -> LogRow {
    let pending = entry.conflicts.iter().filter(|c| c.is_pending()).count();
    LogRow {
        seq: entry.seq,
        requested: entry.requested_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        operation: entry.operation.as_str().to_string(),
        direction: entry.direction.to_string(),
        outcome: entry.outcome.to_string(),
        counts: format!("{}/{}/{}", entry.added, entry.updated, entry.removed),
        conflicts: if pending > 0 {
            format!("{} ({pending} pending)", entry.conflicts.len())
        } else {
            entry.conflicts.len().to_string()
        },
    }
}
