//! `apqp resolve`: decide a pending conflict by hand.

use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;

use apqp_core::types::{ConflictId, ConflictResolution, ResolutionOutcome};

use super::{print_json, project_key, Backend};

#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub project: String,

    /// Conflict identifier (`cf-...`) from `apqp conflicts`.
    pub conflict: String,

    /// `keep-source`, `keep-target` or `manual-value`.
    pub outcome: ResolutionOutcome,

    /// Value to write; required with `manual-value`.
    #[arg(long)]
    pub value: Option<String>,

    /// Recorded as the resolver; defaults to `$USER`.
    #[arg(long)]
    pub by: Option<String>,

    #[arg(long)]
    pub json: bool,
}

impl ResolveArgs {
    pub fn run(self, via_daemon: bool) -> Result<()> {
        if self.outcome == ResolutionOutcome::ManualValue && self.value.is_none() {
            bail!("manual-value needs --value");
        }
        let backend = Backend::select(via_daemon)?;
        let key = project_key(&self.project)?;

        let resolver = self
            .by
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "cli".to_string());
        let resolution = ConflictResolution {
            conflict_id: ConflictId::from(self.conflict),
            outcome: self.outcome,
            value: self.value,
            resolver,
            resolved_at: Utc::now(),
        };
        let timeout = Duration::from_millis(backend.config().timeout_ms);
        let result = backend.resolve(&key, vec![resolution], timeout)?;

        if self.json {
            print_json(&result)?;
        } else {
            if result.applied > 0 {
                println!("✓ {} resolution(s) applied", result.applied);
            }
            for rejected in &result.rejected {
                println!(
                    "{} {} rejected: {}",
                    "✗".red().bold(),
                    rejected.conflict_id,
                    rejected.reason
                );
            }
            println!("{} conflict(s) still pending", result.remaining_pending.len());
        }

        if !result.rejected.is_empty() {
            bail!("{} resolution(s) rejected", result.rejected.len());
        }
        Ok(())
    }
}
