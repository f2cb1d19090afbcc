//! `apqp init <project>`

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use apqp_core::config::{self, Config};
use apqp_core::paths::{config_path, namespace_db_path};
use apqp_sync::{with_backoff, SyncOrchestrator};

use super::{home_dir, project_key, runtime};

/// Provision a project's namespace.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Project key (letters, digits, `-` and `_`).
    pub project: String,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let key = project_key(&self.project)?;

        let config_file = config_path(&home);
        let config = if config_file.exists() {
            config::load_at(&home).context("failed to load ~/.apqp/config.yaml")?
        } else {
            let defaults = Config::default();
            config::save_at(&home, &defaults).context("failed to write default config")?;
            println!("✓ Wrote default config to {}", config_file.display());
            defaults
        };

        let orchestrator = SyncOrchestrator::open_at(&home);
        let timeout = Duration::from_millis(config.timeout_ms);
        runtime()?
            .block_on(with_backoff(
                config.provision_retries,
                config.retry_backoff(),
                || orchestrator.ensure_ready(&key, timeout),
            ))
            .with_context(|| format!("failed to provision project '{key}'"))?;

        println!("✓ Project '{key}' ready");
        println!("  Database: {}", namespace_db_path(&home, &key).display());
        Ok(())
    }
}
