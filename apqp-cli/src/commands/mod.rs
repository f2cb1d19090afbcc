pub mod conflicts;
pub mod daemon;
pub mod doc;
pub mod init;
pub mod log;
pub mod resolve;
pub mod status;
pub mod sync;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use apqp_core::config::{self, Config};
use apqp_core::paths;
use apqp_core::types::{ConflictResolution, Direction, ProjectKey, SyncConflict};
use apqp_sync::{
    with_backoff, LogPage, LogQuery, ProjectStatus, ResolutionResult, SqliteStore,
    SyncOrchestrator, SyncRequest, SyncResponse,
};

/// Where requests are served: in this process or by the daemon.
pub enum Backend {
    Local {
        runtime: tokio::runtime::Runtime,
        orchestrator: SyncOrchestrator<SqliteStore>,
        config: Config,
    },
    Daemon {
        home: PathBuf,
        config: Config,
    },
}

impl Backend {
    pub fn select(via_daemon: bool) -> Result<Self> {
        let home = home_dir()?;
        let config = config::load_at(&home).context("failed to load ~/.apqp/config.yaml")?;
        if via_daemon {
            return Ok(Backend::Daemon { home, config });
        }
        Ok(Backend::Local {
            runtime: runtime()?,
            orchestrator: SyncOrchestrator::open_at(home),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        match self {
            Backend::Local { config, .. } | Backend::Daemon { config, .. } => config,
        }
    }

    /// Run a sync. Errors come back as a `Failed` response, never as `Err`,
    /// unless the daemon cannot be reached.
    pub fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        match self {
            Backend::Local {
                runtime,
                orchestrator,
                config,
            } => {
                let result = runtime.block_on(with_backoff(
                    config.provision_retries,
                    config.retry_backoff(),
                    || orchestrator.sync(&request),
                ));
                Ok(result.unwrap_or_else(|err| SyncResponse::from_error(&err)))
            }
            Backend::Daemon { home, .. } => {
                apqp_daemon::request_sync(home, request).context("daemon sync request failed")
            }
        }
    }

    pub fn log(&self, query: LogQuery) -> Result<LogPage> {
        match self {
            Backend::Local {
                runtime,
                orchestrator,
                ..
            } => runtime
                .block_on(orchestrator.query_log(query))
                .context("failed to query the sync log"),
            Backend::Daemon { home, .. } => {
                apqp_daemon::request_log(home, query).context("daemon log request failed")
            }
        }
    }

    pub fn conflicts(
        &self,
        project: &ProjectKey,
        direction: Option<Direction>,
    ) -> Result<Vec<SyncConflict>> {
        match self {
            Backend::Local {
                runtime,
                orchestrator,
                ..
            } => runtime
                .block_on(orchestrator.pending_conflicts(project, direction))
                .with_context(|| format!("failed to list conflicts for '{project}'")),
            Backend::Daemon { home, .. } => {
                apqp_daemon::request_conflicts(home, project.clone(), direction)
                    .context("daemon conflicts request failed")
            }
        }
    }

    pub fn resolve(
        &self,
        project: &ProjectKey,
        resolutions: Vec<ConflictResolution>,
        timeout: Duration,
    ) -> Result<ResolutionResult> {
        match self {
            Backend::Local {
                runtime,
                orchestrator,
                ..
            } => runtime
                .block_on(orchestrator.submit_resolutions(project, resolutions, timeout))
                .with_context(|| format!("failed to resolve conflicts for '{project}'")),
            Backend::Daemon { home, .. } => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                apqp_daemon::request_resolve(home, project.clone(), resolutions, timeout_ms)
                    .context("daemon resolve request failed")
            }
        }
    }

    pub fn status(&self, project: &ProjectKey) -> Result<ProjectStatus> {
        match self {
            Backend::Local {
                runtime,
                orchestrator,
                ..
            } => runtime
                .block_on(orchestrator.status(project))
                .with_context(|| format!("failed to read status for '{project}'")),
            Backend::Daemon { home, .. } => {
                let value = apqp_daemon::request_status(home, Some(project.clone()))
                    .context("daemon status request failed")?;
                serde_json::from_value(value).context("daemon returned malformed status")
            }
        }
    }
}

/// Parse and validate a project key argument.
pub fn project_key(raw: &str) -> Result<ProjectKey> {
    let key = ProjectKey::from(raw);
    key.validate()?;
    Ok(key)
}

pub fn home_dir() -> Result<PathBuf> {
    paths::home().context("could not determine home directory")
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

pub fn local_store(home: &Path) -> SqliteStore {
    SqliteStore::new(home)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON")?
    );
    Ok(())
}

/// Diagnostics go to stderr so `--json` output stays parseable.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
