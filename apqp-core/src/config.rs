//! `~/.apqp/config.yaml`: defaults applied to every sync.
//!
//! Every key is optional. A missing file yields [`Config::default`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{config_io, ConfigError};
use crate::paths::config_path;
use crate::types::SyncPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Policy used when a request does not name one.
    pub default_policy: SyncPolicy,
    pub allow_deletions: bool,
    /// Budget for one sync, from lock acquisition to commit.
    pub timeout_ms: u64,
    /// Extra provisioning attempts after the first failure.
    pub provision_retries: u32,
    /// Initial delay between provisioning attempts; doubles each retry.
    pub retry_backoff_ms: u64,
    pub log_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_policy: SyncPolicy::ManualOnly,
            allow_deletions: false,
            timeout_ms: 30_000,
            provision_retries: 3,
            retry_backoff_ms: 200,
            log_page_size: 50,
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.log_page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "log_page_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Load `<home>/.apqp/config.yaml`, falling back to defaults when absent.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path(home);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| config_io(&path, e))?;
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?
    };
    config.validate()?;
    Ok(config)
}

/// Atomically write `config` to `<home>/.apqp/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `rename`.
pub fn save_at(home: &Path, config: &Config) -> Result<(), ConfigError> {
    config.validate()?;
    let path = config_path(home);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| config_io(dir, e))?;
    }
    let tmp_path = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| config_io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| config_io(&path, e))?;
    Ok(())
}
