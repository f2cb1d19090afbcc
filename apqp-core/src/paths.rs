//! On-disk layout.
//!
//! ```text
//! ~/.apqp/
//!   config.yaml
//!   daemon.sock
//!   projects/
//!     <project_key>/
//!       namespace.db
//! ```
//!
//! Every function here is pure: no directories are created.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::ProjectKey;

pub const CONFIG_FILE: &str = "config.yaml";
pub const NAMESPACE_DB: &str = "namespace.db";

pub fn apqp_root(home: &Path) -> PathBuf {
    home.join(".apqp")
}

pub fn projects_root(home: &Path) -> PathBuf {
    apqp_root(home).join("projects")
}

/// `<home>/.apqp/projects/<key>/`
pub fn namespace_dir(home: &Path, key: &ProjectKey) -> PathBuf {
    projects_root(home).join(key.as_str())
}

pub fn namespace_db_path(home: &Path, key: &ProjectKey) -> PathBuf {
    namespace_dir(home, key).join(NAMESPACE_DB)
}

pub fn config_path(home: &Path) -> PathBuf {
    apqp_root(home).join(CONFIG_FILE)
}

/// Keys of every directory under `projects/` that holds a namespace database.
pub fn list_project_keys(home: &Path) -> std::io::Result<Vec<ProjectKey>> {
    let dir = projects_root(home);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut keys: Vec<ProjectKey> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join(NAMESPACE_DB).exists())
        .map(|e| ProjectKey::from(e.file_name().to_string_lossy().into_owned()))
        .collect();
    keys.sort();
    Ok(keys)
}

/// The invoking user's home directory.
pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn namespace_db_path_is_correct() {
        let home = TempDir::new().expect("home");
        let path = namespace_db_path(home.path(), &ProjectKey::from("brake"));
        assert!(path.ends_with(".apqp/projects/brake/namespace.db"));
    }

    #[test]
    fn list_keys_skips_dirs_without_database() {
        let home = TempDir::new().expect("home");
        assert!(list_project_keys(home.path()).expect("empty").is_empty());

        let ready = namespace_dir(home.path(), &ProjectKey::from("beta"));
        std::fs::create_dir_all(&ready).expect("mkdir");
        std::fs::write(ready.join(NAMESPACE_DB), b"").expect("touch");
        std::fs::create_dir_all(namespace_dir(home.path(), &ProjectKey::from("alpha")))
            .expect("mkdir");

        let keys = list_project_keys(home.path()).expect("list");
        assert_eq!(keys, vec![ProjectKey::from("beta")]);
    }
}
