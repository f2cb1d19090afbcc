//! Error types for apqp-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::NodeId;

/// An identifier that does not match `PREFIX-TYPE[-SEG]*-SEQ`, or a node whose
/// stored attributes contradict what its identifier encodes.
///
/// Always treated as data corruption: the enclosing operation aborts and the
/// identifier is never repaired automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed identifier '{id}': {reason}")]
pub struct MalformedIdentifierError {
    pub id: String,
    pub reason: String,
}

impl MalformedIdentifierError {
    pub fn new(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while assembling a [`crate::tree::DocumentTree`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error(transparent)]
    Malformed(#[from] MalformedIdentifierError),

    /// The same identifier appears twice in one snapshot.
    #[error("duplicate node {0} in document snapshot")]
    Duplicate(NodeId),
}

/// A project key that cannot name a namespace directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid project key '{0}': use letters, digits, '_' or '-'")]
pub struct InvalidProjectKey(pub String);

/// All errors that can arise from loading or saving `config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, with the path that was being accessed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the file path.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A value parsed but is out of range.
    #[error("invalid config value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

pub(crate) fn config_io(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
