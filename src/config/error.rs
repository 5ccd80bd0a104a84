//! Errors raised while loading the scheduler configuration.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The document does not match the configuration schema.
    #[error("malformed configuration{}: {source}", origin(.path))]
    Malformed {
        /// File the document was loaded from, if any.
        path: Option<PathBuf>,
        #[source]
        source: serde_yaml::Error,
    },

    /// A global setting is out of range.
    #[error("setting '{setting}' {reason}")]
    InvalidSetting { setting: String, reason: String },

    /// A job type entry is incomplete or conflicts with another entry.
    #[error("job type '{job_type}': {reason}")]
    InvalidJobType { job_type: String, reason: String },

    /// A policy value is neither a sentinel nor an integer limit.
    #[error("job type '{job_type}': invalid policy '{value}'")]
    InvalidPolicy { job_type: String, value: String },
}

fn origin(path: &Option<PathBuf>) -> String {
    path.as_deref()
        .map(|p: &Path| format!(" in '{}'", p.display()))
        .unwrap_or_default()
}

impl ConfigError {
    pub(crate) fn setting(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidSetting {
            setting: setting.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn job_type(job_type: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidJobType {
            job_type: job_type.into(),
            reason: reason.into(),
        }
    }
}
