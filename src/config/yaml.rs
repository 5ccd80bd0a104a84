//! YAML configuration loading and validation.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{PolicyValue, SchedulerConfig};
use crate::policy::Policy;

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load and validate the scheduler configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<SchedulerConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_document(&content, Some(path))
    }

    /// Parse and validate the scheduler configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<SchedulerConfig, ConfigError> {
        Self::parse_document(yaml, None)
    }

    fn parse_document(yaml: &str, path: Option<&Path>) -> Result<SchedulerConfig, ConfigError> {
        let config: SchedulerConfig =
            serde_yaml::from_str(yaml).map_err(|source| ConfigError::Malformed {
                path: path.map(Path::to_path_buf),
                source,
            })?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a scheduler configuration.
    pub fn validate(config: &SchedulerConfig) -> Result<(), ConfigError> {
        if config.recovery_batch_size == 0 {
            return Err(ConfigError::setting("recovery_batch_size", "cannot be zero"));
        }
        if config.lock_timeout == 0 {
            return Err(ConfigError::setting("lock_timeout", "cannot be zero"));
        }

        let intervals = &config.intervals;
        for (name, secs) in [
            ("admission", intervals.admission),
            ("scheduling", intervals.scheduling),
            ("revert", intervals.revert),
            ("recovery", intervals.recovery),
        ] {
            if secs == 0 {
                return Err(ConfigError::setting(
                    format!("intervals.{}", name),
                    "cannot be zero",
                ));
            }
        }

        let mut seen = HashSet::new();
        for job_type in &config.job_types {
            let name = job_type.job_type.as_str();
            if name.is_empty() {
                return Err(ConfigError::job_type(name, "type cannot be empty"));
            }
            if !seen.insert(name) {
                return Err(ConfigError::job_type(name, "configured more than once"));
            }
            if job_type.workflow.name.is_empty() || job_type.workflow.version.is_empty() {
                return Err(ConfigError::job_type(name, "empty workflow name or version"));
            }
            if let Some(revert) = &job_type.revert {
                if revert.workflow.name.is_empty() || revert.workflow.version.is_empty() {
                    return Err(ConfigError::job_type(
                        name,
                        "empty revert workflow name or version",
                    ));
                }
            }
            if let Some(policy) = &job_type.policy {
                Self::check_policy(name, policy)?;
            }
        }

        Ok(())
    }

    fn check_policy(job_type: &str, value: &PolicyValue) -> Result<(), ConfigError> {
        match value {
            PolicyValue::Limit(_) => Ok(()),
            PolicyValue::Named(name) => name
                .parse::<Policy>()
                .map(|_| ())
                .map_err(|_| ConfigError::InvalidPolicy {
                    job_type: job_type.to_string(),
                    value: name.clone(),
                }),
        }
    }
}
