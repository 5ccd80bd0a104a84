//! Admission policies.
//!
//! Every job type is governed by exactly one [`Policy`]. Policies are
//! resolved once per admission run from configuration and environment
//! overrides, then applied by the [`AdmissionEngine`].

mod admission;
mod capacity;
mod resolver;

pub use admission::{AdmissionEngine, AdmissionReport};
pub use capacity::{CapacitySignals, StaticCapacity};
pub use resolver::{EnvLookup, PolicyResolver, POLICY_ENV_PREFIX};

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Admission policy of a job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Policy {
    /// At most `limit` jobs of the type admitted at once.
    MaxRunning(u32),
    /// Bound by the shared GPU capacity signal.
    Gpu,
    /// Bound by the owning organization's job quota.
    Quota,
}

/// A policy string that is neither a sentinel nor a non-negative integer.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid policy value: '{0}'")]
pub struct PolicyParseError(pub String);

impl FromStr for Policy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        match value.to_ascii_lowercase().as_str() {
            "gpu" => Ok(Policy::Gpu),
            "quota" => Ok(Policy::Quota),
            other => other
                .parse::<u32>()
                .map(Policy::MaxRunning)
                .map_err(|_| PolicyParseError(value.to_string())),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::MaxRunning(limit) => write!(f, "max_running({})", limit),
            Policy::Gpu => f.write_str("gpu"),
            Policy::Quota => f.write_str("quota"),
        }
    }
}
