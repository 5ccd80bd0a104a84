//! Policy resolution from configuration and environment.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::Policy;
use crate::config::{PolicyValue, SchedulerConfig};

/// Prefix of the per-job-type policy override variables.
pub const POLICY_ENV_PREFIX: &str = "JOB_POLICY_";

/// Variable overriding the platform-wide default limit.
const DEFAULT_LIMIT_ENV: &str = "DEFAULT_MAX_RUNNING_JOBS";

/// Source of environment variables.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves the [`Policy`] of each job type.
///
/// Precedence: `JOB_POLICY_<TYPE>` environment variable, then the job
/// type's configured policy, then `MaxRunning(default)` where the default
/// itself may be overridden by `DEFAULT_MAX_RUNNING_JOBS`.
#[derive(Clone)]
pub struct PolicyResolver {
    configured: HashMap<String, PolicyValue>,
    default_limit: u32,
    env: EnvLookup,
}

impl PolicyResolver {
    /// Build a resolver reading the process environment.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let configured = config
            .job_types
            .iter()
            .filter_map(|t| t.policy.clone().map(|p| (t.job_type.clone(), p)))
            .collect();
        Self {
            configured,
            default_limit: config.default_max_running_jobs,
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replace the environment source.
    pub fn with_env_lookup(
        mut self,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Name of the override variable for a job type.
    pub fn env_var_name(job_type: &str) -> String {
        let suffix: String = job_type
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", POLICY_ENV_PREFIX, suffix)
    }

    fn default_limit(&self) -> u32 {
        match (self.env)(DEFAULT_LIMIT_ENV) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "ignoring invalid {}", DEFAULT_LIMIT_ENV);
                self.default_limit
            }),
            None => self.default_limit,
        }
    }

    fn resolve_with_default(&self, job_type: &str, default_limit: u32) -> Policy {
        if let Some(raw) = (self.env)(&Self::env_var_name(job_type)) {
            match raw.parse::<Policy>() {
                Ok(policy) => return policy,
                Err(e) => tracing::warn!(job_type, error = %e, "ignoring policy override"),
            }
        }
        match self.configured.get(job_type) {
            Some(PolicyValue::Limit(limit)) => Policy::MaxRunning(*limit),
            Some(PolicyValue::Named(name)) => name.parse().unwrap_or_else(|e| {
                tracing::warn!(job_type, error = %e, "falling back to default policy");
                Policy::MaxRunning(default_limit)
            }),
            None => Policy::MaxRunning(default_limit),
        }
    }

    /// Resolve a single job type.
    pub fn resolve(&self, job_type: &str) -> Policy {
        self.resolve_with_default(job_type, self.default_limit())
    }

    /// Resolve a set of job types, reading the environment once per type.
    pub fn resolve_all<'a>(
        &self,
        job_types: impl IntoIterator<Item = &'a str>,
    ) -> BTreeMap<String, Policy> {
        let default_limit = self.default_limit();
        job_types
            .into_iter()
            .map(|t| (t.to_string(), self.resolve_with_default(t, default_limit)))
            .collect()
    }

    /// Job types with a configured policy.
    pub fn configured_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.configured.keys().cloned().collect();
        types.sort();
        types
    }
}
