//! Retry policy for starting external executions.
//!
//! Every failed attempt to start an execution increments the execution's
//! `start_retry_counter`; once the counter exceeds the configured maximum
//! the job is finished instead of being retried.

use serde::{Deserialize, Serialize};

/// Default number of start retries before a job is given up on.
pub const DEFAULT_MAX_START_RETRIES: u32 = 5;

/// Retry policy for execution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRetryPolicy {
    /// Maximum number of failed starts tolerated (0 = give up after the first failure).
    pub max_retries: u32,
}

impl StartRetryPolicy {
    /// Create a policy with the given maximum.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Whether a job with this many failed starts must not be attempted again.
    pub fn is_exhausted(&self, start_retry_counter: u32) -> bool {
        start_retry_counter > self.max_retries
    }

    /// Attempts still allowed for a job with this many failed starts.
    pub fn remaining(&self, start_retry_counter: u32) -> u32 {
        (self.max_retries + 1).saturating_sub(start_retry_counter)
    }
}

impl Default for StartRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_START_RETRIES)
    }
}
