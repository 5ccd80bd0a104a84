//! Configuration type definitions.
//!
//! This module contains the structures deserialized from the scheduler's
//! YAML configuration: global limits, loop cadences, backends, capacity
//! signals and the per-job-type workflow mapping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::core::job::StepDetail;
use crate::core::retry::{StartRetryPolicy, DEFAULT_MAX_START_RETRIES};

/// Default running-job limit for job types without an explicit policy.
pub const DEFAULT_MAX_RUNNING_JOBS: u32 = 5;

/// Default number of executions checked per workflow engine request.
pub const DEFAULT_RECOVERY_BATCH_SIZE: usize = 50;

/// Default age, in seconds, after which recovery releases a scheduling lock.
pub const DEFAULT_LOCK_TIMEOUT: u64 = 300;

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Failed starts tolerated before a job is finished.
    #[serde(default = "default_max_start_retries")]
    pub max_start_retries: u32,
    /// Limit applied to job types whose policy is unset.
    #[serde(default = "default_max_running_jobs")]
    pub default_max_running_jobs: u32,
    /// Executions checked per engine request by the recovery loop.
    #[serde(default = "default_recovery_batch_size")]
    pub recovery_batch_size: usize,
    /// Seconds a job may stay locked before recovery returns it to its ready state.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub job_types: Vec<JobTypeConfig>,
}

fn default_max_start_retries() -> u32 {
    DEFAULT_MAX_START_RETRIES
}

fn default_max_running_jobs() -> u32 {
    DEFAULT_MAX_RUNNING_JOBS
}

fn default_recovery_batch_size() -> usize {
    DEFAULT_RECOVERY_BATCH_SIZE
}

fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_start_retries: DEFAULT_MAX_START_RETRIES,
            default_max_running_jobs: DEFAULT_MAX_RUNNING_JOBS,
            recovery_batch_size: DEFAULT_RECOVERY_BATCH_SIZE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            intervals: IntervalsConfig::default(),
            storage: StorageConfig::default(),
            engine: None,
            capacity: CapacityConfig::default(),
            api: ApiConfig::default(),
            job_types: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Configuration of a job type, if it is known.
    pub fn job_type(&self, job_type: &str) -> Option<&JobTypeConfig> {
        self.job_types.iter().find(|t| t.job_type == job_type)
    }

    /// Retry policy for execution starts.
    pub fn retry_policy(&self) -> StartRetryPolicy {
        StartRetryPolicy::new(self.max_start_retries)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    /// Add a job type (builder style, mostly for tests).
    pub fn with_job_type(mut self, job_type: JobTypeConfig) -> Self {
        self.job_types.push(job_type);
        self
    }
}

/// Cadence of the built-in supervisor loops, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    pub admission: u64,
    pub scheduling: u64,
    pub revert: u64,
    pub recovery: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            admission: 5,
            scheduling: 2,
            revert: 5,
            recovery: 60,
        }
    }
}

impl IntervalsConfig {
    pub fn admission(&self) -> Duration {
        Duration::from_secs(self.admission)
    }

    pub fn scheduling(&self) -> Duration {
        Duration::from_secs(self.scheduling)
    }

    pub fn revert(&self) -> Duration {
        Duration::from_secs(self.revert)
    }

    pub fn recovery(&self) -> Duration {
        Duration::from_secs(self.recovery)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Workflow engine connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineConfig {
    Flyte {
        endpoint: String,
        project: String,
        domain: String,
    },
}

/// Static capacity signals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Number of GPU jobs that may hold a reservation; unset means unknown.
    pub gpu: Option<u32>,
    /// Job quota of organizations without an explicit entry.
    pub default_quota: u32,
    /// Job quota per organization id.
    pub quotas: BTreeMap<String, u32>,
}

/// HTTP listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8565,
        }
    }
}

impl ApiConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configured policy of a job type: `gpu`, `quota` or an integer limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyValue {
    Limit(u32),
    Named(String),
}

impl fmt::Display for PolicyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyValue::Limit(limit) => write!(f, "{}", limit),
            PolicyValue::Named(name) => f.write_str(name),
        }
    }
}

/// Reference to a workflow in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub name: String,
    pub version: String,
}

/// When a job enters the revert lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertTrigger {
    #[default]
    Never,
    OnFailure,
    OnCancel,
    OnFailureOrCancel,
}

impl RevertTrigger {
    pub fn covers_failure(&self) -> bool {
        matches!(self, RevertTrigger::OnFailure | RevertTrigger::OnFailureOrCancel)
    }

    pub fn covers_cancel(&self) -> bool {
        matches!(self, RevertTrigger::OnCancel | RevertTrigger::OnFailureOrCancel)
    }
}

/// Compensating workflow of a job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertConfig {
    pub workflow: WorkflowRef,
    #[serde(default)]
    pub trigger: RevertTrigger,
}

/// One entry of a job type's step template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub task_id: String,
    pub step_name: String,
}

/// Per-job-type configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTypeConfig {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub policy: Option<PolicyValue>,
    pub workflow: WorkflowRef,
    #[serde(default)]
    pub revert: Option<RevertConfig>,
    #[serde(default)]
    pub steps: Vec<StepTemplate>,
}

impl JobTypeConfig {
    /// A job type running `workflow` with default policy and no revert.
    pub fn new(job_type: impl Into<String>, workflow: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            policy: None,
            workflow: WorkflowRef {
                name: workflow.into(),
                version: version.into(),
            },
            revert: None,
            steps: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: PolicyValue) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_revert(
        mut self,
        workflow: impl Into<String>,
        version: impl Into<String>,
        trigger: RevertTrigger,
    ) -> Self {
        self.revert = Some(RevertConfig {
            workflow: WorkflowRef {
                name: workflow.into(),
                version: version.into(),
            },
            trigger,
        });
        self
    }

    pub fn with_step(mut self, task_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        self.steps.push(StepTemplate {
            task_id: task_id.into(),
            step_name: step_name.into(),
        });
        self
    }

    /// Revert trigger, `Never` when no compensating workflow is configured.
    pub fn revert_trigger(&self) -> RevertTrigger {
        self.revert.as_ref().map(|r| r.trigger).unwrap_or_default()
    }

    /// Step breakdown recorded when the main execution starts.
    pub fn initial_steps(&self) -> Vec<StepDetail> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| StepDetail::waiting(i as u32, &step.task_id, &step.step_name))
            .collect()
    }
}
