//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the scheduler: limits,
//! loop cadences, backends and the per-job-type workflow mapping.

mod error;
mod types;
mod yaml;

pub use error::ConfigError;
pub use types::{
    ApiConfig, CapacityConfig, EngineConfig, IntervalsConfig, JobTypeConfig, PolicyValue,
    RevertConfig, RevertTrigger, SchedulerConfig, StepTemplate, StorageConfig, WorkflowRef,
    DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_RUNNING_JOBS, DEFAULT_RECOVERY_BATCH_SIZE,
};
pub use yaml::YamlLoader;
