pub mod api;
pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod ingest;
pub mod lifecycle;
pub mod policy;
pub mod recovery;
pub mod scheduler;
pub mod storage;
pub mod testing;
pub mod workflow;

pub use config::{ConfigError, JobTypeConfig, SchedulerConfig, YamlLoader};
pub use core::job::{ExecutionKind, FailureInfo, Job, StepDetail, StepProgress};
pub use core::retry::StartRetryPolicy;
pub use core::state::JobState;
pub use core::types::{ExecutionId, JobId, OrganizationId, Tenant, UserId, WorkspaceId};
pub use events::{Event, EventBus, EventError, EventHandler, LoggingHandler};
pub use execution::{DriverError, ExecutionDriver, ScheduleOutcome};
pub use ingest::{IngestError, JobUpdate, UpdateIngestor};
pub use lifecycle::{CancelOutcome, Completion, StateMachine, TransitionError};
pub use policy::{AdmissionEngine, CapacitySignals, Policy, PolicyResolver, StaticCapacity};
pub use recovery::RecoveryLoop;
pub use scheduler::{Cycle, Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
pub use storage::{InMemoryJobStore, JobFilter, JobPatch, JobStore, JobSubmitter, StorageError};
#[cfg(feature = "sqlite")]
pub use storage::SqliteJobStore;
pub use workflow::{FlyteAdminClient, WorkflowEngine, WorkflowError};
