//! Job lifecycle events and event handling.
//!
//! Events are published by the state machine after the corresponding
//! store write has been confirmed. Delivery is fire-and-forget: a failing
//! handler is logged and the remaining handlers still receive the event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::job::{ExecutionKind, Job, StepDetail};
use crate::core::state::JobState;
use crate::core::types::{ExecutionId, JobId, OrganizationId, WorkspaceId};

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A job moved between lifecycle states.
    JobStateChanged {
        job_id: JobId,
        organization_id: OrganizationId,
        workspace_id: WorkspaceId,
        job_type: String,
        from: JobState,
        to: JobState,
        timestamp: DateTime<Utc>,
    },

    /// Step progress of a running job changed.
    StepProgressUpdated {
        job_id: JobId,
        step_details: Vec<StepDetail>,
        timestamp: DateTime<Utc>,
    },

    /// An external execution was started or an existing one reused.
    ExecutionStarted {
        job_id: JobId,
        kind: ExecutionKind,
        execution_id: ExecutionId,
        reused: bool,
        timestamp: DateTime<Utc>,
    },

    /// A job ran out of start retries and was finished.
    RetryExhausted {
        job_id: JobId,
        kind: ExecutionKind,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::JobStateChanged { timestamp, .. } => *timestamp,
            Event::StepProgressUpdated { timestamp, .. } => *timestamp,
            Event::ExecutionStarted { timestamp, .. } => *timestamp,
            Event::RetryExhausted { timestamp, .. } => *timestamp,
        }
    }

    /// The job the event is about.
    pub fn job_id(&self) -> &JobId {
        match self {
            Event::JobStateChanged { job_id, .. } => job_id,
            Event::StepProgressUpdated { job_id, .. } => job_id,
            Event::ExecutionStarted { job_id, .. } => job_id,
            Event::RetryExhausted { job_id, .. } => job_id,
        }
    }

    /// Create a JobStateChanged event for `job` leaving `from`.
    pub fn state_changed(job: &Job, from: JobState, to: JobState) -> Self {
        Event::JobStateChanged {
            job_id: job.id.clone(),
            organization_id: job.organization_id.clone(),
            workspace_id: job.workspace_id.clone(),
            job_type: job.job_type.clone(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    /// Create a StepProgressUpdated event.
    pub fn step_progress(job_id: JobId, step_details: Vec<StepDetail>) -> Self {
        Event::StepProgressUpdated {
            job_id,
            step_details,
            timestamp: Utc::now(),
        }
    }

    /// Create an ExecutionStarted event.
    pub fn execution_started(
        job_id: JobId,
        kind: ExecutionKind,
        execution_id: ExecutionId,
        reused: bool,
    ) -> Self {
        Event::ExecutionStarted {
            job_id,
            kind,
            execution_id,
            reused,
            timestamp: Utc::now(),
        }
    }

    /// Create a RetryExhausted event.
    pub fn retry_exhausted(job_id: JobId, kind: ExecutionKind, attempts: u32) -> Self {
        Event::RetryExhausted {
            job_id,
            kind,
            attempts,
            timestamp: Utc::now(),
        }
    }
}

/// Failure of a handler to deliver an event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event delivery failed: {0}")]
    Delivery(String),
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event) -> Result<(), EventError>;
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            if let Err(e) = handler.handle(&event).await {
                tracing::warn!(job_id = %event.job_id(), error = %e, "event handler failed");
            }
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that writes every event to the log.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        match event {
            Event::JobStateChanged {
                job_id, from, to, ..
            } => {
                tracing::info!(job_id = %job_id, from = %from, to = %to, "job state changed");
            }
            Event::StepProgressUpdated { job_id, .. } => {
                tracing::debug!(job_id = %job_id, "step progress updated");
            }
            Event::ExecutionStarted {
                job_id,
                kind,
                execution_id,
                reused,
                ..
            } => {
                tracing::info!(
                    job_id = %job_id,
                    kind = %kind,
                    execution_id = %execution_id,
                    reused,
                    "execution started"
                );
            }
            Event::RetryExhausted {
                job_id,
                kind,
                attempts,
                ..
            } => {
                tracing::warn!(job_id = %job_id, kind = %kind, attempts, "start retries exhausted");
            }
        }
        Ok(())
    }
}
