//! Control handle of a running scheduler.
//!
//! A [`SchedulerHandle`] talks to the scheduler task over a bounded command
//! channel. Every command carries a oneshot sender for its reply, so each
//! call returns once the scheduler loop has acted on it.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use super::types::{Cycle, CycleReport, SchedulerCommand, SchedulerError, SchedulerState};

/// Commands buffered between handles and the scheduler loop.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Cloneable control surface of a started [`Scheduler`](super::Scheduler).
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Send a command and wait for the scheduler loop's reply.
    async fn request<R>(
        &self,
        operation: &'static str,
        command: impl FnOnce(oneshot::Sender<R>) -> SchedulerCommand,
    ) -> Result<R, SchedulerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let closed = || SchedulerError::ChannelError(format!("scheduler stopped before {}", operation));
        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| closed())?;
        reply_rx.await.map_err(|_| closed())
    }

    /// Move the scheduler to `target`, returning the state it left.
    async fn transition(
        &self,
        operation: &'static str,
        target: SchedulerState,
    ) -> Result<SchedulerState, SchedulerError> {
        self.request(operation, |reply| SchedulerCommand::SetState { target, reply })
            .await
    }

    /// Run a cycle now, regardless of its timer. Works while paused.
    pub async fn run_now(&self, cycle: Cycle) -> Result<CycleReport, SchedulerError> {
        self.request("run", |reply| SchedulerCommand::RunNow { cycle, reply })
            .await?
    }

    /// Skip timed cycles until [`resume`](Self::resume) is called.
    pub async fn pause(&self) -> Result<SchedulerState, SchedulerError> {
        self.transition("pause", SchedulerState::Paused).await
    }

    pub async fn resume(&self) -> Result<SchedulerState, SchedulerError> {
        self.transition("resume", SchedulerState::Running).await
    }

    /// Stop the scheduler loop. Later commands fail with a channel error.
    pub async fn shutdown(&self) -> Result<SchedulerState, SchedulerError> {
        self.transition("shutdown", SchedulerState::Stopped).await
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == SchedulerState::Running
    }

    pub async fn is_paused(&self) -> bool {
        self.state().await == SchedulerState::Paused
    }
}
