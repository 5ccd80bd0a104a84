//! Scheduler engine implementation.
//!
//! The scheduler owns the four periodic cycles of the service:
//! - Admission of submitted jobs
//! - Scheduling of ready jobs onto the workflow engine
//! - Reverting of jobs ready for revert
//! - Recovery of jobs whose execution went missing
//!
//! Each cycle has its own timer. Failures inside a cycle are logged and the
//! cycle runs again at its next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{IntervalsConfig, SchedulerConfig};
use crate::core::job::ExecutionKind;
use crate::execution::ExecutionDriver;
use crate::lifecycle::StateMachine;
use crate::policy::{AdmissionEngine, CapacitySignals, PolicyResolver};
use crate::recovery::RecoveryLoop;
use crate::storage::JobStore;
use crate::workflow::WorkflowEngine;

use super::handle::{SchedulerHandle, COMMAND_CHANNEL_BUFFER};
use super::types::{Cycle, CycleReport, SchedulerCommand, SchedulerError, SchedulerState};

/// Shortest accepted cycle interval.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Supervisor of the admission, scheduling, revert and recovery cycles.
pub struct Scheduler<S: JobStore> {
    admission: Arc<AdmissionEngine<S>>,
    driver: Arc<ExecutionDriver<S>>,
    recovery: Arc<RecoveryLoop<S>>,
    admission_interval: Duration,
    scheduling_interval: Duration,
    revert_interval: Duration,
    recovery_interval: Duration,
}

impl<S: JobStore + 'static> Scheduler<S> {
    /// Create a scheduler from its components, using the default intervals.
    pub fn new(
        admission: Arc<AdmissionEngine<S>>,
        driver: Arc<ExecutionDriver<S>>,
        recovery: Arc<RecoveryLoop<S>>,
    ) -> Self {
        Self {
            admission,
            driver,
            recovery,
            admission_interval: Duration::ZERO,
            scheduling_interval: Duration::ZERO,
            revert_interval: Duration::ZERO,
            recovery_interval: Duration::ZERO,
        }
        .with_intervals(&IntervalsConfig::default())
    }

    /// Wire every component from configuration.
    pub fn from_config(
        state_machine: Arc<StateMachine<S>>,
        engine: Arc<dyn WorkflowEngine>,
        capacity: Arc<dyn CapacitySignals>,
        config: &SchedulerConfig,
    ) -> Self {
        let admission = AdmissionEngine::new(
            state_machine.clone(),
            PolicyResolver::from_config(config),
            capacity,
        );
        let driver = ExecutionDriver::new(state_machine.clone(), engine.clone(), config);
        let recovery = RecoveryLoop::new(state_machine, engine, config);
        Self::new(Arc::new(admission), Arc::new(driver), Arc::new(recovery))
            .with_intervals(&config.intervals)
    }

    /// Set all intervals from configuration.
    pub fn with_intervals(self, intervals: &IntervalsConfig) -> Self {
        self.with_interval(Cycle::Admission, intervals.admission())
            .with_interval(Cycle::Scheduling, intervals.scheduling())
            .with_interval(Cycle::Revert, intervals.revert())
            .with_interval(Cycle::Recovery, intervals.recovery())
    }

    /// Set the interval of one cycle.
    pub fn with_interval(mut self, cycle: Cycle, interval: Duration) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        match cycle {
            Cycle::Admission => self.admission_interval = interval,
            Cycle::Scheduling => self.scheduling_interval = interval,
            Cycle::Revert => self.revert_interval = interval,
            Cycle::Recovery => self.recovery_interval = interval,
        }
        self
    }

    pub fn interval(&self, cycle: Cycle) -> Duration {
        match cycle {
            Cycle::Admission => self.admission_interval,
            Cycle::Scheduling => self.scheduling_interval,
            Cycle::Revert => self.revert_interval,
            Cycle::Recovery => self.recovery_interval,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionEngine<S>> {
        &self.admission
    }

    /// Run one cycle to completion.
    pub async fn run_cycle(&self, cycle: Cycle) -> Result<CycleReport, SchedulerError> {
        let report = match cycle {
            Cycle::Admission => CycleReport::Admission(self.admission.run_once().await?),
            Cycle::Scheduling => {
                CycleReport::Scheduling(self.driver.run_once(ExecutionKind::Main).await?)
            }
            Cycle::Revert => CycleReport::Revert(self.driver.run_once(ExecutionKind::Revert).await?),
            Cycle::Recovery => CycleReport::Recovery(self.recovery.run_once().await?),
        };
        Ok(report)
    }

    /// Start the scheduler and return a handle for controlling it.
    pub fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, scheduler_task)
    }

    /// Main scheduler loop.
    async fn run(
        self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut admission = ticker(self.admission_interval);
        let mut scheduling = ticker(self.scheduling_interval);
        let mut revert = ticker(self.revert_interval);
        let mut recovery = ticker(self.recovery_interval);

        tracing::info!(
            admission = ?self.admission_interval,
            scheduling = ?self.scheduling_interval,
            revert = ?self.revert_interval,
            recovery = ?self.recovery_interval,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = admission.tick() => self.tick(Cycle::Admission, &state).await,
                _ = scheduling.tick() => self.tick(Cycle::Scheduling, &state).await,
                _ = revert.tick() => self.tick(Cycle::Revert, &state).await,
                _ = recovery.tick() => self.tick(Cycle::Recovery, &state).await,

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        // Every handle is gone.
                        *state.write().await = SchedulerState::Stopped;
                        break;
                    };
                    match command {
                        SchedulerCommand::RunNow { cycle, reply } => {
                            let _ = reply.send(self.run_cycle(cycle).await);
                        }
                        SchedulerCommand::SetState { target, reply } => {
                            let previous = std::mem::replace(&mut *state.write().await, target);
                            tracing::info!(from = ?previous, to = ?target, "Scheduler state changed");
                            let _ = reply.send(previous);
                            if target == SchedulerState::Stopped {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Run a timed cycle unless paused, logging instead of propagating errors.
    async fn tick(&self, cycle: Cycle, state: &RwLock<SchedulerState>) {
        if *state.read().await != SchedulerState::Running {
            return;
        }
        match self.run_cycle(cycle).await {
            Ok(report) if report.affected() > 0 => {
                tracing::debug!(cycle = %cycle, affected = report.affected(), "cycle finished");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(cycle = %cycle, error = %e, "cycle failed, retrying at next tick");
            }
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
