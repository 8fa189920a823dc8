//! Polling worker of a wait scheduler.
//!
//! One worker task runs per active scheduler. It owns the conditions that
//! were handed to it and returns each one to the coordinator through the
//! inbox when it completes, fails or is stopped. The worker shares no state
//! with the coordinator; everything goes over channels.

use super::{ConditionId, WaitCondition};
use crate::config::WorkerConfig;
use crate::error::AppResult;
use crate::messages::Inbound;
use crate::task::{Outcome, TaskId};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Commands sent from the coordinator to the worker.
pub(crate) enum WorkerCommand {
    /// Activate a condition, honouring its initial delay.
    Add {
        id: ConditionId,
        condition: Box<dyn WaitCondition>,
    },
    /// Stop every condition, return them and exit.
    Stop,
}

/// Coordinator-side handle of a running worker.
///
/// Dropping the handle closes the command channel; the worker then stops its
/// active conditions and exits without acknowledging.
pub(crate) struct WorkerHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawns a worker for `scheduler` on the current Tokio runtime.
    pub(crate) fn spawn(
        scheduler: TaskId,
        config: &WorkerConfig,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) -> AppResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let (commands, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            scheduler,
            active: BTreeMap::new(),
            delayed: Vec::new(),
            inbox,
        };
        let task = runtime.spawn(worker.run(config.tick, rx));
        Ok(Self { commands, task })
    }

    /// Hands a condition to the worker. Gives it back if the worker is gone.
    pub(crate) fn add(
        &self,
        id: ConditionId,
        condition: Box<dyn WaitCondition>,
    ) -> Result<(), Box<dyn WaitCondition>> {
        match self.commands.send(WorkerCommand::Add { id, condition }) {
            Err(mpsc::error::SendError(WorkerCommand::Add { condition, .. })) => Err(condition),
            _ => Ok(()),
        }
    }

    /// Asks the worker to stop. The acknowledgement arrives as
    /// [`Inbound::WorkerStopped`].
    pub(crate) fn stop(&self) -> bool {
        self.commands.send(WorkerCommand::Stop).is_ok()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            debug!("Detaching wait worker");
        }
    }
}

struct DelayedStart {
    due: Instant,
    id: ConditionId,
    condition: Box<dyn WaitCondition>,
}

struct Worker {
    scheduler: TaskId,
    active: BTreeMap<ConditionId, Box<dyn WaitCondition>>,
    delayed: Vec<DelayedStart>,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl Worker {
    async fn run(mut self, tick: Duration, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        info!(scheduler = %self.scheduler, ?tick, "Wait worker started");

        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_due = self.delayed.iter().map(|d| d.due).min();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(WorkerCommand::Add { id, condition }) => {
                        self.add(id, condition, &mut ticker).await;
                    }
                    Some(WorkerCommand::Stop) => {
                        self.stop_all().await;
                        let _ = self.inbox.send(Inbound::WorkerStopped {
                            scheduler: self.scheduler,
                        });
                        break;
                    }
                    None => {
                        debug!(scheduler = %self.scheduler, "Worker handle dropped");
                        self.stop_all().await;
                        break;
                    }
                },

                _ = ticker.tick(), if !self.active.is_empty() => {
                    self.poll().await;
                }

                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.promote_due(&mut ticker).await;
                }
            }
        }

        info!(scheduler = %self.scheduler, "Wait worker stopped");
    }

    async fn add(&mut self, id: ConditionId, condition: Box<dyn WaitCondition>, ticker: &mut Interval) {
        let delay = condition.initial_delay();
        if delay.is_zero() {
            self.activate(id, condition, ticker).await;
        } else {
            debug!(condition = id, label = condition.label(), ?delay, "Delaying condition start");
            self.delayed.push(DelayedStart {
                due: Instant::now() + delay,
                id,
                condition,
            });
        }
    }

    async fn activate(&mut self, id: ConditionId, mut condition: Box<dyn WaitCondition>, ticker: &mut Interval) {
        // First poll one full period after the active set becomes non-empty.
        if self.active.is_empty() {
            ticker.reset();
        }
        condition.start().await;
        debug!(
            condition = id,
            label = condition.label(),
            kind = %condition.kind(),
            "Condition active"
        );
        self.active.insert(id, condition);
    }

    async fn promote_due(&mut self, ticker: &mut Interval) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|d| d.due <= now);
        self.delayed = waiting;
        for start in due {
            self.activate(start.id, start.condition, ticker).await;
        }
    }

    async fn poll(&mut self) {
        let ids: Vec<ConditionId> = self.active.keys().copied().collect();
        for id in ids {
            let Some(condition) = self.active.get_mut(&id) else {
                continue;
            };
            let outcome = match condition.running().await {
                Ok(true) => continue,
                Ok(false) => Outcome::Succeeded,
                Err(err) => {
                    warn!(condition = id, label = condition.label(), error = %err, "Wait condition failed");
                    Outcome::Failed
                }
            };
            if let Some(mut condition) = self.active.remove(&id) {
                condition.finish().await;
                debug!(condition = id, ?outcome, "Condition done");
                self.report(id, outcome, condition);
            }
        }
    }

    async fn stop_all(&mut self) {
        for (id, mut condition) in std::mem::take(&mut self.active) {
            condition.stop().await;
            condition.finish().await;
            self.report(id, Outcome::Failed, condition);
        }
        // Never started, so no hooks to run.
        for start in std::mem::take(&mut self.delayed) {
            self.report(start.id, Outcome::Failed, start.condition);
        }
    }

    fn report(&self, id: ConditionId, outcome: Outcome, condition: Box<dyn WaitCondition>) {
        let _ = self.inbox.send(Inbound::ConditionDone {
            scheduler: self.scheduler,
            id,
            outcome,
            condition,
        });
    }
}
