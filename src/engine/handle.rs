//! Engine running as its own Tokio task.

use super::Engine;
use crate::error::{AppResult, SequencerError};
use crate::messages::{EngineCommand, EngineEvent};
use crate::task::{Outcome, TaskId, TaskState};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Result of a spawned run: the root's outcome and the shared state.
#[derive(Debug)]
pub struct RunReport<S> {
    /// Outcome of the root task.
    pub outcome: Outcome,
    /// Shared experiment state after the run.
    pub shared: S,
}

/// Cloneable handle to a spawned engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Starts a task in the spawned engine.
    pub async fn start(&self, task: TaskId) -> AppResult<()> {
        let (command, rx) = EngineCommand::start(task);
        self.send(command).await?;
        rx.await.map_err(|_| SequencerError::ChannelClosed)?
    }

    /// Requests cooperative cancellation of a task.
    pub async fn stop(&self, task: TaskId) -> AppResult<()> {
        let (command, rx) = EngineCommand::stop(task);
        self.send(command).await?;
        rx.await.map_err(|_| SequencerError::ChannelClosed)?
    }

    /// Lifecycle state of a task, `None` if it no longer exists.
    pub async fn state(&self, task: TaskId) -> AppResult<Option<TaskState>> {
        let (command, rx) = EngineCommand::state(task);
        self.send(command).await?;
        rx.await.map_err(|_| SequencerError::ChannelClosed)
    }

    /// Ends the engine task without waiting for the root to finish.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (command, rx) = EngineCommand::shutdown();
        self.send(command).await?;
        rx.await.map_err(|_| SequencerError::ChannelClosed)
    }

    /// Receives a start and a finish event for every task run.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: EngineCommand) -> AppResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SequencerError::ChannelClosed)
    }
}

impl<S: Send + 'static> Engine<S> {
    /// Moves the engine into a Tokio task, starts `root` and serves
    /// commands until the root reports an outcome.
    pub fn spawn(self, root: TaskId) -> (EngineHandle, JoinHandle<AppResult<RunReport<S>>>) {
        let (commands, rx) = mpsc::channel(self.engine_config.command_capacity.max(1));
        let handle = EngineHandle {
            commands,
            events: self.events.clone(),
        };
        let span = info_span!("engine", run_id = %Uuid::new_v4(), %root);
        let task = tokio::spawn(self.serve(root, rx).instrument(span));
        (handle, task)
    }

    async fn serve(
        mut self,
        root: TaskId,
        mut commands: mpsc::Receiver<EngineCommand>,
    ) -> AppResult<RunReport<S>> {
        self.start(root)?;
        let mut commands_open = true;

        let outcome = loop {
            if let Some(outcome) = self.outcome(root) {
                break outcome;
            }

            tokio::select! {
                message = self.inbox_rx.recv() => {
                    let message = message.ok_or(SequencerError::ChannelClosed)?;
                    self.handle_inbound(message);
                    self.run_until_idle();
                }

                command = commands.recv(), if commands_open => match command {
                    Some(EngineCommand::Shutdown { response }) => {
                        warn!("Engine shut down before the root finished");
                        let _ = response.send(());
                        break Outcome::Failed;
                    }
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
            }
        };

        info!(?outcome, "Run complete");
        Ok(RunReport {
            outcome,
            shared: self.shared,
        })
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Start { task, response } => {
                let _ = response.send(self.start(task));
            }
            EngineCommand::Stop { task, response } => {
                let _ = response.send(self.stop(task));
            }
            EngineCommand::State { task, response } => {
                let _ = response.send(self.state(task));
            }
            EngineCommand::Shutdown { response } => {
                let _ = response.send(());
            }
        }
    }
}
