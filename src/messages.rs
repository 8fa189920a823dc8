//! Message types for the coordinator.
//!
//! The coordinator owns the whole task graph. Everything that happens off the
//! coordinator (a spawned leaf finishing, the wait worker reporting, a caller
//! asking for a stop) reaches it as a message; nothing else shares state with
//! it.
//!
//! - `Inbound`: internal one-way notifications (leaves, worker).
//! - [`EngineCommand`]: caller requests to a spawned engine, answered through
//!   a `oneshot` channel.
//! - [`EngineEvent`]: broadcast to observers (UI, CLI) on every start/finish.

use crate::error::AppResult;
use crate::task::{Outcome, TaskId, TaskState};
use crate::wait::{ConditionId, WaitCondition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::oneshot;

/// Notifications delivered to the coordinator inbox.
pub(crate) enum Inbound {
    /// A leaf reported the outcome of run `run` through a `Completion`.
    LeafDone {
        task: TaskId,
        run: u64,
        outcome: Outcome,
    },

    /// The worker finished (or stopped) a condition and hands it back.
    ConditionDone {
        scheduler: TaskId,
        id: ConditionId,
        outcome: Outcome,
        condition: Box<dyn WaitCondition>,
    },

    /// The worker acknowledged a stop request and released every condition.
    WorkerStopped { scheduler: TaskId },
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inbound::LeafDone { task, run, outcome } => f
                .debug_struct("LeafDone")
                .field("task", task)
                .field("run", run)
                .field("outcome", outcome)
                .finish(),
            Inbound::ConditionDone {
                scheduler,
                id,
                outcome,
                condition,
            } => f
                .debug_struct("ConditionDone")
                .field("scheduler", scheduler)
                .field("id", id)
                .field("outcome", outcome)
                .field("condition", &condition.label())
                .finish(),
            Inbound::WorkerStopped { scheduler } => f
                .debug_struct("WorkerStopped")
                .field("scheduler", scheduler)
                .finish(),
        }
    }
}

/// Commands that can be sent to a spawned engine
#[derive(Debug)]
pub enum EngineCommand {
    /// Start a task (normally the root)
    Start {
        /// Task to start.
        task: TaskId,
        /// Result of the request.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Request cooperative cancellation of a task
    Stop {
        /// Task to stop.
        task: TaskId,
        /// Result of the request.
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Query the lifecycle state of a task
    State {
        /// Task to inspect.
        task: TaskId,
        /// Current state, `None` if destroyed.
        response: oneshot::Sender<Option<TaskState>>,
    },

    /// Stop the engine actor without waiting for the root
    Shutdown {
        /// Acknowledged before the engine exits.
        response: oneshot::Sender<()>,
    },
}

impl EngineCommand {
    /// Helper to create a Start command
    pub fn start(task: TaskId) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Start { task, response: tx }, rx)
    }

    /// Helper to create a Stop command
    pub fn stop(task: TaskId) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { task, response: tx }, rx)
    }

    /// Helper to create a State command
    pub fn state(task: TaskId) -> (Self, oneshot::Receiver<Option<TaskState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::State { task, response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Lifecycle notification broadcast to observers.
#[derive(Clone, Debug, Serialize)]
pub struct EngineEvent {
    /// Task the event is about.
    pub task: TaskId,
    /// Display label of the task.
    pub label: String,
    /// Start or finish.
    #[serde(flatten)]
    pub kind: EventKind,
    /// Wall-clock time the engine observed the transition.
    pub at: DateTime<Utc>,
}

/// What happened to the task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// The task began a run.
    Started,
    /// The task reported the outcome of its run.
    Finished {
        /// Result of the run.
        outcome: Outcome,
    },
}

impl EngineEvent {
    pub(crate) fn now(task: TaskId, label: &str, kind: EventKind) -> Self {
        Self {
            task,
            label: label.to_string(),
            kind,
            at: Utc::now(),
        }
    }
}
