//! Unit-of-work contract shared by leaves and composites.
//!
//! A task is started by its parent composite and must eventually report
//! exactly one terminal outcome. Leaves implement [`Task`]; composites (task
//! lists, parallel tasks, the wait tasks and wait schedulers) are built into
//! the [`Engine`](crate::Engine).
//!
//! # Completion
//!
//! A leaf reports its outcome either synchronously from inside `start`/`stop`
//! through [`TaskContext::complete`] / [`TaskContext::fail`], or later from any
//! thread through a [`Completion`] handle obtained with
//! [`TaskContext::completion`]. The engine accepts the first outcome of a run
//! and ignores the rest.

use crate::messages::Inbound;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Handle of a task inside an [`Engine`](crate::engine::Engine) arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(usize);

impl TaskId {
    /// Builds an id from its raw arena index.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw arena index.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Lifecycle of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Never started, or reset for a new run.
    Idle,
    /// Started and not yet reported an outcome.
    Running,
    /// Last run succeeded.
    Finished,
    /// Last run failed or was stopped.
    Failed,
}

/// Terminal outcome of one run.
///
/// A failed outcome stands for the `failed()` + `finished()` signal pair:
/// composites observe the failure first and then the completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The run completed.
    Succeeded,
    /// The run failed or was stopped.
    Failed,
}

impl Outcome {
    /// True for [`Outcome::Succeeded`].
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

impl From<Outcome> for TaskState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => TaskState::Finished,
            Outcome::Failed => TaskState::Failed,
        }
    }
}

/// Repetition bookkeeping of a task.
///
/// `times` is the desired number of runs, `remaining` counts down with
/// [`Repeat::once_executed`] and is reset by [`Repeat::restart`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Repeat {
    pub(crate) times: u32,
    pub(crate) remaining: u32,
}

impl Repeat {
    pub(crate) fn new(times: u32) -> Self {
        Self {
            times,
            remaining: times,
        }
    }

    pub(crate) fn once_executed(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    pub(crate) fn restart(&mut self) {
        self.remaining = self.times;
    }
}

impl Default for Repeat {
    fn default() -> Self {
        Self::new(1)
    }
}

/// A leaf unit of work: "start acquisition", "move stage", "set temperature".
///
/// `start` and `stop` run on the coordinator and must not block. Long-running
/// work is spawned and reports back through a [`Completion`].
///
/// `S` is the shared experiment state handed through by the engine untouched.
pub trait Task<S = ()>: Send {
    /// Short name used in logs and tree dumps.
    fn name(&self) -> &str {
        "task"
    }

    /// Begins one execution.
    fn start(&mut self, cx: &mut TaskContext<'_, S>);

    /// Requests cooperative cancellation of the running execution.
    ///
    /// Only called while the task is running. The default reports failure
    /// immediately.
    fn stop(&mut self, cx: &mut TaskContext<'_, S>) {
        cx.fail();
    }
}

/// Per-call view of the engine handed to a leaf.
pub struct TaskContext<'a, S> {
    task: TaskId,
    run: u64,
    shared: &'a mut S,
    inbox: &'a mpsc::UnboundedSender<Inbound>,
    outcome: Option<Outcome>,
}

impl<'a, S> TaskContext<'a, S> {
    pub(crate) fn new(
        task: TaskId,
        run: u64,
        shared: &'a mut S,
        inbox: &'a mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            task,
            run,
            shared,
            inbox,
            outcome: None,
        }
    }

    /// Id of the task being called.
    pub fn id(&self) -> TaskId {
        self.task
    }

    /// Shared experiment state.
    pub fn shared(&mut self) -> &mut S {
        self.shared
    }

    /// Reports success of the current run.
    pub fn complete(&mut self) {
        self.outcome.get_or_insert(Outcome::Succeeded);
    }

    /// Reports failure of the current run.
    pub fn fail(&mut self) {
        self.outcome.get_or_insert(Outcome::Failed);
    }

    /// Handle for reporting the outcome of the current run later.
    pub fn completion(&self) -> Completion {
        Completion {
            task: self.task,
            run: self.run,
            inbox: self.inbox.clone(),
        }
    }

    pub(crate) fn into_outcome(self) -> Option<Outcome> {
        self.outcome
    }
}

/// Deferred outcome reporter for one run of a leaf.
///
/// Reports for a run that is no longer current (the task was stopped or
/// restarted in the meantime) are discarded by the engine.
#[derive(Clone, Debug)]
pub struct Completion {
    task: TaskId,
    run: u64,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl Completion {
    /// Reports success.
    pub fn complete(&self) {
        self.finish(Outcome::Succeeded);
    }

    /// Reports failure.
    pub fn fail(&self) {
        self.finish(Outcome::Failed);
    }

    /// Reports the given outcome.
    pub fn finish(&self, outcome: Outcome) {
        // A closed inbox means the engine is gone; nobody is left to tell.
        let _ = self.inbox.send(Inbound::LeafDone {
            task: self.task,
            run: self.run,
            outcome,
        });
    }

    /// Task this handle reports for.
    pub fn task(&self) -> TaskId {
        self.task
    }
}
