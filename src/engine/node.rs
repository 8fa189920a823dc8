//! Arena node: one task of any kind plus its bookkeeping.

use crate::parallel::ParallelTask;
use crate::task::{Repeat, Task, TaskId, TaskState};
use crate::task_list::TaskList;
use crate::wait::barrier::{Barrier, WaitAdapter};
use crate::wait::scheduler::WaitScheduler;

pub(crate) struct Node<S> {
    pub(crate) label: String,
    pub(crate) parent: Option<TaskId>,
    pub(crate) repeat: Repeat,
    /// Survive past zero remaining runs because an ancestor will loop again.
    pub(crate) deferred: bool,
    pub(crate) state: TaskState,
    /// Incremented on every start; stale completions carry an older value.
    pub(crate) run: u64,
    pub(crate) kind: NodeKind<S>,
}

impl<S> Node<S> {
    pub(crate) fn new(label: impl Into<String>, kind: NodeKind<S>) -> Self {
        Self {
            label: label.into(),
            parent: None,
            repeat: Repeat::default(),
            deferred: false,
            state: TaskState::Idle,
            run: 0,
            kind,
        }
    }
}

/// Closed set of task kinds. Leaves are the only open extension point.
pub(crate) enum NodeKind<S> {
    /// `None` only while the leaf is being called.
    Leaf(Option<Box<dyn Task<S>>>),
    List(TaskList),
    Parallel(ParallelTask),
    Adapter(WaitAdapter),
    Barrier(Barrier),
    Scheduler(WaitScheduler),
}

impl<S> NodeKind<S> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            NodeKind::Leaf(_) => "leaf",
            NodeKind::List(_) => "task list",
            NodeKind::Parallel(_) => "parallel task",
            NodeKind::Adapter(_) => "wait adapter",
            NodeKind::Barrier(_) => "barrier",
            NodeKind::Scheduler(_) => "wait scheduler",
        }
    }
}

/// Queued terminal outcome of a task, addressed to its parent.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Signal {
    pub(crate) from: TaskId,
    pub(crate) parent: Option<TaskId>,
    pub(crate) outcome: crate::task::Outcome,
}
