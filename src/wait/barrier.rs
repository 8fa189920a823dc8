//! Wait adapters and barriers: the two tree-side halves of a wait.
//!
//! A [`WaitAdapter`] finishes as soon as it has handed its condition to the
//! scheduler's worker, so the list moves on while the hardware settles. A
//! [`Barrier`] later in the list finishes only once every condition bound to
//! it has completed.

use super::{ConditionId, WaitCondition};
use crate::engine::node::NodeKind;
use crate::engine::Engine;
use crate::task::{Outcome, TaskId};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Where a discovered adapter's condition lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Registration {
    pub(crate) scheduler: TaskId,
    pub(crate) id: ConditionId,
}

pub(crate) struct WaitAdapter {
    /// Held until a scheduler discovers the adapter and takes the condition.
    pub(crate) condition: Option<Box<dyn WaitCondition>>,
    pub(crate) registration: Option<Registration>,
}

impl WaitAdapter {
    pub(crate) fn new(condition: Box<dyn WaitCondition>) -> Self {
        Self {
            condition: Some(condition),
            registration: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Barrier {
    /// Conditions claimed at discovery time.
    pub(crate) bound: BTreeSet<ConditionId>,
    /// Bound conditions that have not completed in the current cycle.
    pub(crate) pending: BTreeSet<ConditionId>,
    pub(crate) failed: bool,
    pub(crate) scheduler: Option<TaskId>,
}

impl Barrier {
    pub(crate) fn bind(&mut self, scheduler: TaskId, ids: BTreeSet<ConditionId>) {
        self.scheduler = Some(scheduler);
        self.bound = ids;
        self.reset();
    }

    /// Re-arms the barrier for the next cycle.
    pub(crate) fn reset(&mut self) {
        self.pending = self.bound.clone();
        self.failed = false;
    }

    fn verdict(&self) -> Option<Outcome> {
        if self.failed {
            Some(Outcome::Failed)
        } else if self.pending.is_empty() {
            Some(Outcome::Succeeded)
        } else {
            None
        }
    }
}

impl<S> Engine<S> {
    pub(crate) fn start_adapter(&mut self, id: TaskId) {
        self.mark_running(id);
        let registration = match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Adapter(a)) => a.registration,
            _ => None,
        };
        match registration {
            Some(r) => self.scheduler_release_condition(r.scheduler, r.id),
            None => warn!(task = %id, "Wait adapter is not beneath a wait scheduler; nothing will be polled"),
        }
        self.finish_node(id, Outcome::Succeeded);
    }

    /// Adapters finish within `start`; a stop can only find them idle.
    pub(crate) fn stop_adapter(&mut self, id: TaskId) {
        if self.is_running(id) {
            self.finish_node(id, Outcome::Failed);
        }
    }

    pub(crate) fn start_barrier(&mut self, id: TaskId) {
        self.mark_running(id);
        let Some(barrier) = self.barrier_mut(id) else {
            return;
        };
        if barrier.bound.is_empty() {
            debug!(task = %id, "Barrier has no conditions to wait for");
        }
        match barrier.verdict() {
            Some(outcome) => {
                barrier.reset();
                self.finish_node(id, outcome);
            }
            None => debug!(task = %id, pending = ?barrier.pending, "Barrier waiting"),
        }
    }

    pub(crate) fn stop_barrier(&mut self, id: TaskId) {
        if !self.is_running(id) {
            return;
        }
        if let Some(barrier) = self.barrier_mut(id) {
            barrier.reset();
        }
        self.finish_node(id, Outcome::Failed);
    }

    /// A bound condition completed in the worker.
    pub(crate) fn barrier_condition_done(&mut self, id: TaskId, condition: ConditionId, outcome: Outcome) {
        let running = self.is_running(id);
        let Some(barrier) = self.barrier_mut(id) else {
            return;
        };
        if !barrier.pending.remove(&condition) {
            debug!(task = %id, condition, "Condition was not pending at barrier");
        }
        if !outcome.is_success() {
            barrier.failed = true;
        }
        if !running {
            return;
        }
        if let Some(outcome) = barrier.verdict() {
            barrier.reset();
            self.finish_node(id, outcome);
        }
    }
}
