//! Sequential composite.
//!
//! A list runs its children one after another in insertion order. Each child
//! is restarted when the list reaches it and runs `repeat` times back to
//! back. A child that is not deferred is destroyed after its last run, so a
//! one-shot list empties itself as it goes. Children inside a list that will
//! loop again (the list is deferred or has runs left) are marked deferred on
//! dispatch and survive for the next pass.
//!
//! A failed child or a stop request ends the list early. The rest of the
//! pending queue is abandoned and the list reports failure.

use crate::engine::Engine;
use crate::task::{Outcome, TaskId};
use std::collections::VecDeque;
use tracing::debug;

/// State of one list node. The children live in the engine arena.
#[derive(Debug, Default)]
pub(crate) struct TaskList {
    /// Children in insertion order.
    pub(crate) master: Vec<TaskId>,
    /// Children still to run in the current pass; the front one is current.
    pub(crate) pending: VecDeque<TaskId>,
    pub(crate) running: bool,
    pub(crate) stop_requested: bool,
    pub(crate) failed: bool,
}

impl<S> Engine<S> {
    pub(crate) fn start_list(&mut self, id: TaskId) {
        let Some(list) = self.list_mut(id) else {
            return;
        };
        if list.running {
            debug!(task = %id, "List already running");
            return;
        }
        list.running = true;
        list.stop_requested = false;
        list.failed = false;
        list.pending = list.master.iter().copied().collect();
        self.mark_running(id);
        self.list_next(id);
    }

    pub(crate) fn stop_list(&mut self, id: TaskId) {
        let Some(list) = self.list_mut(id) else {
            return;
        };
        if list.stop_requested {
            return;
        }
        list.stop_requested = true;
        let current = if list.running {
            list.pending.front().copied()
        } else {
            None
        };
        if let Some(current) = current {
            self.stop_task(current);
        }
    }

    /// Dispatches the head of the pending queue, or finishes.
    fn list_next(&mut self, id: TaskId) {
        let Some(head) = self.list(id).and_then(|l| l.pending.front().copied()) else {
            self.finish_list(id);
            return;
        };

        let loops_again = self
            .get(id)
            .is_some_and(|n| n.deferred || n.repeat.remaining > 1);
        self.restart(head);
        self.apply_deferred(head, loops_again);

        if self.remaining(head).unwrap_or(0) > 0 {
            self.start_task(head);
        } else {
            debug!(list = %id, task = %head, "Skipping task without runs");
            self.signal_skipped(head, id);
        }
    }

    pub(crate) fn list_child_finished(&mut self, id: TaskId, child: TaskId, outcome: Outcome) {
        let Some(list) = self.list_mut(id) else {
            return;
        };
        if !list.running || list.pending.front() != Some(&child) {
            debug!(list = %id, task = %child, "Ignoring completion of task that is not current");
            return;
        }
        if !outcome.is_success() {
            list.failed = true;
        }

        if list.stop_requested || list.failed {
            let abandoned: Vec<TaskId> = list.pending.drain(..).skip(1).collect();
            for task in abandoned {
                self.stop_task(task);
            }
            self.retire_spent(id);
            self.finish_list(id);
            return;
        }

        self.once_executed(child);
        if self.remaining(child).unwrap_or(0) > 0 {
            self.start_task(child);
            return;
        }

        if self.is_deferred(child).unwrap_or(false) {
            self.restart(child);
        } else {
            self.destroy(child);
            if let Some(list) = self.list_mut(id) {
                list.master.retain(|t| *t != child);
            }
        }
        if let Some(list) = self.list_mut(id) {
            list.pending.pop_front();
        }
        self.list_next(id);
    }

    /// Destroys children that will never run again.
    fn retire_spent(&mut self, id: TaskId) {
        let Some(list) = self.list(id) else {
            return;
        };
        let spent: Vec<TaskId> = list
            .master
            .iter()
            .copied()
            .filter(|t| {
                self.get(*t)
                    .map_or(true, |n| !n.deferred && n.repeat.remaining == 0)
            })
            .collect();
        for task in &spent {
            self.destroy(*task);
        }
        if let Some(list) = self.list_mut(id) {
            list.master.retain(|t| !spent.contains(t));
        }
    }

    fn finish_list(&mut self, id: TaskId) {
        let Some(list) = self.list_mut(id) else {
            return;
        };
        list.running = false;
        let outcome = if list.stop_requested || list.failed {
            Outcome::Failed
        } else {
            Outcome::Succeeded
        };
        if self.scheduler_mut(id).is_some() {
            self.scheduler_list_finished(id, outcome);
        } else {
            self.finish_node(id, outcome);
        }
    }
}
