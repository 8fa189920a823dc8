//! Wait scheduler: a task list that owns a polling worker.
//!
//! When a task is added beneath a scheduler its subtree is walked once.
//! Every wait adapter found gets the smallest free condition number and its
//! condition moves into the scheduler's registry. Every barrier found claims
//! all conditions discovered since the previous barrier. Adapters with no
//! barrier after them stay registered but are never handed to the worker.
//!
//! A stop is finished in two halves: the list has to unwind and the worker
//! has to acknowledge that it released every condition. Whichever comes
//! second reports the scheduler's failure.

use super::barrier::Registration;
use super::worker::WorkerHandle;
use super::{ConditionId, WaitCondition};
use crate::engine::node::NodeKind;
use crate::engine::Engine;
use crate::task::{Outcome, TaskId};
use crate::task_list::TaskList;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

pub(crate) struct ConditionEntry {
    /// `None` while the worker holds the condition.
    pub(crate) condition: Option<Box<dyn WaitCondition>>,
    pub(crate) label: String,
    pub(crate) deferred: bool,
    /// A barrier claimed it; unhandled conditions are never started.
    pub(crate) handled: bool,
    pub(crate) barrier: Option<TaskId>,
}

#[derive(Default)]
pub(crate) struct WaitScheduler {
    pub(crate) list: TaskList,
    pub(crate) registry: BTreeMap<ConditionId, ConditionEntry>,
    /// Discovered since the last barrier.
    pub(crate) unclaimed: BTreeSet<ConditionId>,
    pub(crate) barriers: Vec<TaskId>,
    pub(crate) worker: Option<WorkerHandle>,
    pub(crate) quit: bool,
    pub(crate) list_done: bool,
    pub(crate) worker_done: bool,
}

impl WaitScheduler {
    fn next_free_id(&self) -> ConditionId {
        (0..)
            .find(|id| !self.registry.contains_key(id))
            .unwrap_or(ConditionId::MAX)
    }
}

enum Found {
    Adapter(Box<dyn WaitCondition>),
    Barrier,
    Children(Vec<TaskId>),
    Nothing,
}

impl<S> Engine<S> {
    /// Registers adapters and binds barriers in the subtree of `task`.
    pub(crate) fn discover(&mut self, scheduler: TaskId, task: TaskId) {
        let found = match self.get_mut(task).map(|n| &mut n.kind) {
            Some(NodeKind::Adapter(a)) if a.registration.is_none() => {
                a.condition.take().map_or(Found::Nothing, Found::Adapter)
            }
            Some(NodeKind::Barrier(b)) if b.scheduler.is_none() => Found::Barrier,
            Some(NodeKind::List(l)) => Found::Children(l.master.clone()),
            Some(NodeKind::Parallel(p)) => Found::Children(p.branches.clone()),
            // A nested scheduler handles its own subtree.
            _ => Found::Nothing,
        };

        match found {
            Found::Adapter(condition) => self.register_condition(scheduler, task, condition),
            Found::Barrier => self.bind_barrier(scheduler, task),
            Found::Children(children) => {
                for child in children {
                    self.discover(scheduler, child);
                }
            }
            Found::Nothing => {}
        }
    }

    fn register_condition(&mut self, scheduler: TaskId, adapter: TaskId, condition: Box<dyn WaitCondition>) {
        let deferred = self.is_deferred(adapter).unwrap_or(false);
        let Some(s) = self.scheduler_mut(scheduler) else {
            return;
        };
        let id = s.next_free_id();
        let label = condition.label().to_string();
        debug!(%scheduler, task = %adapter, condition = id, %label, "Condition registered");
        s.registry.insert(
            id,
            ConditionEntry {
                condition: Some(condition),
                label,
                deferred,
                handled: false,
                barrier: None,
            },
        );
        s.unclaimed.insert(id);

        if let Some(NodeKind::Adapter(a)) = self.get_mut(adapter).map(|n| &mut n.kind) {
            a.registration = Some(Registration { scheduler, id });
        }
    }

    fn bind_barrier(&mut self, scheduler: TaskId, barrier: TaskId) {
        let Some(s) = self.scheduler_mut(scheduler) else {
            return;
        };
        let ids = std::mem::take(&mut s.unclaimed);
        for id in &ids {
            if let Some(entry) = s.registry.get_mut(id) {
                entry.handled = true;
                entry.barrier = Some(barrier);
            }
        }
        s.barriers.push(barrier);
        if ids.is_empty() {
            warn!(%scheduler, task = %barrier, "Barrier bound to no conditions");
        } else {
            debug!(%scheduler, task = %barrier, conditions = ?ids, "Barrier bound");
        }

        if let Some(b) = self.barrier_mut(barrier) {
            b.bind(scheduler, ids);
        }
    }

    pub(crate) fn start_scheduler(&mut self, id: TaskId) {
        let Some(s) = self.scheduler_mut(id) else {
            return;
        };
        if s.list.running {
            debug!(task = %id, "Wait scheduler already running");
            return;
        }
        s.quit = false;
        s.list_done = false;
        s.worker_done = false;
        let needs_worker = s.worker.is_none();
        let barriers = s.barriers.clone();

        if needs_worker {
            match WorkerHandle::spawn(id, &self.worker_config, self.inbox_tx.clone()) {
                Ok(worker) => {
                    if let Some(s) = self.scheduler_mut(id) {
                        s.worker = Some(worker);
                    }
                }
                Err(err) => {
                    error!(task = %id, error = %err, "Cannot start wait worker");
                    self.mark_running(id);
                    self.finish_node(id, Outcome::Failed);
                    return;
                }
            }
        }

        for barrier in barriers {
            if !self.is_running(barrier) {
                if let Some(b) = self.barrier_mut(barrier) {
                    b.reset();
                }
            }
        }
        self.start_list(id);
    }

    pub(crate) fn stop_scheduler(&mut self, id: TaskId) {
        let Some(s) = self.scheduler_mut(id) else {
            return;
        };
        if !s.list.running || s.quit {
            return;
        }
        s.quit = true;
        let acknowledged = s.worker.as_ref().is_some_and(WorkerHandle::stop);
        if !acknowledged {
            s.worker = None;
            s.worker_done = true;
        }
        self.stop_list(id);
    }

    /// The scheduler's own list ran out or unwound.
    pub(crate) fn scheduler_list_finished(&mut self, id: TaskId, outcome: Outcome) {
        let Some(s) = self.scheduler_mut(id) else {
            return;
        };
        if s.quit {
            if s.worker_done {
                self.scheduler_finish(id, Outcome::Failed);
            } else {
                debug!(task = %id, "Waiting for wait worker to stop");
                s.list_done = true;
            }
            return;
        }
        self.scheduler_finish(id, outcome);
    }

    pub(crate) fn scheduler_worker_stopped(&mut self, id: TaskId) {
        let Some(s) = self.scheduler_mut(id) else {
            return;
        };
        s.worker = None;
        if !s.quit {
            return;
        }
        if s.list_done {
            self.scheduler_finish(id, Outcome::Failed);
        } else {
            s.worker_done = true;
        }
    }

    fn scheduler_finish(&mut self, id: TaskId, outcome: Outcome) {
        let last_run = self
            .get(id)
            .is_some_and(|n| n.repeat.remaining < 2 && !n.deferred);
        let Some(s) = self.scheduler_mut(id) else {
            return;
        };
        s.quit = false;
        s.list_done = false;
        s.worker_done = false;
        if last_run {
            // Dropping the handle ends the worker.
            s.worker = None;
            s.registry.clear();
            s.unclaimed.clear();
        }
        self.finish_node(id, outcome);
    }

    /// Hands a registered condition to the worker.
    pub(crate) fn scheduler_release_condition(&mut self, id: TaskId, condition: ConditionId) {
        let Some(s) = self.scheduler_mut(id) else {
            return;
        };
        let Some(entry) = s.registry.get_mut(&condition) else {
            warn!(scheduler = %id, condition, "Condition no longer registered");
            return;
        };
        if !entry.handled {
            warn!(
                scheduler = %id,
                condition,
                label = %entry.label,
                "No barrier follows this wait; condition is not started"
            );
            return;
        }
        let Some(boxed) = entry.condition.take() else {
            warn!(scheduler = %id, condition, label = %entry.label, "Condition is still active");
            return;
        };
        let barrier = entry.barrier;

        let rejected = match &s.worker {
            Some(worker) => worker.add(condition, boxed).err(),
            None => Some(boxed),
        };
        if let Some(boxed) = rejected {
            error!(scheduler = %id, condition, "Wait worker is gone");
            if let Some(entry) = s.registry.get_mut(&condition) {
                entry.condition = Some(boxed);
            }
            if let Some(barrier) = barrier {
                self.barrier_condition_done(barrier, condition, Outcome::Failed);
            }
        }
    }

    /// The worker returned a condition.
    pub(crate) fn scheduler_condition_done(
        &mut self,
        id: TaskId,
        condition: ConditionId,
        outcome: Outcome,
        boxed: Box<dyn WaitCondition>,
    ) {
        let last_run = self
            .get(id)
            .is_some_and(|n| n.repeat.remaining < 2 && !n.deferred);
        let Some(s) = self.scheduler_mut(id) else {
            return;
        };
        let quitting = s.quit;
        let Some(entry) = s.registry.get_mut(&condition) else {
            debug!(scheduler = %id, condition, "Dropping returned condition");
            return;
        };
        entry.condition = Some(boxed);
        let barrier = entry.barrier;
        if quitting {
            return;
        }
        if last_run && !entry.deferred {
            s.registry.remove(&condition);
            debug!(scheduler = %id, condition, "Condition retired");
        }
        if let Some(barrier) = barrier {
            self.barrier_condition_done(barrier, condition, outcome);
        }
    }

    pub(crate) fn set_condition_deferred(&mut self, id: TaskId, condition: ConditionId, deferred: bool) {
        if let Some(entry) = self
            .scheduler_mut(id)
            .and_then(|s| s.registry.get_mut(&condition))
        {
            entry.deferred = deferred;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Engine;
    use crate::task::Outcome;
    use crate::wait::conditions::DelayCondition;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_smallest_free_id() {
        let mut engine: Engine = Engine::default();
        let root = engine.wait_scheduler();
        let waits: Vec<_> = (0..3)
            .map(|_| engine.wait_for(DelayCondition::new(Duration::from_millis(10))))
            .collect();
        for wait in &waits {
            engine.add_task(root, *wait).unwrap();
        }
        assert_eq!(engine.registered_conditions(root), vec![0, 1, 2]);

        if let Some(s) = engine.scheduler_mut(root) {
            s.registry.remove(&1);
            assert_eq!(s.next_free_id(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_unclaimed_wait_is_reported() {
        let mut engine: Engine = Engine::default();
        let root = engine.wait_scheduler();
        let wait = engine.wait_for(DelayCondition::new(Duration::from_secs(1)).with_label("lamp"));
        engine.add_task(root, wait).unwrap();

        assert_eq!(engine.run(root).await.unwrap(), Outcome::Succeeded);
        assert!(logs_contain("No barrier follows this wait"));
    }

    #[test]
    fn test_scheduler_without_runtime_fails() {
        let mut engine: Engine = Engine::default();
        let root = engine.wait_scheduler();
        engine.start(root).unwrap();
        assert_eq!(engine.outcome(root), Some(Outcome::Failed));
    }
}
