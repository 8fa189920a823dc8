//! Fork/join composite.
//!
//! A parallel task owns a fixed number of branch lists and starts all of
//! them at once. It finishes when every branch has finished. The first
//! branch to fail stops all the others; the parallel task then reports
//! failure, but only after every branch has acknowledged the stop, so no
//! branch is still running when the parent moves on.

use crate::engine::Engine;
use crate::task::{Outcome, TaskId};
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct ParallelTask {
    /// Branch lists, parented to this task.
    pub(crate) branches: Vec<TaskId>,
    pub(crate) running_branches: usize,
    pub(crate) running: bool,
    pub(crate) stopped: bool,
    /// Stop has been forwarded to every branch.
    pub(crate) all_branches_stopped: bool,
    /// Every branch finished before the stop was fully forwarded.
    pub(crate) all_branches_finished: bool,
}

impl<S> Engine<S> {
    pub(crate) fn start_parallel(&mut self, id: TaskId) {
        let Some(p) = self.parallel_mut(id) else {
            return;
        };
        if p.running {
            debug!(task = %id, "Parallel task already running");
            return;
        }
        p.running = true;
        p.stopped = false;
        p.all_branches_stopped = false;
        p.all_branches_finished = false;
        p.running_branches = p.branches.len();
        let branches = p.branches.clone();

        self.mark_running(id);
        for branch in branches {
            self.start_list(branch);
        }
    }

    pub(crate) fn stop_parallel(&mut self, id: TaskId) {
        let Some(p) = self.parallel_mut(id) else {
            return;
        };
        if !p.running {
            return;
        }
        p.stopped = true;
        let branches = p.branches.clone();

        for branch in branches {
            self.stop_list(branch);
        }

        let Some(p) = self.parallel_mut(id) else {
            return;
        };
        if p.all_branches_finished {
            p.running = false;
            self.finish_node(id, Outcome::Failed);
        } else {
            p.all_branches_stopped = true;
        }
    }

    pub(crate) fn parallel_branch_finished(&mut self, id: TaskId, branch: TaskId, outcome: Outcome) {
        let Some(p) = self.parallel_mut(id) else {
            return;
        };
        if !p.running || !p.branches.contains(&branch) {
            return;
        }
        if !outcome.is_success() && !p.stopped {
            debug!(task = %id, %branch, "Branch failed, stopping the others");
            self.stop_parallel(id);
        }

        let Some(p) = self.parallel_mut(id) else {
            return;
        };
        p.running_branches = p.running_branches.saturating_sub(1);
        if p.running_branches > 0 {
            return;
        }
        if p.stopped && !p.all_branches_stopped {
            p.all_branches_finished = true;
            return;
        }
        p.running = false;
        let outcome = if p.stopped {
            Outcome::Failed
        } else {
            Outcome::Succeeded
        };
        self.finish_node(id, outcome);
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Engine;
    use crate::leaves::FnTask;
    use crate::task::{Outcome, TaskState};

    fn tick(tag: &'static str) -> FnTask<impl FnMut(&mut Vec<&'static str>) -> anyhow::Result<()> + Send> {
        FnTask::new(tag, move |log: &mut Vec<&'static str>| {
            log.push(tag);
            Ok(())
        })
    }

    #[test]
    fn test_all_branches_join() {
        let mut engine = Engine::new(Vec::new());
        let fork = engine.parallel(3);
        for (branch, tag) in ["x", "y", "z"].into_iter().enumerate() {
            let leaf = engine.leaf(tick(tag));
            engine.add_branch_task(fork, branch, leaf).unwrap();
        }

        engine.start(fork).unwrap();

        let mut log = engine.shared().clone();
        log.sort();
        assert_eq!(log, vec!["x", "y", "z"]);
        assert_eq!(engine.state(fork), Some(TaskState::Finished));
    }

    #[test]
    fn test_failing_branch_fails_fork() {
        let mut engine = Engine::new(Vec::new());
        let fork = engine.parallel(2);
        let bad = engine.leaf(FnTask::new("bad", |_: &mut Vec<&'static str>| {
            anyhow::bail!("grating stalled")
        }));
        let after = engine.leaf(tick("after"));
        engine.add_branch_task(fork, 0, bad).unwrap();
        engine.add_branch_task(fork, 0, after).unwrap();
        let other = engine.leaf(tick("other"));
        engine.add_branch_task(fork, 1, other).unwrap();

        engine.start(fork).unwrap();

        assert_eq!(engine.outcome(fork), Some(Outcome::Failed));
        assert!(!engine.shared().contains(&"after"));
    }

    #[test]
    fn test_repeated_fork_keeps_branch_contents() {
        let mut engine = Engine::new(Vec::new());
        let outer = engine.task_list();
        let fork = engine.parallel(1);
        engine.set_repeat(fork, 3).unwrap();
        let leaf = engine.leaf(tick("shot"));
        engine.add_branch_task(fork, 0, leaf).unwrap();
        engine.add_task(outer, fork).unwrap();

        engine.start(outer).unwrap();

        assert_eq!(engine.shared().len(), 3);
        assert_eq!(engine.outcome(outer), Some(Outcome::Succeeded));
        assert!(!engine.contains(leaf));
    }
}
