//! The coordinator: task arena, signal routing and the public composition API.
//!
//! All tasks of a graph live in one [`Engine`]. Composites refer to their
//! children by [`TaskId`]; every child records its parent. A task that
//! finishes does not call its parent directly. It queues a signal, and the
//! engine delivers queued signals in FIFO order until nothing is left, so a
//! composite never re-enters itself while handling a child's completion.
//!
//! Work that happens elsewhere (spawned leaf futures, the wait worker) comes
//! back through the inbox channel and is processed the same way. Driving the
//! engine is either synchronous ([`Engine::run_until_idle`]), awaited in
//! place ([`Engine::run`]), or moved into its own task with
//! [`Engine::spawn`] and controlled through an [`EngineHandle`].

mod handle;
pub(crate) mod node;

pub use handle::{EngineHandle, RunReport};

use crate::config::{EngineConfig, SequencerConfig, WorkerConfig};
use crate::error::{AppResult, SequencerError};
use crate::messages::{EngineEvent, EventKind, Inbound};
use crate::parallel::ParallelTask;
use crate::task::{Outcome, Repeat, Task, TaskContext, TaskId, TaskState};
use crate::task_list::TaskList;
use crate::wait::barrier::{Barrier, WaitAdapter};
use crate::wait::scheduler::WaitScheduler;
use crate::wait::{ConditionId, WaitCondition};
use node::{Node, NodeKind, Signal};
use std::collections::VecDeque;
use std::fmt::Write as _;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

enum LeafCall {
    Start,
    Stop,
}

/// Owner of a task graph.
///
/// `S` is shared experiment state handed to every leaf call.
pub struct Engine<S = ()> {
    pub(crate) nodes: Vec<Option<Node<S>>>,
    pub(crate) signals: VecDeque<Signal>,
    pub(crate) inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,
    events: broadcast::Sender<EngineEvent>,
    pub(crate) shared: S,
    pub(crate) engine_config: EngineConfig,
    pub(crate) worker_config: WorkerConfig,
}

impl<S: Default> Default for Engine<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> Engine<S> {
    /// Creates an empty engine with default configuration.
    pub fn new(shared: S) -> Self {
        Self::with_config(&SequencerConfig::default(), shared)
    }

    /// Creates an empty engine.
    pub fn with_config(config: &SequencerConfig, shared: S) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.engine.event_capacity.max(1));
        Self {
            nodes: Vec::new(),
            signals: VecDeque::new(),
            inbox_tx,
            inbox_rx,
            events,
            shared,
            engine_config: config.engine.clone(),
            worker_config: config.worker.clone(),
        }
    }

    // ---- construction -------------------------------------------------

    fn insert(&mut self, node: Node<S>) -> TaskId {
        let id = TaskId::from_raw(self.nodes.len());
        self.nodes.push(Some(node));
        id
    }

    /// Adds a leaf task.
    pub fn leaf<T>(&mut self, task: T) -> TaskId
    where
        T: Task<S> + 'static,
    {
        let label = task.name().to_string();
        self.insert(Node::new(label, NodeKind::Leaf(Some(Box::new(task)))))
    }

    /// Adds an empty sequential list.
    pub fn task_list(&mut self) -> TaskId {
        self.insert(Node::new("list", NodeKind::List(TaskList::default())))
    }

    /// Adds a fork with `branches` lists running concurrently (at least one).
    pub fn parallel(&mut self, branches: usize) -> TaskId {
        let id = self.insert(Node::new("parallel", NodeKind::Parallel(ParallelTask::default())));
        let lists: Vec<TaskId> = (0..branches.max(1))
            .map(|index| {
                let mut node = Node::new(format!("branch {}", index), NodeKind::List(TaskList::default()));
                node.parent = Some(id);
                self.insert(node)
            })
            .collect();
        if let Some(p) = self.parallel_mut(id) {
            p.branches = lists;
        }
        id
    }

    /// Adds a wait adapter for `condition`.
    ///
    /// The condition is only polled if the adapter ends up beneath a
    /// [`wait_scheduler`](Self::wait_scheduler) and is followed there by a
    /// [`barrier`](Self::barrier).
    pub fn wait_for<C>(&mut self, condition: C) -> TaskId
    where
        C: WaitCondition + 'static,
    {
        let label = condition.label().to_string();
        self.insert(Node::new(
            label,
            NodeKind::Adapter(WaitAdapter::new(Box::new(condition))),
        ))
    }

    /// Adds a barrier that waits for every condition started since the
    /// previous barrier.
    pub fn barrier(&mut self) -> TaskId {
        self.insert(Node::new("barrier", NodeKind::Barrier(Barrier::default())))
    }

    /// Adds a list that owns a wait worker and the conditions beneath it.
    pub fn wait_scheduler(&mut self) -> TaskId {
        self.insert(Node::new(
            "wait scheduler",
            NodeKind::Scheduler(WaitScheduler::default()),
        ))
    }

    /// Appends `child` to a list or scheduler.
    ///
    /// Returns `Ok(false)` without adding when `child` has no remaining
    /// runs.
    pub fn add_task(&mut self, list: TaskId, child: TaskId) -> AppResult<bool> {
        match &self.node(list)?.kind {
            NodeKind::List(_) | NodeKind::Scheduler(_) => {}
            _ => {
                return Err(SequencerError::WrongKind {
                    task: list,
                    expected: "task list",
                })
            }
        }
        self.attach(list, list, child)
    }

    /// Appends `child` to branch `branch` of a parallel task.
    pub fn add_branch_task(&mut self, parallel: TaskId, branch: usize, child: TaskId) -> AppResult<bool> {
        let branches = match &self.node(parallel)?.kind {
            NodeKind::Parallel(p) => p.branches.clone(),
            _ => {
                return Err(SequencerError::WrongKind {
                    task: parallel,
                    expected: "parallel task",
                })
            }
        };
        let Some(&list) = branches.get(branch) else {
            return Err(SequencerError::BranchOutOfRange {
                task: parallel,
                branch,
                branches: branches.len(),
            });
        };
        self.attach(parallel, list, child)
    }

    fn attach(&mut self, owner: TaskId, list: TaskId, child: TaskId) -> AppResult<bool> {
        let node = self.node(child)?;
        if node.parent.is_some() {
            return Err(SequencerError::AlreadyParented(child));
        }
        if child == owner || self.ancestors(owner).any(|a| a == child) {
            return Err(SequencerError::Cycle { parent: owner, child });
        }
        if node.repeat.remaining == 0 {
            debug!(task = %child, "Not adding task without remaining runs");
            return Ok(false);
        }

        if let Some(scheduler) = self.enclosing_scheduler(list) {
            self.discover(scheduler, child);
        }
        if let Some(node) = self.get_mut(child) {
            node.parent = Some(list);
        }
        if let Some(l) = self.list_mut(list) {
            l.master.push(child);
        }
        debug!(list = %list, task = %child, "Task added");
        Ok(true)
    }

    fn ancestors(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        std::iter::successors(self.get(id).and_then(|n| n.parent), move |p| {
            self.get(*p).and_then(|n| n.parent)
        })
    }

    /// Nearest scheduler at or above `list`.
    fn enclosing_scheduler(&self, list: TaskId) -> Option<TaskId> {
        std::iter::once(list)
            .chain(self.ancestors(list))
            .find(|id| matches!(self.get(*id).map(|n| &n.kind), Some(NodeKind::Scheduler(_))))
    }

    // ---- properties ---------------------------------------------------

    /// Sets how many times the task runs when its list reaches it.
    pub fn set_repeat(&mut self, id: TaskId, times: u32) -> AppResult<()> {
        let node = self.node_mut(id)?;
        node.repeat = Repeat::new(times);
        if let NodeKind::Parallel(p) = &node.kind {
            if times > 1 {
                for branch in p.branches.clone() {
                    self.apply_deferred(branch, true);
                }
            }
        }
        Ok(())
    }

    /// Marks the task to be kept after its last run.
    pub fn set_deferred(&mut self, id: TaskId, deferred: bool) -> AppResult<()> {
        self.node(id)?;
        self.apply_deferred(id, deferred);
        Ok(())
    }

    /// Replaces the display label.
    pub fn set_label(&mut self, id: TaskId, label: impl Into<String>) -> AppResult<()> {
        self.node_mut(id)?.label = label.into();
        Ok(())
    }

    // ---- control ------------------------------------------------------

    /// Starts a task and processes everything that follows synchronously.
    pub fn start(&mut self, id: TaskId) -> AppResult<()> {
        self.node(id)?;
        info!(task = %id, label = %self.label(id).unwrap_or_default(), "Starting");
        self.start_task(id);
        self.run_until_idle();
        Ok(())
    }

    /// Requests cooperative cancellation of a task.
    pub fn stop(&mut self, id: TaskId) -> AppResult<()> {
        self.node(id)?;
        info!(task = %id, "Stop requested");
        self.stop_task(id);
        self.run_until_idle();
        Ok(())
    }

    /// Processes queued signals and already-arrived inbox messages.
    pub fn run_until_idle(&mut self) {
        self.drain();
        while let Ok(message) = self.inbox_rx.try_recv() {
            self.handle_inbound(message);
            self.drain();
        }
    }

    /// Waits for the next inbox message and processes it.
    pub async fn step(&mut self) -> AppResult<()> {
        let message = self.inbox_rx.recv().await.ok_or(SequencerError::ChannelClosed)?;
        self.handle_inbound(message);
        self.run_until_idle();
        Ok(())
    }

    /// Starts `root` and drives the engine until it reports an outcome.
    pub async fn run(&mut self, root: TaskId) -> AppResult<Outcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, %root);
        self.drive(root).instrument(span).await
    }

    async fn drive(&mut self, root: TaskId) -> AppResult<Outcome> {
        self.start(root)?;
        loop {
            if let Some(outcome) = self.outcome(root) {
                info!(?outcome, "Run complete");
                return Ok(outcome);
            }
            self.step().await?;
        }
    }

    /// Receives a start and a finish event for every task run.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Shared experiment state.
    pub fn shared(&self) -> &S {
        &self.shared
    }

    /// Mutable shared experiment state.
    pub fn shared_mut(&mut self) -> &mut S {
        &mut self.shared
    }

    // ---- introspection ------------------------------------------------

    /// Whether `id` still exists. Finished non-deferred tasks are destroyed.
    pub fn contains(&self, id: TaskId) -> bool {
        self.get(id).is_some()
    }

    /// Lifecycle state, `None` once the task is destroyed.
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.get(id).map(|n| n.state)
    }

    /// Terminal outcome of the last run, if the task is not running.
    pub fn outcome(&self, id: TaskId) -> Option<Outcome> {
        match self.state(id)? {
            TaskState::Finished => Some(Outcome::Succeeded),
            TaskState::Failed => Some(Outcome::Failed),
            TaskState::Idle | TaskState::Running => None,
        }
    }

    /// Display label.
    pub fn label(&self, id: TaskId) -> Option<String> {
        self.get(id).map(|n| n.label.clone())
    }

    /// Configured number of runs.
    pub fn repeat(&self, id: TaskId) -> Option<u32> {
        self.get(id).map(|n| n.repeat.times)
    }

    /// Runs left before the task is retired.
    pub fn remaining(&self, id: TaskId) -> Option<u32> {
        self.get(id).map(|n| n.repeat.remaining)
    }

    /// Whether the task survives its last run.
    pub fn is_deferred(&self, id: TaskId) -> Option<bool> {
        self.get(id).map(|n| n.deferred)
    }

    /// Composite owning the task, if attached.
    pub fn parent(&self, id: TaskId) -> Option<TaskId> {
        self.get(id).and_then(|n| n.parent)
    }

    /// Children of a list or scheduler in master order, or the branch
    /// lists of a parallel task.
    pub fn children(&self, id: TaskId) -> Vec<TaskId> {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::List(l)) => l.master.clone(),
            Some(NodeKind::Scheduler(s)) => s.list.master.clone(),
            Some(NodeKind::Parallel(p)) => p.branches.clone(),
            _ => Vec::new(),
        }
    }

    /// Condition number assigned to a wait adapter by its scheduler.
    pub fn condition_id(&self, adapter: TaskId) -> Option<ConditionId> {
        match self.get(adapter).map(|n| &n.kind) {
            Some(NodeKind::Adapter(a)) => a.registration.map(|r| r.id),
            _ => None,
        }
    }

    /// Conditions a barrier is bound to.
    pub fn bound_conditions(&self, barrier: TaskId) -> Vec<ConditionId> {
        match self.get(barrier).map(|n| &n.kind) {
            Some(NodeKind::Barrier(b)) => b.bound.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Conditions currently registered with a scheduler.
    pub fn registered_conditions(&self, scheduler: TaskId) -> Vec<ConditionId> {
        match self.get(scheduler).map(|n| &n.kind) {
            Some(NodeKind::Scheduler(s)) => s.registry.keys().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Indented tree dump rooted at `root`.
    pub fn describe(&self, root: TaskId) -> String {
        let mut out = String::new();
        self.describe_into(root, 0, &mut out);
        out
    }

    fn describe_into(&self, id: TaskId, depth: usize, out: &mut String) {
        let Some(node) = self.get(id) else {
            return;
        };
        let _ = write!(out, "{:indent$}{} {:?}", "", node.kind.name(), node.label, indent = depth * 2);
        if node.repeat.times != 1 {
            let _ = write!(out, " x{}", node.repeat.times);
        }
        if node.deferred {
            out.push_str(" (deferred)");
        }
        match &node.kind {
            NodeKind::Adapter(a) => {
                if let Some(r) = a.registration {
                    let _ = write!(out, " [condition {}]", r.id);
                }
            }
            NodeKind::Barrier(b) => {
                let _ = write!(out, " {:?}", b.bound);
            }
            _ => {}
        }
        out.push('\n');
        for child in self.children(id) {
            self.describe_into(child, depth + 1, out);
        }
    }

    // ---- arena access -------------------------------------------------

    pub(crate) fn get(&self, id: TaskId) -> Option<&Node<S>> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Node<S>> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn node(&self, id: TaskId) -> AppResult<&Node<S>> {
        self.get(id).ok_or(SequencerError::UnknownTask(id))
    }

    fn node_mut(&mut self, id: TaskId) -> AppResult<&mut Node<S>> {
        self.get_mut(id).ok_or(SequencerError::UnknownTask(id))
    }

    /// The sequential list of a list or scheduler node.
    pub(crate) fn list_mut(&mut self, id: TaskId) -> Option<&mut TaskList> {
        match self.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::List(l)) => Some(l),
            Some(NodeKind::Scheduler(s)) => Some(&mut s.list),
            _ => None,
        }
    }

    pub(crate) fn list(&self, id: TaskId) -> Option<&TaskList> {
        match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::List(l)) => Some(l),
            Some(NodeKind::Scheduler(s)) => Some(&s.list),
            _ => None,
        }
    }

    pub(crate) fn parallel_mut(&mut self, id: TaskId) -> Option<&mut ParallelTask> {
        match self.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Parallel(p)) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn scheduler_mut(&mut self, id: TaskId) -> Option<&mut WaitScheduler> {
        match self.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Scheduler(s)) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn barrier_mut(&mut self, id: TaskId) -> Option<&mut Barrier> {
        match self.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Barrier(b)) => Some(b),
            _ => None,
        }
    }

    pub(crate) fn is_running(&self, id: TaskId) -> bool {
        self.state(id) == Some(TaskState::Running)
    }

    // ---- lifecycle plumbing -------------------------------------------

    pub(crate) fn start_task(&mut self, id: TaskId) {
        let Some(node) = self.get(id) else {
            return;
        };
        match node.kind {
            NodeKind::Leaf(_) => self.start_leaf(id),
            NodeKind::List(_) => self.start_list(id),
            NodeKind::Parallel(_) => self.start_parallel(id),
            NodeKind::Adapter(_) => self.start_adapter(id),
            NodeKind::Barrier(_) => self.start_barrier(id),
            NodeKind::Scheduler(_) => self.start_scheduler(id),
        }
    }

    pub(crate) fn stop_task(&mut self, id: TaskId) {
        let Some(node) = self.get(id) else {
            return;
        };
        match node.kind {
            NodeKind::Leaf(_) => self.stop_leaf(id),
            NodeKind::List(_) => self.stop_list(id),
            NodeKind::Parallel(_) => self.stop_parallel(id),
            NodeKind::Adapter(_) => self.stop_adapter(id),
            NodeKind::Barrier(_) => self.stop_barrier(id),
            NodeKind::Scheduler(_) => self.stop_scheduler(id),
        }
    }

    pub(crate) fn mark_running(&mut self, id: TaskId) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        node.state = TaskState::Running;
        node.run += 1;
        let label = node.label.clone();
        debug!(task = %id, %label, "Task started");
        self.publish(EngineEvent::now(id, &label, EventKind::Started));
    }

    /// Records the outcome of the current run and queues it for the parent.
    /// Only the first outcome of a run counts.
    pub(crate) fn finish_node(&mut self, id: TaskId, outcome: Outcome) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        if node.state != TaskState::Running {
            debug!(task = %id, ?outcome, "Ignoring outcome of task that is not running");
            return;
        }
        node.state = outcome.into();
        let parent = node.parent;
        let label = node.label.clone();
        debug!(task = %id, %label, ?outcome, "Task finished");
        self.publish(EngineEvent::now(id, &label, EventKind::Finished { outcome }));
        self.signals.push_back(Signal {
            from: id,
            parent,
            outcome,
        });
    }

    /// Queues a success on behalf of a child that was skipped.
    pub(crate) fn signal_skipped(&mut self, child: TaskId, parent: TaskId) {
        self.signals.push_back(Signal {
            from: child,
            parent: Some(parent),
            outcome: Outcome::Succeeded,
        });
    }

    fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn drain(&mut self) {
        while let Some(signal) = self.signals.pop_front() {
            self.deliver(signal);
        }
    }

    fn deliver(&mut self, signal: Signal) {
        let Some(parent) = signal.parent else {
            info!(task = %signal.from, outcome = ?signal.outcome, "Root task finished");
            return;
        };
        match self.get(parent).map(|n| &n.kind) {
            Some(NodeKind::List(_)) | Some(NodeKind::Scheduler(_)) => {
                self.list_child_finished(parent, signal.from, signal.outcome)
            }
            Some(NodeKind::Parallel(_)) => {
                self.parallel_branch_finished(parent, signal.from, signal.outcome)
            }
            _ => debug!(task = %signal.from, %parent, "Dropping signal for missing parent"),
        }
    }

    fn handle_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::LeafDone { task, run, outcome } => {
                let current = self
                    .get(task)
                    .is_some_and(|n| n.run == run && matches!(n.kind, NodeKind::Leaf(_)));
                if current {
                    self.finish_node(task, outcome);
                } else {
                    debug!(%task, run, "Ignoring stale leaf completion");
                }
            }
            Inbound::ConditionDone {
                scheduler,
                id,
                outcome,
                condition,
            } => self.scheduler_condition_done(scheduler, id, outcome, condition),
            Inbound::WorkerStopped { scheduler } => self.scheduler_worker_stopped(scheduler),
        }
    }

    fn start_leaf(&mut self, id: TaskId) {
        if self.is_running(id) {
            debug!(task = %id, "Leaf already running");
            return;
        }
        self.mark_running(id);
        self.call_leaf(id, LeafCall::Start);
    }

    fn stop_leaf(&mut self, id: TaskId) {
        if self.is_running(id) {
            self.call_leaf(id, LeafCall::Stop);
        }
    }

    fn call_leaf(&mut self, id: TaskId, call: LeafCall) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        let run = node.run;
        let NodeKind::Leaf(slot) = &mut node.kind else {
            return;
        };
        let Some(mut task) = slot.take() else {
            return;
        };

        let mut cx = TaskContext::new(id, run, &mut self.shared, &self.inbox_tx);
        match call {
            LeafCall::Start => task.start(&mut cx),
            LeafCall::Stop => task.stop(&mut cx),
        }
        let outcome = cx.into_outcome();

        if let Some(Node {
            kind: NodeKind::Leaf(slot),
            ..
        }) = self.get_mut(id)
        {
            *slot = Some(task);
        }
        if let Some(outcome) = outcome {
            self.finish_node(id, outcome);
        }
    }

    pub(crate) fn restart(&mut self, id: TaskId) {
        if let Some(node) = self.get_mut(id) {
            node.repeat.restart();
        }
    }

    /// Counts one completed run of `id`.
    pub(crate) fn once_executed(&mut self, id: TaskId) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        // A parallel task entering its final run releases its branches.
        let release = match &node.kind {
            NodeKind::Parallel(p) if node.repeat.remaining == 2 && !node.deferred => p.branches.clone(),
            _ => Vec::new(),
        };
        node.repeat.once_executed();
        for branch in release {
            self.apply_deferred(branch, false);
        }
    }

    pub(crate) fn apply_deferred(&mut self, id: TaskId, deferred: bool) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        let changed = node.deferred != deferred;
        node.deferred = deferred;
        match &node.kind {
            NodeKind::Parallel(p) if changed => {
                for branch in p.branches.clone() {
                    self.apply_deferred(branch, deferred);
                }
            }
            NodeKind::Adapter(a) => {
                if let Some(r) = a.registration {
                    self.set_condition_deferred(r.scheduler, r.id, deferred);
                }
            }
            _ => {}
        }
    }

    /// Removes `id` and everything it owns from the arena.
    pub(crate) fn destroy(&mut self, id: TaskId) {
        let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        debug!(task = %id, label = %node.label, "Task destroyed");
        let owned = match node.kind {
            NodeKind::List(l) => l.master,
            NodeKind::Scheduler(s) => s.list.master,
            NodeKind::Parallel(p) => p.branches,
            _ => Vec::new(),
        };
        for child in owned {
            self.destroy(child);
        }
    }
}
