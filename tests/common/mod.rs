//! Common test utilities for daq_sequencer integration tests
//!
//! This module provides reusable test helpers for:
//! - Recording the order in which tasks and conditions are called
//! - Leaves whose completion the test controls
//! - Wait conditions driven by a flag
//! - Driving an engine until a task reports an outcome

#![allow(dead_code)] // Utilities may not all be used by every test file

use async_trait::async_trait;
use daq_sequencer::wait::WaitCondition;
use daq_sequencer::{AppResult, Completion, Engine, Outcome, Task, TaskContext, TaskId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Ordered record of calls shared between probes and the test.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    /// Position of the first occurrence of `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }
}

/// How a [`Probe`] reacts to `start` and `stop`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Completes inside `start`.
    Immediate,
    /// Fails inside `start`.
    Fail,
    /// Waits for the test to call [`ProbeControl`]; fails when stopped.
    Manual,
    /// Like `Manual`, but a stop is only acknowledged by the test.
    IgnoreStop,
}

/// Leaf that records `<name>:start` / `<name>:stop` in a journal.
pub struct Probe {
    name: String,
    mode: Mode,
    journal: Journal,
    pending: Arc<Mutex<Option<Completion>>>,
}

/// Test-side control over a manual probe's current run.
#[derive(Clone)]
pub struct ProbeControl(Arc<Mutex<Option<Completion>>>);

impl ProbeControl {
    /// Completion handle of the current run, if the probe is waiting.
    pub fn take(&self) -> Option<Completion> {
        self.0.lock().unwrap().take()
    }

    pub fn is_waiting(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    pub fn complete(&self) {
        if let Some(completion) = self.take() {
            completion.complete();
        }
    }

    pub fn fail(&self) {
        if let Some(completion) = self.take() {
            completion.fail();
        }
    }
}

impl<S> Task<S> for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, cx: &mut TaskContext<'_, S>) {
        self.journal.record(format!("{}:start", self.name));
        match self.mode {
            Mode::Immediate => cx.complete(),
            Mode::Fail => cx.fail(),
            Mode::Manual | Mode::IgnoreStop => {
                *self.pending.lock().unwrap() = Some(cx.completion());
            }
        }
    }

    fn stop(&mut self, cx: &mut TaskContext<'_, S>) {
        self.journal.record(format!("{}:stop", self.name));
        if self.mode != Mode::IgnoreStop {
            self.pending.lock().unwrap().take();
            cx.fail();
        }
    }
}

/// Adds a probe leaf to `engine`.
pub fn probe<S>(engine: &mut Engine<S>, journal: &Journal, name: &str, mode: Mode) -> (TaskId, ProbeControl) {
    let pending = Arc::new(Mutex::new(None));
    let id = engine.leaf(Probe {
        name: name.to_string(),
        mode,
        journal: journal.clone(),
        pending: pending.clone(),
    });
    (id, ProbeControl(pending))
}

/// Wait condition that stays busy while its flag is set.
pub struct FlagCondition {
    name: String,
    busy: Arc<AtomicBool>,
    journal: Journal,
    fail: bool,
}

impl FlagCondition {
    /// Returns the condition and the flag that keeps it busy.
    pub fn new(journal: &Journal, name: &str, busy: bool) -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(busy));
        (
            Self {
                name: name.to_string(),
                busy: flag.clone(),
                journal: journal.clone(),
                fail: false,
            },
            flag,
        )
    }

    /// A condition whose first poll reports an error.
    pub fn failing(journal: &Journal, name: &str) -> Self {
        let (mut condition, _) = Self::new(journal, name, true);
        condition.fail = true;
        condition
    }
}

#[async_trait]
impl WaitCondition for FlagCondition {
    fn label(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) {
        self.journal.record(format!("{}:start", self.name));
    }

    async fn running(&mut self) -> anyhow::Result<bool> {
        if self.fail {
            anyhow::bail!("{} reported a fault", self.name);
        }
        Ok(self.busy.load(Ordering::SeqCst))
    }

    async fn stop(&mut self) {
        self.journal.record(format!("{}:stop", self.name));
    }

    async fn finish(&mut self) {
        self.journal.record(format!("{}:finish", self.name));
    }
}

/// Processes inbox messages until `task` reports an outcome.
pub async fn drive<S>(engine: &mut Engine<S>, task: TaskId) -> AppResult<Outcome> {
    loop {
        if let Some(outcome) = engine.outcome(task) {
            return Ok(outcome);
        }
        engine.step().await?;
    }
}

/// Adds every task in `tasks` to `list`, in order.
pub fn add_all<S>(engine: &mut Engine<S>, list: TaskId, tasks: &[TaskId]) {
    for task in tasks {
        assert!(engine.add_task(list, *task).unwrap(), "task {} not added", task);
    }
}
