//! Measurement procedures described in TOML.
//!
//! A procedure file names a sequence of steps that is built into a task
//! graph rooted at a wait scheduler. Built-in steps cover timing, logging,
//! counting, failures and waits; nesting is expressed with `list`,
//! `parallel` and `scheduler` steps.
//!
//! ```toml
//! name = "warm-up and scan"
//! repeat = 1
//!
//! [[steps]]
//! type = "wait_start"
//! label = "lamp"
//! duration = "2s"
//!
//! [[steps]]
//! type = "barrier"
//!
//! [[steps]]
//! type = "list"
//! repeat = 3
//!
//! [[steps.steps]]
//! type = "count"
//! ```

use crate::engine::Engine;
use crate::error::{AppResult, SequencerError};
use crate::leaves::{DelayTask, FnTask};
use crate::task::TaskId;
use crate::wait::conditions::DelayCondition;
use crate::wait::WaitKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Shared state of a procedure run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    /// Number of `count` steps executed.
    pub repetition: u64,
    /// Messages of executed `log` steps.
    pub log: Vec<String>,
}

fn one() -> u32 {
    1
}

/// A parsed procedure file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Procedure {
    /// Label of the root task.
    pub name: String,
    /// Number of times the whole procedure runs.
    #[serde(default = "one")]
    pub repeat: u32,
    /// Top-level steps, run in order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One branch of a `parallel` step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    /// Steps of the branch, run in order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A procedure step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Sleep on the coordinator's runtime.
    Delay {
        /// Sleep per run.
        #[serde(with = "humantime_serde")]
        duration: Duration,
        /// Runs in a row.
        #[serde(default = "one")]
        repeat: u32,
    },
    /// Record a message.
    Log {
        /// Text appended to the run log.
        message: String,
    },
    /// Increment the repetition counter.
    Count,
    /// Fail the run.
    Fail {
        /// Reason logged with the failure.
        message: String,
    },
    /// Nested sequential list.
    List {
        /// Passes over `steps`.
        #[serde(default = "one")]
        repeat: u32,
        /// Steps run in order.
        #[serde(default)]
        steps: Vec<Step>,
    },
    /// Branches running concurrently.
    Parallel {
        /// Runs of the whole fork.
        #[serde(default = "one")]
        repeat: u32,
        /// At least one branch.
        branches: Vec<Branch>,
    },
    /// Hand a timed wait to the worker and move on.
    WaitStart {
        /// Name of the wait.
        label: String,
        /// Time until the wait completes once active.
        #[serde(with = "humantime_serde")]
        duration: Duration,
        /// Time between hand-over and activation.
        #[serde(default, with = "humantime_serde")]
        initial_delay: Duration,
        /// Hardware category.
        #[serde(default)]
        kind: WaitKind,
    },
    /// Block until every wait started since the previous barrier is done.
    Barrier,
    /// Nested scheduler with its own worker.
    Scheduler {
        /// Runs of the nested scheduler.
        #[serde(default = "one")]
        repeat: u32,
        /// Steps run in order.
        #[serde(default)]
        steps: Vec<Step>,
    },
}

impl Procedure {
    /// Parse a procedure from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let procedure: Self = toml::from_str(text)?;
        procedure.validate()?;
        Ok(procedure)
    }

    /// Read and parse a procedure file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Checks structure that serde cannot express.
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(SequencerError::Procedure("procedure name is empty".to_string()));
        }
        validate_steps(&self.steps)
    }

    /// Builds the task graph and returns its root.
    ///
    /// The root is the procedure's wait scheduler. A procedure that repeats
    /// gets an outer list around the scheduler, since only a list runs its
    /// children more than once.
    pub fn build(&self, engine: &mut Engine<RunState>) -> AppResult<TaskId> {
        let scheduler = engine.wait_scheduler();
        engine.set_label(scheduler, self.name.clone())?;
        for step in &self.steps {
            let task = build_step(engine, step)?;
            engine.add_task(scheduler, task)?;
        }

        let root = if self.repeat == 1 {
            scheduler
        } else {
            let outer = engine.task_list();
            engine.set_label(outer, self.name.clone())?;
            engine.set_repeat(scheduler, self.repeat)?;
            engine.add_task(outer, scheduler)?;
            outer
        };
        info!(procedure = %self.name, repeat = self.repeat, steps = self.steps.len(), "Procedure built");
        Ok(root)
    }
}

fn validate_steps(steps: &[Step]) -> AppResult<()> {
    for step in steps {
        match step {
            Step::List { steps, .. } | Step::Scheduler { steps, .. } => validate_steps(steps)?,
            Step::Parallel { branches, .. } => {
                if branches.is_empty() {
                    return Err(SequencerError::Procedure(
                        "parallel step needs at least one branch".to_string(),
                    ));
                }
                for branch in branches {
                    validate_steps(&branch.steps)?;
                }
            }
            Step::WaitStart { label, .. } if label.trim().is_empty() => {
                return Err(SequencerError::Procedure("wait_start step needs a label".to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Builds a step with its whole subtree before it is attached, so that the
/// enclosing scheduler discovers everything at once.
fn build_step(engine: &mut Engine<RunState>, step: &Step) -> AppResult<TaskId> {
    let task = match step {
        Step::Delay { duration, repeat } => {
            let task = engine.leaf(DelayTask::new(*duration));
            engine.set_repeat(task, *repeat)?;
            task
        }
        Step::Log { message } => {
            let message = message.clone();
            engine.leaf(FnTask::new("log", move |state: &mut RunState| {
                info!(message = %message, "Procedure log");
                state.log.push(message.clone());
                Ok(())
            }))
        }
        Step::Count => engine.leaf(FnTask::new("count", |state: &mut RunState| {
            state.repetition += 1;
            Ok(())
        })),
        Step::Fail { message } => {
            let message = message.clone();
            engine.leaf(FnTask::new("fail", move |_: &mut RunState| {
                Err(anyhow::anyhow!("{}", message))
            }))
        }
        Step::List { repeat, steps } => {
            let list = engine.task_list();
            engine.set_repeat(list, *repeat)?;
            for step in steps {
                let child = build_step(engine, step)?;
                engine.add_task(list, child)?;
            }
            list
        }
        Step::Parallel { repeat, branches } => {
            let fork = engine.parallel(branches.len());
            for (index, branch) in branches.iter().enumerate() {
                for step in &branch.steps {
                    let child = build_step(engine, step)?;
                    engine.add_branch_task(fork, index, child)?;
                }
            }
            engine.set_repeat(fork, *repeat)?;
            fork
        }
        Step::WaitStart {
            label,
            duration,
            initial_delay,
            kind,
        } => {
            let condition = DelayCondition::new(*duration)
                .with_label(label.clone())
                .with_initial_delay(*initial_delay)
                .with_kind(*kind);
            engine.wait_for(condition)
        }
        Step::Barrier => engine.barrier(),
        Step::Scheduler { repeat, steps } => {
            let scheduler = engine.wait_scheduler();
            engine.set_repeat(scheduler, *repeat)?;
            for step in steps {
                let child = build_step(engine, step)?;
                engine.add_task(scheduler, child)?;
            }
            scheduler
        }
    };
    Ok(task)
}
