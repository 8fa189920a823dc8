//! Task orchestration engine for measurement procedures.
//!
//! A procedure is a tree of tasks owned by an [`Engine`]: sequential
//! [task lists](Engine::task_list), [parallel forks](Engine::parallel),
//! [leaves](task::Task) doing the actual work, and asynchronous waits on
//! hardware that run in a [wait scheduler](Engine::wait_scheduler)'s worker
//! while the sequence continues up to the next [barrier](Engine::barrier).
//!
//! ```no_run
//! use daq_sequencer::leaves::DelayTask;
//! use daq_sequencer::wait::conditions::DelayCondition;
//! use daq_sequencer::Engine;
//! use std::time::Duration;
//!
//! # async fn demo() -> daq_sequencer::AppResult<()> {
//! let mut engine: Engine = Engine::default();
//! let root = engine.wait_scheduler();
//! let warm_up = engine.wait_for(DelayCondition::new(Duration::from_secs(30)).with_label("lamp"));
//! let settle = engine.leaf(DelayTask::new(Duration::from_secs(1)));
//! let barrier = engine.barrier();
//! for task in [warm_up, settle, barrier] {
//!     engine.add_task(root, task)?;
//! }
//! let outcome = engine.run(root).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod leaves;
pub mod messages;
mod parallel;
pub mod procedure;
pub mod task;
mod task_list;
pub mod wait;

pub use engine::{Engine, EngineHandle, RunReport};
pub use error::{AppResult, SequencerError};
pub use task::{Completion, Outcome, Task, TaskContext, TaskId, TaskState};
