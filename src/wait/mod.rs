//! Asynchronous wait conditions.
//!
//! A [`WaitCondition`] is a predicate polled off the coordinator ("is the
//! motor still moving?", "has the lamp warmed up?"). Conditions are never
//! part of the task tree directly. A wait adapter
//! ([`Engine::wait_for`](crate::Engine::wait_for)) placed in a list marks the
//! point where the condition is handed to the worker, and a later barrier
//! ([`Engine::barrier`](crate::Engine::barrier)) blocks the list until every
//! condition bound to it has reported.
//!
//! The wait scheduler owning both discovers
//! adapters and barriers when they are added beneath it, numbers the
//! conditions and runs the polling worker for the duration of its run.

pub(crate) mod barrier;
pub mod conditions;
pub(crate) mod scheduler;
pub(crate) mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Number of a condition inside its scheduler. Freed numbers are reused.
pub type ConditionId = u32;

/// Hardware category of a condition. Used for display only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    /// Plain timed wait.
    Delay,
    /// Detector readout or exposure.
    Spectrometer,
    /// Stage or mirror movement.
    Motor,
    /// Monochromator grating movement.
    Grating,
    /// Light source warm-up.
    Lamp,
    /// Anything else.
    #[default]
    Other,
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WaitKind::Delay => "delay",
            WaitKind::Spectrometer => "spectrometer",
            WaitKind::Motor => "motor",
            WaitKind::Grating => "grating",
            WaitKind::Lamp => "lamp",
            WaitKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Asynchronous predicate polled periodically by the wait worker.
///
/// All hooks run on the worker task. `running` is polled once per worker
/// tick after `start`; returning `Ok(false)` completes the condition and an
/// `Err` fails it. `finish` runs exactly once per activation, after
/// completion, failure or `stop`.
#[async_trait]
pub trait WaitCondition: Send {
    /// Name used in logs and tree dumps.
    fn label(&self) -> &str {
        "condition"
    }

    /// Hardware category.
    fn kind(&self) -> WaitKind {
        WaitKind::Other
    }

    /// Delay between being handed to the worker and the first poll.
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Called once when the condition becomes active.
    async fn start(&mut self) {}

    /// True while the awaited operation is still in progress.
    async fn running(&mut self) -> anyhow::Result<bool>;

    /// Called when the worker stops before the condition completed.
    async fn stop(&mut self) {}

    /// Called once when the condition leaves the active set.
    async fn finish(&mut self) {}
}
