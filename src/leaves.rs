//! Built-in leaf tasks.
//!
//! [`FnTask`] runs a closure on the coordinator against the shared state.
//! [`FutureTask`] and [`DelayTask`] spawn their work onto the Tokio runtime
//! and report through a [`Completion`]; stopping them aborts the spawned job.

use crate::task::{Completion, Task, TaskContext};
use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Synchronous leaf: calls `f` with the shared state and finishes at once.
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F> FnTask<F> {
    /// Leaf running `f` once per run.
    pub fn new<S>(name: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&mut S) -> anyhow::Result<()> + Send,
    {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<S, F> Task<S> for FnTask<F>
where
    F: FnMut(&mut S) -> anyhow::Result<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, cx: &mut TaskContext<'_, S>) {
        match (self.f)(cx.shared()) {
            Ok(()) => cx.complete(),
            Err(err) => {
                warn!(task = %cx.id(), name = %self.name, error = %err, "Task failed");
                cx.fail();
            }
        }
    }
}

/// Spawns `future` and reports its result through `completion`.
fn spawn_job<Fut>(name: &str, completion: Completion, future: Fut) -> Option<JoinHandle<()>>
where
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(task = %completion.task(), %name, error = %err, "No runtime to run task on");
            completion.fail();
            return None;
        }
    };
    let name = name.to_string();
    Some(runtime.spawn(async move {
        match future.await {
            Ok(()) => completion.complete(),
            Err(err) => {
                warn!(task = %completion.task(), %name, error = %err, "Task failed");
                completion.fail();
            }
        }
    }))
}

/// Asynchronous leaf: each run spawns the future produced by `make`.
pub struct FutureTask<F> {
    name: String,
    make: F,
    job: Option<JoinHandle<()>>,
}

impl<F> FutureTask<F>
where
    F: FnMut() -> BoxFuture<'static, anyhow::Result<()>> + Send,
{
    /// Leaf spawning the future returned by `make` on every run.
    pub fn new(name: impl Into<String>, make: F) -> Self {
        Self {
            name: name.into(),
            make,
            job: None,
        }
    }
}

impl<S, F> Task<S> for FutureTask<F>
where
    F: FnMut() -> BoxFuture<'static, anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, cx: &mut TaskContext<'_, S>) {
        let future = (self.make)();
        self.job = spawn_job(&self.name, cx.completion(), future);
    }

    fn stop(&mut self, cx: &mut TaskContext<'_, S>) {
        if let Some(job) = self.job.take() {
            job.abort();
        }
        cx.fail();
    }
}

/// Leaf that finishes after a fixed time.
pub struct DelayTask {
    name: String,
    duration: Duration,
    job: Option<JoinHandle<()>>,
}

impl DelayTask {
    /// Leaf that sleeps for `duration`.
    pub fn new(duration: Duration) -> Self {
        Self {
            name: format!("delay {:?}", duration),
            duration,
            job: None,
        }
    }
}

impl<S> Task<S> for DelayTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, cx: &mut TaskContext<'_, S>) {
        let duration = self.duration;
        self.job = spawn_job(&self.name, cx.completion(), async move {
            tokio::time::sleep(duration).await;
            Ok(())
        });
    }

    fn stop(&mut self, cx: &mut TaskContext<'_, S>) {
        if let Some(job) = self.job.take() {
            job.abort();
        }
        cx.fail();
    }
}
