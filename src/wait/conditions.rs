//! Ready-made wait conditions.

use super::{WaitCondition, WaitKind};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;

/// Completes once a fixed time has passed since it became active.
#[derive(Debug, Clone)]
pub struct DelayCondition {
    label: String,
    kind: WaitKind,
    duration: Duration,
    initial_delay: Duration,
    deadline: Option<Instant>,
}

impl DelayCondition {
    /// Condition that stays busy for `duration` after it starts.
    pub fn new(duration: Duration) -> Self {
        Self {
            label: "delay".to_string(),
            kind: WaitKind::Delay,
            duration,
            initial_delay: Duration::ZERO,
            deadline: None,
        }
    }

    /// Sets the name shown in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Postpones activation by `initial_delay` after the hand-over.
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Reports the wait as belonging to a piece of hardware, e.g. a lamp
    /// whose warm-up time is known in advance.
    pub fn with_kind(mut self, kind: WaitKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait]
impl WaitCondition for DelayCondition {
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> WaitKind {
        self.kind
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn start(&mut self) {
        self.deadline = Some(Instant::now() + self.duration);
    }

    async fn running(&mut self) -> anyhow::Result<bool> {
        Ok(self.deadline.is_some_and(|deadline| Instant::now() < deadline))
    }

    async fn finish(&mut self) {
        self.deadline = None;
    }
}

/// Polls a closure producing a future; `Ok(true)` means still busy.
///
/// ```ignore
/// let stage = stage.clone();
/// let moving = FnCondition::new("stage", move || {
///     let stage = stage.clone();
///     Box::pin(async move { stage.is_moving().await })
/// })
/// .with_kind(WaitKind::Motor);
/// ```
pub struct FnCondition<F> {
    label: String,
    kind: WaitKind,
    initial_delay: Duration,
    poll: F,
}

impl<F> FnCondition<F>
where
    F: FnMut() -> BoxFuture<'static, anyhow::Result<bool>> + Send,
{
    /// Condition polling `poll` on every worker tick.
    pub fn new(label: impl Into<String>, poll: F) -> Self {
        Self {
            label: label.into(),
            kind: WaitKind::Other,
            initial_delay: Duration::ZERO,
            poll,
        }
    }

    pub fn with_kind(mut self, kind: WaitKind) -> Self {
        self.kind = kind;
        self
    }

    /// Postpones activation by `initial_delay` after the hand-over.
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }
}

#[async_trait]
impl<F> WaitCondition for FnCondition<F>
where
    F: FnMut() -> BoxFuture<'static, anyhow::Result<bool>> + Send,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> WaitKind {
        self.kind
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn running(&mut self) -> anyhow::Result<bool> {
        (self.poll)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_delay_condition_expires() {
        let mut delay = DelayCondition::new(Duration::from_millis(500));
        assert!(!delay.running().await.unwrap(), "inactive condition is not busy");

        delay.start().await;
        assert!(delay.running().await.unwrap());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!delay.running().await.unwrap());
    }

    #[tokio::test]
    async fn test_fn_condition_reads_flag() {
        let busy = Arc::new(AtomicBool::new(true));
        let flag = busy.clone();
        let mut condition = FnCondition::new("lamp", move || {
            let flag = flag.clone();
            Box::pin(async move { Ok::<_, anyhow::Error>(flag.load(Ordering::SeqCst)) })
        })
        .with_kind(WaitKind::Lamp);

        assert_eq!(condition.kind(), WaitKind::Lamp);
        assert!(condition.running().await.unwrap());
        busy.store(false, Ordering::SeqCst);
        assert!(!condition.running().await.unwrap());
    }
}
