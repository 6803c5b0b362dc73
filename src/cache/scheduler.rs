//! Timer abstraction used for cleanup sweeps and scheduled refreshes.
//!
//! Everything time-driven in the cache goes through [`Scheduler`] so the
//! timing source can be swapped. [`TokioScheduler`] runs on the tokio timer
//! wheel, which tests drive with a paused clock.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Shortest period accepted for repeating work
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Factory for the future run on every tick of a repeating timer
pub type Task = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to scheduled work; cancelling it stops any future runs
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token observed by the running timer
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

pub trait Scheduler: Send + Sync {
    /// Run `task` every `every`, first after one full period
    fn schedule_repeating(&self, every: Duration, task: Task) -> TimerHandle;

    /// Run `work` once after `after`
    fn schedule_once(&self, after: Duration, work: BoxFuture<'static, ()>) -> TimerHandle;

    fn cancel(&self, handle: &TimerHandle) {
        handle.cancel();
    }
}

/// Scheduler backed by tokio timers. Must be used from within a runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_repeating(&self, every: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let token = handle.token();
        let period = every.max(MIN_PERIOD);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => task().await,
                }
            }

            trace!(period_ms = period.as_millis() as u64, "Repeating timer stopped");
        });

        handle
    }

    fn schedule_once(&self, after: Duration, work: BoxFuture<'static, ()>) -> TimerHandle {
        let handle = TimerHandle::new();
        let token = handle.token();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("One-shot timer cancelled");
                }
                _ = sleep(after) => work.await,
            }
        });

        handle
    }
}
