//! Cancellable timers the controller selects on.
//!
//! Both timers are owned values rather than spawned tasks: cancelling one is a
//! plain method call and dropping the owner cancels it too. An idle timer never
//! completes, so it can sit in a `select!` branch unconditionally.

use std::future::pending;
use std::pin::Pin;
use tokio::time::{interval_at, sleep_until, Duration, Instant, Interval, MissedTickBehavior, Sleep};

/// Fixed-period ticker that can be stopped and restarted
#[derive(Debug, Default)]
pub struct RepeatingTask {
    interval: Option<Interval>,
}

impl RepeatingTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ticking every `period`, first tick one period from now.
    /// Restarting replaces the previous schedule.
    pub fn start(&mut self, period: Duration) {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
    }

    pub fn cancel(&mut self) {
        self.interval = None;
    }

    pub fn is_active(&self) -> bool {
        self.interval.is_some()
    }

    /// Resolves on the next tick; never resolves while cancelled.
    pub async fn tick(&mut self) -> Instant {
        match self.interval.as_mut() {
            Some(interval) => interval.tick().await,
            None => pending().await,
        }
    }
}

/// Single-shot deadline with cancel-and-replace semantics: at most one
/// firing is ever pending.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer for `deadline`, discarding any earlier schedule.
    pub fn schedule_at(&mut self, deadline: Instant) {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(sleep_until(deadline))),
        }
    }

    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_pending(&self) -> bool {
        self.sleep.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.sleep.as_ref().map(|sleep| sleep.deadline())
    }

    /// Resolves once when the armed deadline passes, then disarms.
    pub async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => pending().await,
        }
    }
}
