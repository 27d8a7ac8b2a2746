//! Time sources for time triggers, holds and timeouts

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// A source of the current time that can also sleep until a deadline
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once `now() >= deadline`
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}

/// A clock that only moves when told to
///
/// Sleepers wake as soon as the clock is advanced past their deadline.
#[derive(Clone)]
pub struct ManualClock {
    current: Arc<watch::Sender<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a manual clock starting at a specific time
    pub fn at(time: DateTime<Utc>) -> Self {
        let (tx, _) = watch::channel(time);
        Self {
            current: Arc::new(tx),
        }
    }

    /// Set the current time
    pub fn set(&self, time: DateTime<Utc>) {
        self.current.send_replace(time);
    }

    /// Advance time by a duration
    pub fn advance(&self, duration: Duration) {
        self.current.send_modify(|now| *now += duration);
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.advance(Duration::seconds(seconds));
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.advance(Duration::minutes(minutes));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.borrow()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let mut rx = self.current.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
