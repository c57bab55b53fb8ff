//! Wall clock abstraction driving round boundaries

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Source of unix time for beacon scheduling
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current unix time in seconds
    fn now(&self) -> i64;

    /// Sleep until the unix time `at` is reached
    async fn sleep_until(&self, at: i64);
}

/// Clock following the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }

    async fn sleep_until(&self, at: i64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let target = Duration::from_secs(at.max(0) as u64);
        if target > now {
            tokio::time::sleep(target - now).await;
        }
    }
}

/// Clock that only moves when told to, for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
    tx: watch::Sender<i64>,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        let (tx, _) = watch::channel(start);
        Self {
            now: AtomicI64::new(start),
            tx,
        }
    }

    /// Move the clock forward by `secs`
    pub fn advance(&self, secs: i64) {
        let now = self.now.fetch_add(secs, Ordering::SeqCst) + secs;
        self.tx.send_replace(now);
    }

    /// Jump to an absolute time
    pub fn set(&self, at: i64) {
        self.now.store(at, Ordering::SeqCst);
        self.tx.send_replace(at);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep_until(&self, at: i64) {
        let mut rx = self.tx.subscribe();
        while *rx.borrow_and_update() < at {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_manual_clock_wakes_sleepers() {
        let clock = Arc::new(ManualClock::new(100));
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep_until(110).await;
                clock.now()
            })
        };

        clock.advance(5);
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(5);
        assert_eq!(sleeper.await.unwrap(), 110);
    }
}
