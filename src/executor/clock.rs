//! Time source and cancellation-aware pauses.
//!
//! The runners never call `thread::sleep` directly: every suspension goes through
//! `pause`, which checks the run's `CancellationToken` at least every
//! `CANCEL_CHECK` and stops early when it fires.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Longest uninterrupted sleep slice.
pub const CANCEL_CHECK: Duration = Duration::from_millis(50);

/// Source of "now" and of blocking sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("run cancelled")]
pub struct Cancelled;

/// Sleep for `duration` unless `cancel` fires first.
pub fn pause(clock: &dyn Clock, duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    let deadline = clock.now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let now = clock.now();
        if now >= deadline {
            return Ok(());
        }
        clock.sleep((deadline - now).min(CANCEL_CHECK));
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;

    #[test]
    fn pause_sleeps_the_full_duration() {
        let clock = ManualClock::new();
        pause(&clock, Duration::from_millis(1234), &CancellationToken::new()).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_millis(1234));
    }

    #[test]
    fn pause_returns_early_when_cancelled() {
        let clock = ManualClock::new();
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(pause(&clock, Duration::from_secs(5), &token), Err(Cancelled));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn zero_pause_is_immediate() {
        let clock = ManualClock::new();
        pause(&clock, Duration::ZERO, &CancellationToken::new()).unwrap();
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn system_clock_pause_is_interruptible() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let started = Instant::now();
        assert_eq!(pause(&SystemClock, Duration::from_secs(10), &token), Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }
}
