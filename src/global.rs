//! Account-wide request budget.
//!
//! Every bucket loop passes through the [`GlobalLimiter`] right before it sends. Two things can
//! close the gate: the local budget (`requests` per `per` window) running out, and a global 429
//! locking the account until the server's retry instant. Waiters sleep until the instant the
//! gate reopens, so every paused bucket wakes on the same deadline instead of polling.

use crate::util::lock;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Local budget: at most `requests` sends per `per` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalLimit {
    pub requests: u32,
    pub per: Duration,
}

impl GlobalLimit {
    pub fn new(requests: u32, per: Duration) -> Self {
        Self { requests, per }
    }
}

impl Default for GlobalLimit {
    fn default() -> Self {
        Self { requests: 50, per: Duration::from_secs(1) }
    }
}

#[derive(Debug)]
struct GlobalState {
    remaining: u32,
    window_ends: Option<Instant>,
    locked_until: Option<Instant>,
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSnapshot {
    /// `None` when no local budget is configured.
    pub remaining: Option<u32>,
    pub window_ends: Option<Instant>,
    pub locked_until: Option<Instant>,
}

#[derive(Debug)]
pub struct GlobalLimiter {
    limit: Option<GlobalLimit>,
    state: Mutex<GlobalState>,
}

impl GlobalLimiter {
    pub fn new(limit: Option<GlobalLimit>) -> Self {
        let remaining = limit.map_or(0, |l| l.requests);
        Self { limit, state: Mutex::new(GlobalState { remaining, window_ends: None, locked_until: None }) }
    }

    /// Unbounded local budget; only global 429s close the gate.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Non-blocking check and decrement.
    pub fn try_acquire(&self) -> bool {
        self.acquire_at(Instant::now()).is_ok()
    }

    /// Check and decrement at `now`; on refusal returns the instant the gate reopens.
    pub(crate) fn acquire_at(&self, now: Instant) -> Result<(), Instant> {
        let mut state = lock(&self.state);
        if let Some(until) = state.locked_until {
            if now < until {
                return Err(until);
            }
            state.locked_until = None;
        }
        let Some(limit) = self.limit else {
            return Ok(());
        };
        match state.window_ends {
            Some(end) if now < end => {}
            _ => {
                state.remaining = limit.requests;
                state.window_ends = Some(now + limit.per);
            }
        }
        if state.remaining == 0 {
            // window_ends was set just above when absent
            return Err(state.window_ends.unwrap_or(now + limit.per));
        }
        state.remaining -= 1;
        Ok(())
    }

    /// Instant the gate reopens, or `None` if a send would be permitted now.
    pub fn available_at(&self, now: Instant) -> Option<Instant> {
        let state = lock(&self.state);
        if let Some(until) = state.locked_until.filter(|until| now < *until) {
            return Some(until);
        }
        let limit = self.limit?;
        match state.window_ends {
            Some(end) if now < end && state.remaining == 0 => Some(end),
            _ if limit.requests == 0 => Some(now + limit.per),
            _ => None,
        }
    }

    /// Return a permit taken by `acquire_at` that was never used for a send.
    pub(crate) fn release(&self, taken_at: Instant) {
        let Some(limit) = self.limit else {
            return;
        };
        let mut state = lock(&self.state);
        if state.window_ends.is_some_and(|end| taken_at < end) {
            state.remaining = (state.remaining + 1).min(limit.requests);
        }
    }

    /// Suspend until the gate is open. Does not consume budget.
    pub async fn wait_until_available(&self) {
        while let Some(until) = self.available_at(Instant::now()) {
            tokio::time::sleep_until(until).await;
        }
    }

    /// Close the gate for everyone until `now + retry_after` (global 429).
    pub fn lock_for(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut state = lock(&self.state);
        state.locked_until = Some(state.locked_until.map_or(until, |current| current.max(until)));
    }

    pub fn snapshot(&self) -> GlobalSnapshot {
        let state = lock(&self.state);
        GlobalSnapshot {
            remaining: self.limit.map(|_| state.remaining),
            window_ends: state.window_ends,
            locked_until: state.locked_until,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn budget_refills_after_window() {
        let limiter = GlobalLimiter::new(Some(GlobalLimit::new(2, Duration::from_secs(1))));
        let start = Instant::now();
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert_eq!(limiter.acquire_at(start), Err(start + Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn global_lock_blocks_until_retry_instant() {
        let limiter = GlobalLimiter::unlimited();
        assert!(limiter.try_acquire());
        limiter.lock_for(Duration::from_millis(750));
        assert!(!limiter.try_acquire());

        let start = Instant::now();
        limiter.wait_until_available().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(750) && waited < Duration::from_millis(760));
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn released_permit_is_usable_again() {
        let limiter = GlobalLimiter::new(Some(GlobalLimit::new(1, Duration::from_secs(1))));
        let start = Instant::now();
        assert_eq!(limiter.acquire_at(start), Ok(()));
        assert!(limiter.acquire_at(start).is_err());

        limiter.release(start);
        assert_eq!(limiter.snapshot().remaining, Some(1));
        assert_eq!(limiter.acquire_at(start), Ok(()));

        // a permit from an expired window is not carried into the next one
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire());
        limiter.release(start);
        assert_eq!(limiter.snapshot().remaining, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn later_lock_extends_earlier_one() {
        let limiter = GlobalLimiter::unlimited();
        let start = Instant::now();
        limiter.lock_for(Duration::from_secs(2));
        limiter.lock_for(Duration::from_secs(1));
        assert_eq!(limiter.snapshot().locked_until, Some(start + Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_wake_together() {
        let limiter = std::sync::Arc::new(GlobalLimiter::unlimited());
        limiter.lock_for(Duration::from_secs(3));
        let start = Instant::now();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.wait_until_available().await;
                    start.elapsed()
                })
            })
            .collect();
        for waiter in waiters {
            let waited = waiter.await.unwrap();
            assert!(waited >= Duration::from_secs(3) && waited < Duration::from_millis(3010));
        }
    }
}
