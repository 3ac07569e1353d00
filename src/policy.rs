//! Response classification and the bounded retry policy for transient failures.
//!
//! Classification:
//! - 2xx: success.
//! - 429: throttled. Compliance, not failure: retried without limit no earlier than the
//!   server's `retry_after`. A global flag (body or header) pauses every bucket.
//! - 5xx: server error, retried with [`RetryPolicy`].
//! - any other status: rejected, never retried.
//!
//! Transport failures are retried with the same [`RetryPolicy`] budget as 5xx.

use crate::backoff::Backoff;
use crate::headers::{RateLimitHeaders, ThrottleBody, ThrottleScope};
use crate::jitter::Jitter;
use std::time::Duration;

/// What the dispatcher should do with a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Success,
    Throttled(Throttle),
    ServerError,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttle {
    pub retry_after: Duration,
    pub global: bool,
    pub scope: Option<ThrottleScope>,
}

/// Classify a response. `fallback_retry_after` applies to a 429 without any retry hint.
pub fn classify(
    status: u16,
    limits: &RateLimitHeaders,
    body: &[u8],
    fallback_retry_after: Duration,
) -> Verdict {
    match status {
        200..=299 => Verdict::Success,
        429 => Verdict::Throttled(throttle(limits, body, fallback_retry_after)),
        500..=599 => Verdict::ServerError,
        _ => Verdict::Rejected,
    }
}

fn throttle(limits: &RateLimitHeaders, body: &[u8], fallback: Duration) -> Throttle {
    let parsed = ThrottleBody::parse(body);
    // The body's retry_after is authoritative over headers.
    let retry_after = parsed
        .as_ref()
        .and_then(ThrottleBody::retry_after)
        .or(limits.retry_after)
        .or(limits.reset_after)
        .unwrap_or(fallback);

    // A 429 carrying neither bucket headers nor a JSON body comes from an edge proxy ban and
    // applies to everything we send.
    let edge_ban = parsed.is_none() && !limits.has_bucket_state() && limits.bucket.is_none();
    let global = edge_ban
        || limits.global
        || limits.scope == Some(ThrottleScope::Global)
        || parsed.as_ref().is_some_and(|b| b.global);

    Throttle { retry_after, global, scope: limits.scope }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(u32),
}

/// Bounded retry for 5xx responses and transport failures.
///
/// `max_attempts` counts every send that ended in a retryable failure, including the first
/// one. 429 responses never count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Delay before the next re-send after the `failures`-th retryable failure, or `None` when
    /// the budget is spent.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        Some(self.jitter.apply(self.backoff.delay(failures)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let defaults = RetryPolicyBuilder::new();
        RetryPolicy {
            max_attempts: defaults.max_attempts,
            backoff: defaults.backoff,
            jitter: defaults.jitter,
        }
    }
}

pub struct RetryPolicyBuilder {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
}

impl RetryPolicyBuilder {
    /// Defaults: 4 attempts, exponential from 500 ms capped at 8 s, no jitter.
    pub fn new() -> Self {
        let backoff = Backoff::exponential(Duration::from_millis(500));
        Self {
            max_attempts: 4,
            backoff: backoff.with_max(Duration::from_secs(8)).unwrap_or(backoff),
            jitter: Jitter::None,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn build(self) -> Result<RetryPolicy, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy { max_attempts: self.max_attempts, backoff: self.backoff, jitter: self.jitter })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
