//! Delay schedules for retrying transient failures.
//!
//! Attempt semantics: `failure` index `1` is the delay before the first re-send, `2` before the
//! second, and so on. Index `0` means "no failure yet" and yields no delay. Computations that
//! would overflow saturate to [`MAX_BACKOFF`].
//!
//! ```rust
//! use std::time::Duration;
//! use ratewarden::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(500))
//!     .with_max(Duration::from_secs(8))
//!     .unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(500));
//! assert_eq!(backoff.delay(2), Duration::from_secs(1));
//! assert_eq!(backoff.delay(9), Duration::from_secs(8));
//! ```

use std::time::Duration;

/// Upper bound applied to every computed delay (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("with_max is only valid for linear or exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Constant,
    Linear,
    Exponential,
}

/// A delay schedule indexed by consecutive failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    shape: Shape,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Self { shape: Shape::Constant, base: delay, max: None }
    }

    pub fn linear(base: Duration) -> Self {
        Self { shape: Shape::Linear, base, max: None }
    }

    /// Doubling schedule: `base`, `2 * base`, `4 * base`, ...
    pub fn exponential(base: Duration) -> Self {
        Self { shape: Shape::Exponential, base, max: None }
    }

    /// Cap a linear or exponential schedule.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if self.shape == Shape::Constant {
            return Err(BackoffError::ConstantDoesNotSupportMax);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /// Delay before the re-send that follows the `failure`-th consecutive failure.
    pub fn delay(&self, failure: u32) -> Duration {
        if failure == 0 {
            return Duration::ZERO;
        }
        let raw = match self.shape {
            Shape::Constant => self.base,
            Shape::Linear => self.base.checked_mul(failure).unwrap_or(MAX_BACKOFF),
            Shape::Exponential => {
                let multiplier = 2u128.saturating_pow(failure - 1);
                let nanos = self.base.as_nanos().saturating_mul(multiplier);
                Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
            }
        };
        let capped = self.max.map_or(raw, |m| raw.min(m));
        capped.min(MAX_BACKOFF)
    }
}
