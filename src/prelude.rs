//! Convenient re-exports for common ratewarden types.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    context::{with_reason, CallContext},
    headers::{RateLimitHeaders, ThrottleScope},
    jitter::Jitter,
    policy::{BuildError, RetryPolicy, RetryPolicyBuilder, Verdict},
    AsyncRequest, Dispatcher, DispatcherConfig, GlobalLimit, Method, RequestError, RequestHandle,
    RequestState, Response, Route, Transport,
};
