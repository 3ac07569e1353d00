//! Dispatch telemetry.
//!
//! The dispatcher reports what it does as [`DispatchEvent`]s to a sink, which is any
//! `tower::Service<DispatchEvent, Response = (), Error = Infallible>`. Emission is
//! best-effort: a sink that is not ready or fails simply loses the event.
//!
//! ```rust
//! use ratewarden::telemetry::{DispatchEvent, MemorySink};
//! use tower::{Service, ServiceExt};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let sink = MemorySink::with_capacity(16);
//! let mut svc = sink.clone();
//! svc.ready().await.unwrap()
//!     .call(DispatchEvent::BucketRetired { bucket: "route:GET /gateway".into() })
//!     .await
//!     .unwrap();
//! assert_eq!(sink.len(), 1);
//! # });
//! ```

use crate::util::lock;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

/// Events emitted by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// A request entered a bucket queue.
    Queued { route: String, bucket: String, depth: usize },
    /// A send attempt is starting.
    Sent { route: String, bucket: String, attempt: u32 },
    /// A request resolved successfully.
    Completed { route: String, status: u16, attempts: u32, elapsed: Duration },
    /// A 429 delayed a request.
    Throttled { route: String, bucket: String, retry_after: Duration, global: bool },
    /// A transient failure is being retried after `delay`.
    Retrying { route: String, attempt: u32, delay: Duration, cause: String },
    /// A request resolved with a surfaced error.
    Failed { route: String, kind: &'static str, attempts: u32 },
    /// A request was cancelled or its delivery suppressed.
    Cancelled { route: String },
    /// A request ran out of its wall-clock budget.
    TimedOut { route: String, budget: Duration },
    /// Requests for `route` moved from one bucket to another.
    BucketMigrated { route: String, from: String, to: String, moved: usize },
    /// A bucket loop ended.
    BucketRetired { bucket: String },
    /// A continuation or hook panicked.
    CallbackPanicked { route: String, message: String },
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued { route, bucket, depth } => {
                write!(f, "Queued({} in {}, depth={})", route, bucket, depth)
            }
            Self::Sent { route, bucket, attempt } => {
                write!(f, "Sent({} via {}, attempt #{})", route, bucket, attempt)
            }
            Self::Completed { route, status, attempts, elapsed } => write!(
                f,
                "Completed({} -> {}, attempts={}, elapsed={:?})",
                route, status, attempts, elapsed
            ),
            Self::Throttled { route, bucket, retry_after, global } => write!(
                f,
                "Throttled({} in {}, retry_after={:?}, global={})",
                route, bucket, retry_after, global
            ),
            Self::Retrying { route, attempt, delay, cause } => {
                write!(f, "Retrying({} after #{}, delay={:?}, cause={})", route, attempt, delay, cause)
            }
            Self::Failed { route, kind, attempts } => {
                write!(f, "Failed({}, kind={}, attempts={})", route, kind, attempts)
            }
            Self::Cancelled { route } => write!(f, "Cancelled({})", route),
            Self::TimedOut { route, budget } => write!(f, "TimedOut({}, budget={:?})", route, budget),
            Self::BucketMigrated { route, from, to, moved } => {
                write!(f, "BucketMigrated({}: {} -> {}, moved={})", route, from, to, moved)
            }
            Self::BucketRetired { bucket } => write!(f, "BucketRetired({})", bucket),
            Self::CallbackPanicked { route, message } => {
                write!(f, "CallbackPanicked({}: {})", route, message)
            }
        }
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// Type-erased sink held by the dispatcher.
pub(crate) type BoxSink = BoxCloneService<DispatchEvent, (), Infallible>;

pub(crate) fn boxed<S>(sink: S) -> BoxSink
where
    S: Service<DispatchEvent, Response = (), Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    BoxCloneService::new(sink)
}

/// Best-effort emit helper that honours `poll_ready`.
pub async fn emit_best_effort<S>(sink: S, event: DispatchEvent)
where
    S: Service<DispatchEvent, Response = ()> + Send,
    S::Future: Send,
{
    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<DispatchEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DispatchEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

/// Forwards events to `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<DispatchEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        tracing::info!(event = %event, "dispatch_event");
        Box::pin(async { Ok(()) })
    }
}

/// Keeps the most recent events in memory; older ones are evicted past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<DispatchEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        lock(&self.events).iter().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<DispatchEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        let mut events = lock(&self.events);
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retired(n: usize) -> DispatchEvent {
        DispatchEvent::BucketRetired { bucket: format!("b{}", n) }
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        for n in 0..3 {
            emit_best_effort(sink.clone(), retired(n)).await;
        }
        assert_eq!(sink.events(), vec![retired(1), retired(2)]);
        assert_eq!(sink.evicted(), 1);
    }

    #[tokio::test]
    async fn boxed_sink_forwards() {
        let sink = MemorySink::new();
        let boxed = boxed(sink.clone());
        emit_best_effort(boxed, retired(9)).await;
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn display_is_compact() {
        let event = DispatchEvent::Throttled {
            route: "GET /gateway".into(),
            bucket: "hash:abc".into(),
            retry_after: Duration::from_secs(2),
            global: true,
        };
        assert_eq!(event.to_string(), "Throttled(GET /gateway in hash:abc, retry_after=2s, global=true)");
    }
}
