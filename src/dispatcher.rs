//! The dispatcher: bucket table, submission and bucket migration.
//!
//! ```rust,no_run
//! use ratewarden::{with_reason, Dispatcher, DispatcherConfig, Method, Route};
//! # use ratewarden::{HttpRequest, Response, Transport, TransportError};
//! # struct Http;
//! # #[async_trait::async_trait]
//! # impl Transport for Http {
//! #     async fn send(&self, _: HttpRequest) -> Result<Response, TransportError> { Ok(Response::new(204)) }
//! # }
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DispatcherConfig::builder("https://api.example.com/v10")
//!     .default_header("Authorization", "Bot token")
//!     .build()?;
//! let dispatcher = Dispatcher::new(config, Http);
//!
//! let route = Route::builder(Method::Delete, "/channels/{channel_id}/messages/{message_id}")
//!     .major("channel_id", 7)
//!     .param("message_id", 42)
//!     .build()?;
//! let response = with_reason("spam cleanup", dispatcher.request(route).complete()).await?;
//! assert_eq!(response.status, 204);
//! # Ok(())
//! # }
//! ```

use crate::bucket::{self, Bucket, BucketId, BucketSnapshot, Observation, QueuedRequest, Ticket};
use crate::config::DispatcherConfig;
use crate::context::{in_dispatch, CallContext};
use crate::error::RequestError;
use crate::global::GlobalLimiter;
use crate::request::{AsyncRequest, Completion, Precheck, RequestCell, Taken};
use crate::route::{Route, RouteKey};
use crate::telemetry::{self, emit_best_effort, BoxSink, DispatchEvent, NullSink};
use crate::transport::{Headers, HttpRequest, Response, Transport};
use crate::util::lock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tower::Service;
use tracing::Instrument;

/// Everything a submission carries into the dispatcher.
pub(crate) struct Submission {
    pub route: Route,
    pub body: Option<Vec<u8>>,
    pub headers: Headers,
    pub context: CallContext,
    pub timeout: Option<Duration>,
    pub check: Option<Precheck>,
    pub cell: Arc<RequestCell>,
    pub completion: Box<dyn Completion>,
}

/// Why a request that was never answered is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abandon {
    Deadline,
    Declined,
    /// Cancelled by the caller while waiting for a re-send.
    Withdrawn,
    Shutdown,
}

/// Where the bucket state learned from a response ended up.
pub(crate) enum Placement {
    /// The sending loop still owns the bucket and applies the observation itself.
    Stay { observation: Observation, event: Option<DispatchEvent> },
    /// The route moved to another bucket; the sending loop keeps its other routes.
    Moved { event: DispatchEvent },
    /// The sending bucket was merged away and its loop must end.
    Retired { event: DispatchEvent },
}

#[derive(Default)]
struct BucketTable {
    /// Learned route to bucket hash mapping.
    hashes: HashMap<RouteKey, Arc<str>>,
    buckets: HashMap<BucketId, Arc<Bucket>>,
}

impl BucketTable {
    fn id_for(&self, key: &RouteKey) -> BucketId {
        match self.hashes.get(key) {
            Some(hash) => BucketId::Hash(hash.clone()),
            None => BucketId::Route(key.clone()),
        }
    }
}

/// State shared by the dispatcher handle, bucket loops and watchdogs.
pub(crate) struct Core {
    pub(crate) config: DispatcherConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) global: GlobalLimiter,
    table: Mutex<BucketTable>,
    sink: Mutex<BoxSink>,
    seq: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Core {
    pub(crate) fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!("dispatcher shutting down");
        }
    }

    fn sink(&self) -> BoxSink {
        lock(&self.sink).clone()
    }

    pub(crate) async fn emit(&self, event: DispatchEvent) {
        emit_best_effort(self.sink(), event).await;
    }

    fn emit_detached(&self, event: DispatchEvent) {
        tokio::spawn(emit_best_effort(self.sink(), event));
    }

    /// Bucket currently serving `key`, created (and its loop started) on first use.
    fn bucket_for(self: &Arc<Self>, table: &mut BucketTable, key: &RouteKey) -> Arc<Bucket> {
        let id = table.id_for(key);
        if let Some(bucket) = table.buckets.get(&id) {
            return bucket.clone();
        }
        self.spawn_bucket(table, id)
    }

    fn spawn_bucket(self: &Arc<Self>, table: &mut BucketTable, id: BucketId) -> Arc<Bucket> {
        let bucket = Arc::new(Bucket::new(id.clone()));
        table.buckets.insert(id.clone(), bucket.clone());
        let span = tracing::debug_span!("bucket", id = %id);
        tokio::spawn(bucket::run(self.clone(), bucket.clone()).instrument(span));
        bucket
    }

    fn submit(self: &Arc<Self>, submission: Submission) {
        let Submission { route, body, headers, context, timeout, check, cell, completion } = submission;
        if let Err(completion) = cell.enqueue(completion) {
            completion.suppress();
            return;
        }

        let now = Instant::now();
        let budget = timeout.unwrap_or(self.config.request_timeout);
        let ticket = |seq| {
            Arc::new(Ticket { seq, route, context, submitted_at: now, deadline: now + budget, budget, cell })
        };
        if self.is_closed() {
            self.abandon(&ticket(0), Abandon::Shutdown);
            return;
        }

        // sequence numbers are taken under the table lock so queues stay sorted by them
        let (ticket, bucket, depth) = {
            let mut table = lock(&self.table);
            let ticket = ticket(self.seq.fetch_add(1, Ordering::Relaxed));
            let bucket = self.bucket_for(&mut table, ticket.route.key());
            let request =
                QueuedRequest { ticket: ticket.clone(), body, headers, check, failures: 0, not_before: None };
            let depth = bucket.push(request);
            (ticket, bucket.id(), depth)
        };

        let watchdog = {
            let core = Arc::downgrade(self);
            let ticket = ticket.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(ticket.deadline).await;
                if let Some(core) = core.upgrade() {
                    core.abandon(&ticket, Abandon::Deadline);
                }
            })
        };
        ticket.cell.set_watchdog(watchdog.abort_handle());

        tracing::trace!(route = %ticket.route, bucket = %bucket, depth, "request queued");
        self.emit_detached(DispatchEvent::Queued {
            route: ticket.route.to_string(),
            bucket: bucket.to_string(),
            depth,
        });
    }

    pub(crate) fn http_request(&self, request: &QueuedRequest) -> HttpRequest {
        let ticket = &request.ticket;
        let mut headers = Headers::new();
        for (name, value) in &self.config.default_headers {
            headers.insert(name.as_str(), value.as_str());
        }
        if let Some(agent) = &self.config.user_agent {
            headers.insert("User-Agent", agent.as_str());
        }
        for (name, value) in request.headers.iter() {
            headers.insert(name, value);
        }
        if let Some(reason) = ticket.context.reason() {
            let value = if self.config.encode_reason {
                urlencoding::encode(reason).into_owned()
            } else {
                reason.to_owned()
            };
            headers.insert(self.config.reason_header.as_str(), value);
        }
        HttpRequest {
            method: ticket.route.method(),
            url: self.config.url_for(ticket.route.compiled_path()),
            headers,
            body: request.body.clone(),
            deadline: ticket.deadline,
        }
    }

    /// Resolve an in-flight request.
    pub(crate) fn settle(self: &Arc<Self>, ticket: &Ticket, outcome: Result<Response, RequestError>) {
        let Some(taken) = ticket.cell.settle(outcome.is_ok()) else {
            return;
        };
        let route = ticket.route.to_string();
        let attempts = ticket.cell.attempts();
        let event = match &outcome {
            Ok(response) => {
                tracing::debug!(route = %route, status = response.status, attempts, "request completed");
                DispatchEvent::Completed {
                    route,
                    status: response.status,
                    attempts,
                    elapsed: ticket.submitted_at.elapsed(),
                }
            }
            Err(RequestError::Timeout { budget, .. }) => {
                tracing::warn!(route = %route, budget = ?budget, attempts, "request timed out");
                DispatchEvent::TimedOut { route, budget: *budget }
            }
            Err(error @ (RequestError::ServerUnavailable { .. } | RequestError::Transport { .. })) => {
                tracing::error!(route = %route, error = %error, "retries exhausted");
                DispatchEvent::Failed { route, kind: error.kind(), attempts }
            }
            Err(error) => {
                tracing::warn!(route = %route, error = %error, "request failed");
                DispatchEvent::Failed { route, kind: error.kind(), attempts }
            }
        };
        self.complete(ticket, taken, outcome, Some(event));
    }

    /// Resolve a request that is waiting for a send, or any unresolved request at its deadline.
    pub(crate) fn abandon(self: &Arc<Self>, ticket: &Ticket, why: Abandon) {
        let taken = match why {
            Abandon::Deadline => ticket.cell.expire(),
            _ => ticket.cell.abandon(why == Abandon::Declined),
        };
        let Some(taken) = taken else {
            return;
        };
        let route = ticket.route.to_string();
        let (error, event) = match why {
            Abandon::Deadline => {
                tracing::warn!(route = %route, budget = ?ticket.budget, attempts = ticket.cell.attempts(), "request timed out");
                (ticket.timeout_error(), Some(DispatchEvent::TimedOut { route, budget: ticket.budget }))
            }
            Abandon::Declined => (RequestError::Cancelled, Some(DispatchEvent::Cancelled { route })),
            // reported as cancelled once delivery is suppressed
            Abandon::Withdrawn => (RequestError::Cancelled, None),
            Abandon::Shutdown => {
                let attempts = ticket.cell.attempts();
                (RequestError::Shutdown, Some(DispatchEvent::Failed { route, kind: "shutdown", attempts }))
            }
        };
        self.complete(ticket, taken, Err(error), event);
    }

    /// Run the continuations of a resolved request in a task of their own, under the context
    /// captured at submission.
    fn complete(
        &self,
        ticket: &Ticket,
        taken: Taken,
        outcome: Result<Response, RequestError>,
        event: Option<DispatchEvent>,
    ) {
        let sink = self.sink();
        let route = ticket.route.to_string();
        let context = ticket.context.clone();
        tokio::spawn(async move {
            if let Some(event) = event {
                emit_best_effort(sink.clone(), event).await;
            }
            if taken.suppressed {
                taken.completion.suppress();
                emit_best_effort(sink, DispatchEvent::Cancelled { route }).await;
                return;
            }
            if let Some(message) = context.scope(in_dispatch(taken.completion.resolve(outcome))).await {
                tracing::error!(route = %route, panic = %message, "continuation panicked");
                emit_best_effort(sink, DispatchEvent::CallbackPanicked { route, message }).await;
            }
        });
    }

    /// Re-home the requests of `key` after a response named bucket `hash`.
    pub(crate) fn migrate(
        self: &Arc<Self>,
        bucket: &Arc<Bucket>,
        key: &RouteKey,
        hash: &str,
        observation: Observation,
    ) -> Placement {
        let mut table = lock(&self.table);
        let hash: Arc<str> = match table.hashes.get(key) {
            Some(known) if **known == *hash => known.clone(),
            _ => Arc::from(hash),
        };
        table.hashes.insert(key.clone(), hash.clone());

        let current = bucket.id();
        let target_id = BucketId::Hash(hash);
        if current == target_id {
            return Placement::Stay { observation, event: None };
        }
        let migrated = |moved: usize| DispatchEvent::BucketMigrated {
            route: key.to_string(),
            from: current.to_string(),
            to: target_id.to_string(),
            moved,
        };

        let existing = table.buckets.get(&target_id).cloned();
        match (&current, existing) {
            (BucketId::Route(_), None) => {
                table.buckets.remove(&current);
                bucket.set_id(target_id.clone());
                table.buckets.insert(target_id.clone(), bucket.clone());
                tracing::info!(route = %key, from = %current, to = %target_id, "bucket discovered");
                Placement::Stay { observation, event: Some(migrated(bucket.len())) }
            }
            (BucketId::Route(_), Some(target)) => {
                if table.buckets.get(&current).is_some_and(|b| Arc::ptr_eq(b, bucket)) {
                    table.buckets.remove(&current);
                }
                let moved = bucket.seal();
                let event = migrated(moved.len());
                tracing::info!(route = %key, from = %current, to = %target_id, moved = moved.len(), "bucket merged");
                target.insert_ordered(moved);
                target.deliver(observation);
                Placement::Retired { event }
            }
            (BucketId::Hash(_), existing) => {
                let target = match existing {
                    Some(target) => target,
                    None => self.spawn_bucket(&mut table, target_id.clone()),
                };
                let moved = bucket.take_route(key);
                let event = migrated(moved.len());
                tracing::info!(route = %key, from = %current, to = %target_id, moved = moved.len(), "route moved");
                target.insert_ordered(moved);
                target.deliver(observation);
                Placement::Moved { event }
            }
        }
    }

    /// Retire an idle bucket. False if it picked up work meanwhile.
    pub(crate) fn retire_idle(&self, bucket: &Arc<Bucket>) -> bool {
        let mut table = lock(&self.table);
        if !bucket.seal_if_idle() {
            return false;
        }
        let id = bucket.id();
        if table.buckets.get(&id).is_some_and(|b| Arc::ptr_eq(b, bucket)) {
            table.buckets.remove(&id);
        }
        true
    }

    /// Retire a bucket on shutdown, failing whatever it still holds.
    pub(crate) fn close_bucket(self: &Arc<Self>, bucket: &Arc<Bucket>) {
        let drained = {
            let mut table = lock(&self.table);
            let id = bucket.id();
            if table.buckets.get(&id).is_some_and(|b| Arc::ptr_eq(b, bucket)) {
                table.buckets.remove(&id);
            }
            bucket.seal()
        };
        for request in drained {
            self.abandon(&request.ticket, Abandon::Shutdown);
        }
    }

    fn snapshot(&self, key: &RouteKey) -> Option<BucketSnapshot> {
        let table = lock(&self.table);
        table.buckets.get(&table.id_for(key)).map(|bucket| bucket.snapshot())
    }
}

struct Inner {
    core: Arc<Core>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.core.close();
    }
}

/// Handle to a dispatcher. Clones share the same buckets and limiter; the dispatcher shuts down
/// when the last clone (including those held by pending requests) is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new<T: Transport>(config: DispatcherConfig, transport: T) -> Self {
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(config: DispatcherConfig, transport: Arc<dyn Transport>) -> Self {
        let (closed, _) = watch::channel(false);
        let core = Core {
            global: GlobalLimiter::new(config.global_limit),
            config,
            transport,
            table: Mutex::new(BucketTable::default()),
            sink: Mutex::new(telemetry::boxed(NullSink)),
            seq: AtomicU64::new(0),
            closed,
        };
        Self { inner: Arc::new(Inner { core: Arc::new(core) }) }
    }

    /// Report dispatch events to `sink`.
    pub fn with_sink<S>(self, sink: S) -> Self
    where
        S: Service<DispatchEvent, Response = (), Error = Infallible> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        *lock(&self.core().sink) = telemetry::boxed(sink);
        self
    }

    fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.core().config
    }

    /// A request without a body.
    pub fn request(&self, route: Route) -> AsyncRequest<Response> {
        AsyncRequest::new(self.clone(), route, None)
    }

    pub fn new_request(&self, route: Route, body: impl Into<Vec<u8>>) -> AsyncRequest<Response> {
        AsyncRequest::new(self.clone(), route, Some(body.into()))
    }

    pub(crate) fn submit(&self, submission: Submission) {
        self.core().submit(submission);
    }

    pub fn global(&self) -> &GlobalLimiter {
        &self.core().global
    }

    /// State of the bucket currently serving `route`, if one is live.
    pub fn bucket_snapshot(&self, route: &Route) -> Option<BucketSnapshot> {
        self.core().snapshot(route.key())
    }

    /// Bucket hash learned for `route`.
    pub fn bucket_hash(&self, route: &Route) -> Option<String> {
        lock(&self.core().table).hashes.get(route.key()).map(|hash| hash.to_string())
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        lock(&self.core().table).buckets.len()
    }

    /// Stop accepting requests and fail everything still queued with
    /// [`RequestError::Shutdown`]. In-flight sends finish first.
    pub fn shutdown(&self) {
        self.core().close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.core().is_closed()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("base_url", &self.config().base_url())
            .field("buckets", &self.bucket_count())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}
