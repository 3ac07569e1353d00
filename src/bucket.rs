//! Rate-limit buckets and their scheduling loop.
//!
//! Each bucket owns a FIFO queue and exactly one loop task. The loop is the only writer of the
//! bucket's counters and the only sender for its requests, which gives strict per-bucket
//! ordering: the head is sent, its response is fully handled, and only then is the next head
//! considered. A request that has to wait again (429, 5xx, transport failure) goes back into the
//! queue at its original position, so it never overtakes anything that was ahead of it.
//!
//! Buckets start keyed by [`RouteKey`] and are re-keyed once the server names the bucket hash.

use crate::context::{in_dispatch_sync, CallContext};
use crate::dispatcher::{Abandon, Core, Placement};
use crate::error::RequestError;
use crate::headers::RateLimitHeaders;
use crate::policy::{classify, Verdict};
use crate::request::{Precheck, RequestCell};
use crate::route::{Route, RouteKey};
use crate::telemetry::DispatchEvent;
use crate::transport::{Headers, Response};
use crate::util::lock;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Identity of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketId {
    /// Provisional bucket of a route whose server bucket is not known yet.
    Route(RouteKey),
    /// Server-assigned bucket hash, possibly shared by several routes.
    Hash(Arc<str>),
}

impl BucketId {
    pub fn hash(&self) -> Option<&str> {
        match self {
            Self::Hash(hash) => Some(hash),
            Self::Route(_) => None,
        }
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Route(key) => write!(f, "route:{}", key),
            Self::Hash(hash) => write!(f, "hash:{}", hash),
        }
    }
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub id: BucketId,
    /// `None` until a response carried the limit.
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<Instant>,
    /// Set while a 429 for this bucket is being honoured.
    pub throttled_until: Option<Instant>,
    pub queued: usize,
}

/// Rate-limit state learned from responses. `limit == 0` means unknown, which leaves the
/// bucket unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
    throttled_until: Option<Instant>,
}

impl Counters {
    /// Refill once the reset instant has passed.
    fn refresh(&mut self, now: Instant) {
        if self.reset_at.is_some_and(|reset| now >= reset) {
            self.remaining = self.limit;
            self.reset_at = None;
        }
        if self.throttled_until.is_some_and(|until| now >= until) {
            self.throttled_until = None;
        }
    }

    /// Instant before which nothing may be sent, if any.
    fn blocked_until(&self, now: Instant) -> Option<Instant> {
        let exhausted = if self.limit > 0 && self.remaining == 0 { self.reset_at } else { None };
        [exhausted, self.throttled_until]
            .into_iter()
            .flatten()
            .filter(|until| now < *until)
            .max()
    }

    fn spend(&mut self) {
        if self.limit > 0 {
            self.remaining = self.remaining.saturating_sub(1);
        }
    }

    fn apply(&mut self, observation: &Observation) {
        if let Some(limit) = observation.limit {
            self.limit = limit;
        }
        if let Some(remaining) = observation.remaining {
            self.remaining = remaining;
        }
        if observation.reset_at.is_some() {
            self.reset_at = observation.reset_at;
        }
        if let Some(until) = observation.throttled_until {
            self.throttled_until = Some(self.throttled_until.map_or(until, |current| current.max(until)));
        }
    }
}

/// What one response taught about its bucket, routed to whichever loop owns that bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Observation {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    throttled_until: Option<Instant>,
}

impl Observation {
    pub(crate) fn from_headers(limits: &RateLimitHeaders, at: Instant, default_reset: Duration) -> Self {
        let reset_at = match (limits.reset_after, limits.remaining) {
            (Some(after), _) => Some(at + after),
            // exhausted without a reset hint
            (None, Some(0)) => Some(at + default_reset),
            (None, _) => None,
        };
        Self { limit: limits.limit, remaining: limits.remaining, reset_at, throttled_until: None }
    }

    /// A bucket 429: `until` replaces whatever reset the headers announced.
    fn throttle_until(&mut self, until: Instant) {
        self.throttled_until = Some(until);
        self.reset_at = Some(until);
    }

    /// A global 429: the bucket reopens with the global gate.
    fn reset_with_global(&mut self, until: Instant) {
        if self.reset_at.is_some() {
            self.reset_at = Some(until);
        }
    }

    fn merge(&mut self, newer: Observation) {
        self.limit = newer.limit.or(self.limit);
        self.remaining = newer.remaining.or(self.remaining);
        self.reset_at = newer.reset_at.or(self.reset_at);
        self.throttled_until = match (self.throttled_until, newer.throttled_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Immutable facts about a submitted request, shared with its deadline watchdog.
pub(crate) struct Ticket {
    pub seq: u64,
    pub route: Route,
    pub context: CallContext,
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub budget: Duration,
    pub cell: Arc<RequestCell>,
}

impl Ticket {
    pub(crate) fn timeout_error(&self) -> RequestError {
        RequestError::Timeout {
            elapsed: self.submitted_at.elapsed(),
            budget: self.budget,
            attempts: self.cell.attempts(),
        }
    }
}

/// A request sitting in a bucket queue.
pub(crate) struct QueuedRequest {
    pub ticket: Arc<Ticket>,
    pub body: Option<Vec<u8>>,
    pub headers: Headers,
    pub check: Option<Precheck>,
    pub failures: u32,
    pub not_before: Option<Instant>,
}

struct BucketQueue {
    entries: VecDeque<QueuedRequest>,
    retired: bool,
}

impl BucketQueue {
    /// Drop requests at the head that resolved while waiting (cancelled or timed out).
    fn prune(&mut self) {
        while self.entries.front().is_some_and(|head| head.ticket.cell.is_settled()) {
            self.entries.pop_front();
        }
    }

    fn insert_ordered(&mut self, request: QueuedRequest) {
        let at = self
            .entries
            .iter()
            .position(|queued| queued.ticket.seq > request.ticket.seq)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, request);
    }
}

/// Bucket state shared between its loop and the dispatcher.
///
/// Lock order: dispatcher table, then `queue`, then a request cell.
pub(crate) struct Bucket {
    id: Mutex<BucketId>,
    queue: Mutex<BucketQueue>,
    wake: Notify,
    inbox: Mutex<Option<Observation>>,
    published: Mutex<Counters>,
}

impl Bucket {
    pub(crate) fn new(id: BucketId) -> Self {
        Self {
            id: Mutex::new(id),
            queue: Mutex::new(BucketQueue { entries: VecDeque::new(), retired: false }),
            wake: Notify::new(),
            inbox: Mutex::new(None),
            published: Mutex::new(Counters::default()),
        }
    }

    pub(crate) fn id(&self) -> BucketId {
        lock(&self.id).clone()
    }

    pub(crate) fn set_id(&self, id: BucketId) {
        *lock(&self.id) = id;
    }

    /// Append a new submission. Returns the queue depth.
    pub(crate) fn push(&self, request: QueuedRequest) -> usize {
        let depth = {
            let mut queue = lock(&self.queue);
            queue.entries.push_back(request);
            queue.entries.len()
        };
        self.wake.notify_one();
        depth
    }

    /// Put requests back by submission order.
    pub(crate) fn insert_ordered(&self, requests: impl IntoIterator<Item = QueuedRequest>) {
        {
            let mut queue = lock(&self.queue);
            for request in requests {
                queue.insert_ordered(request);
            }
        }
        self.wake.notify_one();
    }

    /// Remove every queued request of `key`, keeping their relative order.
    pub(crate) fn take_route(&self, key: &RouteKey) -> Vec<QueuedRequest> {
        let mut queue = lock(&self.queue);
        let (taken, kept): (Vec<_>, Vec<_>) =
            queue.entries.drain(..).partition(|queued| queued.ticket.route.key() == key);
        queue.entries = kept.into();
        taken
    }

    /// Mark retired and hand back whatever is still queued.
    pub(crate) fn seal(&self) -> Vec<QueuedRequest> {
        let mut queue = lock(&self.queue);
        queue.retired = true;
        queue.entries.drain(..).collect()
    }

    /// Retire only if nothing live is queued.
    pub(crate) fn seal_if_idle(&self) -> bool {
        let mut queue = lock(&self.queue);
        queue.entries.retain(|queued| !queued.ticket.cell.is_settled());
        if queue.entries.is_empty() {
            queue.retired = true;
        }
        queue.retired
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.queue).entries.len()
    }

    /// `Some(not_before)` of the live head, `None` when the queue is empty.
    fn head(&self) -> Option<Option<Instant>> {
        let mut queue = lock(&self.queue);
        queue.prune();
        queue.entries.front().map(|head| head.not_before)
    }

    fn pop_due(&self, now: Instant) -> Option<QueuedRequest> {
        let mut queue = lock(&self.queue);
        queue.prune();
        if queue.entries.front()?.not_before.is_some_and(|at| at > now) {
            return None;
        }
        queue.entries.pop_front()
    }

    /// Hand an observation to this bucket's loop.
    pub(crate) fn deliver(&self, observation: Observation) {
        {
            let mut inbox = lock(&self.inbox);
            match inbox.as_mut() {
                Some(pending) => pending.merge(observation),
                None => *inbox = Some(observation),
            }
        }
        self.wake.notify_one();
    }

    fn take_observation(&self) -> Option<Observation> {
        lock(&self.inbox).take()
    }

    fn publish(&self, counters: &Counters) {
        *lock(&self.published) = *counters;
    }

    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        let counters = *lock(&self.published);
        let known = counters.limit > 0;
        BucketSnapshot {
            id: self.id(),
            limit: known.then_some(counters.limit),
            remaining: known.then_some(counters.remaining),
            reset_at: counters.reset_at,
            throttled_until: counters.throttled_until,
            queued: self.len(),
        }
    }
}

/// The bucket loop. Runs until the bucket is retired (idle, merged away, or shutdown).
pub(crate) async fn run(core: Arc<Core>, bucket: Arc<Bucket>) {
    let mut closed = core.closed();
    let mut counters = Counters::default();
    loop {
        if *closed.borrow() {
            core.close_bucket(&bucket);
            return;
        }
        if let Some(observation) = bucket.take_observation() {
            counters.apply(&observation);
        }
        let now = Instant::now();
        counters.refresh(now);
        bucket.publish(&counters);

        let Some(not_before) = bucket.head() else {
            tokio::select! {
                _ = bucket.wake.notified() => {}
                _ = closed.changed() => {}
                _ = tokio::time::sleep(core.config.bucket_idle_timeout) => {
                    if counters.blocked_until(Instant::now()).is_none() && core.retire_idle(&bucket) {
                        tracing::debug!(bucket = %bucket.id(), "bucket retired after idling");
                        core.emit(DispatchEvent::BucketRetired { bucket: bucket.id().to_string() }).await;
                        return;
                    }
                }
            }
            continue;
        };

        let ready_at = [not_before, counters.blocked_until(now), core.global.available_at(now)]
            .into_iter()
            .flatten()
            .max()
            .filter(|at| *at > now);
        if let Some(ready_at) = ready_at {
            tokio::select! {
                _ = tokio::time::sleep_until(ready_at) => {}
                _ = bucket.wake.notified() => {}
                _ = closed.changed() => {}
            }
            continue;
        }

        let Some(request) = bucket.pop_due(now) else {
            continue;
        };
        let ticket = request.ticket.clone();
        if now >= ticket.deadline {
            core.abandon(&ticket, Abandon::Deadline);
            continue;
        }
        if !precheck(&request) {
            tracing::debug!(route = %ticket.route, "request declined by its precheck");
            core.abandon(&ticket, Abandon::Declined);
            continue;
        }
        if ticket.cell.withdrawn() {
            core.abandon(&ticket, Abandon::Withdrawn);
            continue;
        }
        if core.global.acquire_at(now).is_err() {
            bucket.insert_ordered([request]);
            continue;
        }
        if !ticket.cell.begin_flight() {
            core.global.release(now);
            continue;
        }
        counters.spend();
        bucket.publish(&counters);

        if let Some(placement) = send(&core, &bucket, request).await {
            match placement {
                Placement::Stay { observation, event } => {
                    counters.apply(&observation);
                    if let Some(event) = event {
                        core.emit(event).await;
                    }
                }
                Placement::Moved { event } => core.emit(event).await,
                Placement::Retired { event } => {
                    core.emit(event).await;
                    return;
                }
            }
        }
    }
}

/// Run the precheck under the submitting context. A panicking check declines the request.
fn precheck(request: &QueuedRequest) -> bool {
    let Some(check) = &request.check else {
        return true;
    };
    let ticket = &request.ticket;
    let outcome = ticket
        .context
        .clone()
        .sync_scope(|| in_dispatch_sync(|| std::panic::catch_unwind(AssertUnwindSafe(|| check()))));
    outcome.unwrap_or_else(|_| {
        tracing::error!(route = %ticket.route, "precheck panicked");
        false
    })
}

/// Send one attempt and handle its response. Returns where the bucket state learned from the
/// response belongs, or `None` when nothing was learned.
async fn send(core: &Arc<Core>, bucket: &Arc<Bucket>, mut request: QueuedRequest) -> Option<Placement> {
    let ticket = request.ticket.clone();
    let attempt = ticket.cell.attempts() + 1;
    ticket.cell.set_attempts(attempt);
    let route = ticket.route.to_string();
    let bucket_label = bucket.id().to_string();
    tracing::debug!(route = %route, bucket = %bucket_label, attempt, "sending request");
    core.emit(DispatchEvent::Sent { route: route.clone(), bucket: bucket_label.clone(), attempt }).await;

    // the call runs to completion; a deadline passing meanwhile is the watchdog's to report
    let http = core.http_request(&request);
    let sent = core.transport.send(http).await;
    let received = Instant::now();

    let response = match sent {
        Err(error) => {
            request.failures += 1;
            match core.config.retry.delay_for(request.failures) {
                Some(delay) => {
                    tracing::warn!(route = %route, attempt, error = %error, ?delay, "transport failed, retrying");
                    core.emit(DispatchEvent::Retrying { route, attempt, delay, cause: error.to_string() }).await;
                    reschedule(core, bucket, request, received + delay);
                }
                None => {
                    core.settle(&ticket, Err(RequestError::Transport { source: error, attempts: attempt }));
                }
            }
            return None;
        }
        Ok(response) => response,
    };

    let limits = RateLimitHeaders::parse(&response.headers);
    let mut observation = Observation::from_headers(&limits, received, core.config.default_retry_after);
    match classify(response.status, &limits, &response.body, core.config.default_retry_after) {
        Verdict::Success => core.settle(&ticket, Ok(response)),
        Verdict::Rejected => {
            let Response { status, body, .. } = response;
            tracing::debug!(route = %route, status, "request rejected");
            core.settle(&ticket, Err(RequestError::Rejected { status, body, attempts: attempt }));
        }
        Verdict::Throttled(throttle) => {
            let until = received + throttle.retry_after;
            if throttle.global {
                core.global.lock_for(throttle.retry_after);
                observation.reset_with_global(until);
            } else {
                observation.throttle_until(until);
            }
            tracing::warn!(
                route = %route,
                bucket = %bucket_label,
                retry_after = ?throttle.retry_after,
                global = throttle.global,
                scope = throttle.scope.map(|scope| scope.as_str()),
                "rate limited"
            );
            core.emit(DispatchEvent::Throttled {
                route: route.clone(),
                bucket: bucket_label,
                retry_after: throttle.retry_after,
                global: throttle.global,
            })
            .await;
            reschedule(core, bucket, request, until);
        }
        Verdict::ServerError => {
            request.failures += 1;
            let status = response.status;
            match core.config.retry.delay_for(request.failures) {
                Some(delay) => {
                    tracing::warn!(route = %route, status, attempt, ?delay, "server error, retrying");
                    core.emit(DispatchEvent::Retrying {
                        route: route.clone(),
                        attempt,
                        delay,
                        cause: format!("status {}", status),
                    })
                    .await;
                    reschedule(core, bucket, request, received + delay);
                }
                None => core.settle(
                    &ticket,
                    Err(RequestError::ServerUnavailable { status, body: response.body, attempts: attempt }),
                ),
            }
        }
    }

    Some(match limits.bucket.as_deref() {
        Some(hash) => core.migrate(bucket, ticket.route.key(), hash, observation),
        None => Placement::Stay { observation, event: None },
    })
}

/// Queue a request again at its original position, not before `at`. Fails it with a timeout
/// instead when `at` lies past its deadline.
fn reschedule(core: &Arc<Core>, bucket: &Bucket, mut request: QueuedRequest, at: Instant) {
    let ticket = request.ticket.clone();
    if at > ticket.deadline {
        core.settle(&ticket, Err(ticket.timeout_error()));
        return;
    }
    if ticket.cell.retrying() {
        request.not_before = Some(at);
        bucket.insert_ordered([request]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Headers;

    fn limits(pairs: &[(&str, &str)]) -> RateLimitHeaders {
        RateLimitHeaders::parse(&pairs.iter().copied().collect::<Headers>())
    }

    #[tokio::test(start_paused = true)]
    async fn counters_block_until_reset_when_exhausted() {
        let now = Instant::now();
        let mut counters = Counters::default();
        counters.apply(&Observation::from_headers(
            &limits(&[("x-ratelimit-limit", "2"), ("x-ratelimit-remaining", "1"), ("x-ratelimit-reset-after", "2.0")]),
            now,
            Duration::from_secs(1),
        ));
        assert_eq!(counters.blocked_until(now), None);
        counters.spend();
        assert_eq!(counters.blocked_until(now), Some(now + Duration::from_secs(2)));

        counters.refresh(now + Duration::from_secs(2));
        assert_eq!(counters.remaining, 2);
        assert_eq!(counters.blocked_until(now + Duration::from_secs(2)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_bucket_is_unconstrained() {
        let now = Instant::now();
        let mut counters = Counters::default();
        counters.spend();
        counters.spend();
        assert_eq!(counters.blocked_until(now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_blocks_even_without_known_limit() {
        let now = Instant::now();
        let mut observation = Observation::default();
        observation.throttle_until(now + Duration::from_millis(1500));
        let mut counters = Counters::default();
        counters.apply(&observation);
        assert_eq!(counters.blocked_until(now), Some(now + Duration::from_millis(1500)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_header_reset() {
        let now = Instant::now();
        let mut observation = Observation::from_headers(
            &limits(&[("x-ratelimit-limit", "5"), ("x-ratelimit-remaining", "0"), ("x-ratelimit-reset-after", "5.0")]),
            now,
            Duration::from_secs(1),
        );
        observation.throttle_until(now + Duration::from_secs(1));
        let mut counters = Counters::default();
        counters.apply(&observation);
        assert_eq!(counters.blocked_until(now), Some(now + Duration::from_secs(1)));

        counters.refresh(now + Duration::from_secs(1));
        assert_eq!(counters.remaining, 5);
        assert_eq!(counters.blocked_until(now + Duration::from_secs(1)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_without_reset_hint_uses_default() {
        let now = Instant::now();
        let observation = Observation::from_headers(
            &limits(&[("x-ratelimit-limit", "5"), ("x-ratelimit-remaining", "0")]),
            now,
            Duration::from_secs(1),
        );
        assert_eq!(observation.reset_at, Some(now + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn merged_observations_keep_latest_values() {
        let now = Instant::now();
        let mut first = Observation { limit: Some(5), remaining: Some(3), ..Observation::default() };
        first.throttle_until(now + Duration::from_secs(3));
        let mut second = Observation { remaining: Some(2), ..Observation::default() };
        second.throttle_until(now + Duration::from_secs(1));
        first.merge(second);
        assert_eq!(first.limit, Some(5));
        assert_eq!(first.remaining, Some(2));
        assert_eq!(first.throttled_until, Some(now + Duration::from_secs(3)));
    }

    #[test]
    fn bucket_ids_display_their_kind() {
        let route = Route::fixed(crate::Method::Get, "/gateway").unwrap();
        assert_eq!(BucketId::Route(route.key().clone()).to_string(), "route:GET /gateway");
        assert_eq!(BucketId::Hash("abc".into()).to_string(), "hash:abc");
    }
}
