//! The user-facing request handle.
//!
//! An [`AsyncRequest`] is built, composed and then submitted exactly once; submission consumes
//! it and returns a [`RequestHandle`] to await, cancel or observe. Composition happens before
//! submission, so a second submission or a late `map` cannot be expressed.
//!
//! State machine:
//!
//! ```text
//! Created --submit--> Queued --send--> InFlight --2xx--------> Succeeded
//!    |                  |                 |  \--4xx/exhausted-> Failed
//!    |                  |                 \--429/5xx--> Retrying --send--> InFlight
//!    \--cancel--> Cancelled <--cancel--/
//! ```
//!
//! `cancel()` only takes effect from `Created` or `Queued`. Once a request has been sent it is
//! advisory: a call on the wire still completes and a pending re-send is dropped, but no result
//! reaches the continuations and the handle resolves with [`RequestError::Cancelled`].
//!
//! Continuations (`map`, `and_then`, `or_else`, `on_success`, `on_failure`) run in a task of
//! their own, with the [`CallContext`] captured at submission re-established around them. A
//! panic inside one is caught and reported; it never reaches a bucket loop.

use crate::context::{self, CallContext};
use crate::dispatcher::{Dispatcher, Submission};
use crate::error::RequestError;
use crate::route::Route;
use crate::transport::{Headers, Response};
use crate::util::lock;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Created,
    Queued,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Type-erased tail of a request: its composed stages plus the result channel.
pub(crate) trait Completion: Send {
    /// Run the stages on `outcome` and deliver. Yields the panic message if a stage panicked.
    fn resolve(self: Box<Self>, outcome: Result<Response, RequestError>) -> BoxFuture<'static, Option<String>>;

    /// Deliver `Cancelled` without running any stage.
    fn suppress(self: Box<Self>);
}

pub(crate) type Precheck = Arc<dyn Fn() -> bool + Send + Sync>;

type Stage<T> =
    Box<dyn FnOnce(Result<Response, RequestError>) -> BoxFuture<'static, Result<T, RequestError>> + Send>;

struct Pipeline<T> {
    stage: Stage<T>,
    tx: oneshot::Sender<Result<T, RequestError>>,
}

impl<T: Send + 'static> Completion for Pipeline<T> {
    fn resolve(self: Box<Self>, outcome: Result<Response, RequestError>) -> BoxFuture<'static, Option<String>> {
        let Pipeline { stage, tx } = *self;
        async move {
            match AssertUnwindSafe(async move { stage(outcome).await }).catch_unwind().await {
                Ok(result) => {
                    let _ = tx.send(result);
                    None
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    let _ = tx.send(Err(RequestError::CallbackPanicked(message.clone())));
                    Some(message)
                }
            }
        }
        .boxed()
    }

    fn suppress(self: Box<Self>) {
        let _ = self.tx.send(Err(RequestError::Cancelled));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

struct CellInner {
    state: RequestState,
    cancel_requested: bool,
    completion: Option<Box<dyn Completion>>,
    watchdog: Option<AbortHandle>,
}

/// Shared state machine of one request. Whoever takes the completion resolves the request, so
/// resolution happens exactly once.
pub(crate) struct RequestCell {
    inner: Mutex<CellInner>,
    attempts: AtomicU32,
    state_tx: watch::Sender<RequestState>,
}

/// A completion taken out of the cell, with whether delivery must be suppressed.
pub(crate) struct Taken {
    pub completion: Box<dyn Completion>,
    pub suppressed: bool,
}

impl RequestCell {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(RequestState::Created);
        Self {
            inner: Mutex::new(CellInner {
                state: RequestState::Created,
                cancel_requested: false,
                completion: None,
                watchdog: None,
            }),
            attempts: AtomicU32::new(0),
            state_tx,
        }
    }

    fn set(&self, inner: &mut CellInner, state: RequestState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn take(inner: &mut CellInner) -> Option<Taken> {
        if let Some(watchdog) = inner.watchdog.take() {
            watchdog.abort();
        }
        let suppressed = inner.cancel_requested;
        inner.completion.take().map(|completion| Taken { completion, suppressed })
    }

    pub(crate) fn state(&self) -> RequestState {
        lock(&self.inner).state
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_attempts(&self, attempts: u32) {
        self.attempts.store(attempts, Ordering::Relaxed);
    }

    /// Created -> Queued. Hands the completion back if the request was cancelled while Created.
    pub(crate) fn enqueue(&self, completion: Box<dyn Completion>) -> Result<(), Box<dyn Completion>> {
        let mut inner = lock(&self.inner);
        if inner.state != RequestState::Created {
            return Err(completion);
        }
        inner.completion = Some(completion);
        self.set(&mut inner, RequestState::Queued);
        Ok(())
    }

    pub(crate) fn set_watchdog(&self, watchdog: AbortHandle) {
        let mut inner = lock(&self.inner);
        if inner.state.is_terminal() {
            watchdog.abort();
        } else {
            inner.watchdog = Some(watchdog);
        }
    }

    /// Returns true if the request was Created or Queued and is now Cancelled. Otherwise
    /// records an advisory cancellation for an in-flight or retrying request.
    pub(crate) fn cancel(&self) -> bool {
        let taken = {
            let mut inner = lock(&self.inner);
            match inner.state {
                RequestState::Created => {
                    self.set(&mut inner, RequestState::Cancelled);
                    return true;
                }
                RequestState::Queued => {
                    self.set(&mut inner, RequestState::Cancelled);
                    Self::take(&mut inner)
                }
                RequestState::InFlight | RequestState::Retrying => {
                    inner.cancel_requested = true;
                    return false;
                }
                _ => return false,
            }
        };
        if let Some(taken) = taken {
            taken.completion.suppress();
        }
        true
    }

    /// Queued/Retrying -> InFlight. False if the request already resolved.
    pub(crate) fn begin_flight(&self) -> bool {
        let mut inner = lock(&self.inner);
        match inner.state {
            RequestState::Queued | RequestState::Retrying => {
                self.set(&mut inner, RequestState::InFlight);
                true
            }
            _ => false,
        }
    }

    /// InFlight -> Retrying.
    pub(crate) fn retrying(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != RequestState::InFlight {
            return false;
        }
        self.set(&mut inner, RequestState::Retrying);
        true
    }

    /// InFlight -> Succeeded/Failed.
    pub(crate) fn settle(&self, succeeded: bool) -> Option<Taken> {
        let mut inner = lock(&self.inner);
        if inner.state != RequestState::InFlight {
            return None;
        }
        let state = if succeeded { RequestState::Succeeded } else { RequestState::Failed };
        self.set(&mut inner, state);
        Self::take(&mut inner)
    }

    /// Resolve a request that is waiting for a send (deadline, shutdown, declined precheck).
    /// A Queued request that was declined by its precheck ends Cancelled; everything else ends
    /// Failed.
    pub(crate) fn abandon(&self, declined: bool) -> Option<Taken> {
        let mut inner = lock(&self.inner);
        let state = match inner.state {
            RequestState::Queued if declined => RequestState::Cancelled,
            RequestState::Queued | RequestState::Retrying => RequestState::Failed,
            _ => return None,
        };
        self.set(&mut inner, state);
        Self::take(&mut inner)
    }

    /// The deadline passed. Resolves the request whatever it is doing; a response still on its
    /// way is only read for bucket state.
    pub(crate) fn expire(&self) -> Option<Taken> {
        let mut inner = lock(&self.inner);
        match inner.state {
            RequestState::Queued | RequestState::InFlight | RequestState::Retrying => {
                self.set(&mut inner, RequestState::Failed);
                Self::take(&mut inner)
            }
            _ => None,
        }
    }

    /// An advisory cancel arrived after the request was sent.
    pub(crate) fn withdrawn(&self) -> bool {
        lock(&self.inner).cancel_requested
    }

    pub(crate) fn is_settled(&self) -> bool {
        lock(&self.inner).state.is_terminal()
    }

    fn subscribe(&self) -> watch::Receiver<RequestState> {
        self.state_tx.subscribe()
    }
}

/// An API call that has not been submitted yet.
#[must_use = "requests do nothing until submitted"]
pub struct AsyncRequest<T> {
    dispatcher: Dispatcher,
    route: Route,
    body: Option<Vec<u8>>,
    headers: Headers,
    reason: Option<CallContext>,
    timeout: Option<Duration>,
    check: Option<Precheck>,
    cell: Arc<RequestCell>,
    stage: Stage<T>,
}

impl AsyncRequest<Response> {
    pub(crate) fn new(dispatcher: Dispatcher, route: Route, body: Option<Vec<u8>>) -> Self {
        Self {
            dispatcher,
            route,
            body,
            headers: Headers::new(),
            reason: None,
            timeout: None,
            check: None,
            cell: Arc::new(RequestCell::new()),
            stage: Box::new(|outcome| async move { outcome }.boxed()),
        }
    }

    /// Decode a successful response body as JSON.
    pub fn json_response<U>(self) -> AsyncRequest<U>
    where
        U: serde::de::DeserializeOwned + Send + 'static,
    {
        self.and_then(|response| async move { response.json::<U>() })
    }
}

impl<T: Send + 'static> AsyncRequest<T> {
    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<B: serde::Serialize>(mut self, value: &B) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_vec(value)?);
        self.headers.insert("Content-Type", "application/json");
        Ok(self)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Explicit audit reason for this call; combined with the ambient one at submission
    /// according to the dispatcher's reason precedence.
    pub fn reason(mut self, reason: impl AsRef<str>) -> Self {
        self.reason = Some(CallContext::with_reason(reason));
        self
    }

    /// Wall-clock budget for this request, overriding the dispatcher default.
    pub fn timeout(mut self, budget: Duration) -> Self {
        self.timeout = Some(budget);
        self
    }

    /// Evaluated right before every send; returning false cancels the request unsent.
    pub fn check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    fn chain<U, F, Fut>(self, next: F) -> AsyncRequest<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T, RequestError>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, RequestError>> + Send + 'static,
    {
        let AsyncRequest { dispatcher, route, body, headers, reason, timeout, check, cell, stage } = self;
        let stage: Stage<U> = Box::new(move |outcome| {
            async move {
                let previous = stage(outcome).await;
                next(previous).await
            }
            .boxed()
        });
        AsyncRequest { dispatcher, route, body, headers, reason, timeout, check, cell, stage }
    }

    /// Transform the successful value.
    pub fn map<U, F>(self, f: F) -> AsyncRequest<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(move |result| async move { result.map(f) })
    }

    /// Continue with a fallible async step, which may itself issue further requests.
    pub fn and_then<U, F, Fut>(self, f: F) -> AsyncRequest<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, RequestError>> + Send + 'static,
    {
        self.chain(move |result| async move {
            match result {
                Ok(value) => f(value).await,
                Err(err) => Err(err),
            }
        })
    }

    /// Handle a failure, possibly recovering with a value.
    pub fn or_else<F, Fut>(self, f: F) -> AsyncRequest<T>
    where
        F: FnOnce(RequestError) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        self.chain(move |result| async move {
            match result {
                Ok(value) => Ok(value),
                Err(err) => f(err).await,
            }
        })
    }

    /// Side effect on success of the stages composed so far.
    pub fn on_success<F>(self, f: F) -> Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.chain(move |result| async move {
            if let Ok(value) = &result {
                f(value);
            }
            result
        })
    }

    /// Side effect on failure of the stages composed so far.
    pub fn on_failure<F>(self, f: F) -> Self
    where
        F: FnOnce(&RequestError) + Send + 'static,
    {
        self.chain(move |result| async move {
            if let Err(err) = &result {
                f(err);
            }
            result
        })
    }

    /// Cancel before submission. Returns false if already cancelled.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }

    pub fn state(&self) -> RequestState {
        self.cell.state()
    }

    /// Queue the request, capturing the ambient [`CallContext`] of the caller right now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(self) -> RequestHandle<T> {
        let (tx, rx) = oneshot::channel();
        let AsyncRequest { dispatcher, route, body, headers, reason, timeout, check, cell, stage } = self;
        let context = dispatcher.config().reason_precedence.resolve(reason, CallContext::current());
        dispatcher.submit(Submission {
            route,
            body,
            headers,
            context,
            timeout,
            check,
            cell: cell.clone(),
            completion: Box::new(Pipeline { stage, tx }),
        });
        RequestHandle { dispatcher, cell, rx }
    }

    /// Submit and wait for the result.
    pub async fn complete(self) -> Result<T, RequestError> {
        self.submit().await_result().await
    }
}

impl<T> fmt::Debug for AsyncRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRequest")
            .field("route", &self.route)
            .field("state", &self.cell.state())
            .field("stages", &"<stages>")
            .finish()
    }
}

/// A submitted request.
#[must_use = "dropping a handle does not cancel the request"]
pub struct RequestHandle<T> {
    // keeps the dispatcher alive until the request is resolved or the handle dropped
    dispatcher: Dispatcher,
    cell: Arc<RequestCell>,
    rx: oneshot::Receiver<Result<T, RequestError>>,
}

impl<T: Send + 'static> RequestHandle<T> {
    /// True only if the request had not been sent yet; it will never reach the transport.
    /// For a request already sent, delivery is suppressed and false is returned.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }

    pub fn state(&self) -> RequestState {
        self.cell.state()
    }

    /// Receiver observing every state transition.
    pub fn state_changes(&self) -> watch::Receiver<RequestState> {
        self.cell.subscribe()
    }

    /// Send attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.cell.attempts()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn await_result(self) -> Result<T, RequestError> {
        self.rx.await.unwrap_or(Err(RequestError::Shutdown))
    }

    /// Block the current thread until the request resolves.
    ///
    /// Must not be used from async code. From inside a continuation run by the dispatcher it
    /// would deadlock; debug builds detect that and fail with
    /// [`RequestError::BlockingInDispatch`].
    pub fn wait_blocking(self) -> Result<T, RequestError> {
        if cfg!(debug_assertions) && context::in_dispatch_context() {
            return Err(RequestError::BlockingInDispatch);
        }
        futures::executor::block_on(self.await_result())
    }
}

impl<T: Send + 'static> IntoFuture for RequestHandle<T> {
    type Output = Result<T, RequestError>;
    type IntoFuture = BoxFuture<'static, Result<T, RequestError>>;

    fn into_future(self) -> Self::IntoFuture {
        self.await_result().boxed()
    }
}

impl<T> fmt::Debug for RequestHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle").field("state", &self.cell.state()).finish()
    }
}
