//! Call-scoped context (the audit reason) and its propagation.
//!
//! The ambient value lives in a tokio task-local, so it belongs to one logical call chain and
//! never leaks into concurrently running tasks. It is read exactly once, when a request is
//! submitted, and stored on the queued request by value. The dispatcher re-establishes that
//! stored value around every continuation it runs for the request, so calls issued from inside
//! a continuation inherit it.
//!
//! Scopes restore the surrounding value on every exit path, including panics.
//!
//! ```rust
//! use ratewarden::context::{self, CallContext};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! context::with_reason("spam cleanup", async {
//!     assert_eq!(CallContext::current().reason(), Some("spam cleanup"));
//! })
//! .await;
//! assert_eq!(CallContext::current().reason(), None);
//! # });
//! ```

use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static AMBIENT: CallContext;
    static IN_DISPATCH: ();
}

/// Per-call metadata captured at submission time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CallContext {
    reason: Option<Arc<str>>,
}

impl CallContext {
    /// Context carrying `reason`. Empty reasons are treated as absent.
    pub fn with_reason(reason: impl AsRef<str>) -> Self {
        let reason = reason.as_ref();
        Self { reason: (!reason.is_empty()).then(|| Arc::from(reason)) }
    }

    /// Snapshot of the ambient context of the calling task, or the empty context.
    pub fn current() -> Self {
        AMBIENT.try_with(Clone::clone).unwrap_or_default()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.reason.is_none()
    }

    /// Run `fut` with `self` as the ambient context.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        AMBIENT.scope(self, fut).await
    }

    /// Run `f` with `self` as the ambient context.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        AMBIENT.sync_scope(self, f)
    }
}

/// Which reason wins when a request carries an explicit one and the ambient context has one too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonPrecedence {
    #[default]
    ExplicitFirst,
    AmbientFirst,
}

impl ReasonPrecedence {
    pub(crate) fn resolve(&self, explicit: Option<CallContext>, ambient: CallContext) -> CallContext {
        match (self, explicit) {
            (_, None) => ambient,
            (ReasonPrecedence::ExplicitFirst, Some(explicit)) => explicit,
            (ReasonPrecedence::AmbientFirst, Some(explicit)) => {
                if ambient.is_empty() {
                    explicit
                } else {
                    ambient
                }
            }
        }
    }
}

/// Run `fut` with `reason` as the ambient reason, restoring the previous one afterwards.
pub async fn with_reason<F: Future>(reason: impl AsRef<str>, fut: F) -> F::Output {
    CallContext::with_reason(reason).scope(fut).await
}

/// Synchronous variant of [`with_reason`].
pub fn with_reason_sync<R>(reason: impl AsRef<str>, f: impl FnOnce() -> R) -> R {
    CallContext::with_reason(reason).sync_scope(f)
}

/// Marks `fut` as running on behalf of the dispatcher (continuations and hooks).
pub(crate) async fn in_dispatch<F: Future>(fut: F) -> F::Output {
    IN_DISPATCH.scope((), fut).await
}

/// Synchronous variant of [`in_dispatch`], for prechecks run on a bucket loop.
pub(crate) fn in_dispatch_sync<R>(f: impl FnOnce() -> R) -> R {
    IN_DISPATCH.sync_scope((), f)
}

/// Whether the caller is running inside a dispatcher-run continuation or precheck.
pub fn in_dispatch_context() -> bool {
    IN_DISPATCH.try_with(|_| ()).is_ok()
}
