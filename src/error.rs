//! Error types surfaced by the dispatcher.
//!
//! Throttling never shows up here: a 429 is absorbed by the bucket loop and only ever delays a
//! request. Everything a caller can observe as a failed outcome is a [`RequestError`].
use std::time::Duration;

/// Terminal outcome of a request that did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// The server kept answering 5xx until the retry policy gave up.
    #[error("server unavailable (status {status}) after {attempts} attempts")]
    ServerUnavailable { status: u16, body: Vec<u8>, attempts: u32 },
    /// The transport kept failing until the retry policy gave up.
    #[error("transport failed after {attempts} attempts: {source}")]
    Transport {
        #[source]
        source: TransportError,
        attempts: u32,
    },
    /// The server refused the request (4xx other than 429); resending will not help.
    #[error("request rejected with status {status}")]
    Rejected { status: u16, body: Vec<u8>, attempts: u32 },
    /// The request was cancelled before it was sent, or its delivery was suppressed.
    #[error("request cancelled")]
    Cancelled,
    /// The wall-clock budget ran out across queueing and retries.
    #[error("request timed out after {elapsed:?} (budget {budget:?}, {attempts} attempts)")]
    Timeout { elapsed: Duration, budget: Duration, attempts: u32 },
    /// A composed stage could not decode the response body.
    #[error("failed to decode response body: {0}")]
    Decode(String),
    /// A continuation or hook panicked while the request was resolving.
    #[error("callback panicked: {0}")]
    CallbackPanicked(String),
    /// The dispatcher was shut down before the request resolved.
    #[error("dispatcher shut down")]
    Shutdown,
    /// A blocking wait was attempted from inside a dispatcher-run continuation.
    #[error("blocking wait inside a dispatcher continuation would deadlock")]
    BlockingInDispatch,
}

impl RequestError {
    /// True for the explicit cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when the failure was transient on the server or network side, so resubmitting at
    /// the application level may succeed.
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(self, Self::ServerUnavailable { .. } | Self::Transport { .. } | Self::Timeout { .. })
    }

    /// HTTP status of the final response, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServerUnavailable { status, .. } | Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response body of the final response, when one was received.
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            Self::ServerUnavailable { body, .. } | Self::Rejected { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Number of send attempts made before the request resolved.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::ServerUnavailable { attempts, .. }
            | Self::Transport { attempts, .. }
            | Self::Rejected { attempts, .. }
            | Self::Timeout { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::ServerUnavailable { .. } => "server_unavailable",
            Self::Transport { .. } => "transport",
            Self::Rejected { .. } => "rejected",
            Self::Cancelled => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Decode(_) => "decode",
            Self::CallbackPanicked(_) => "callback_panicked",
            Self::Shutdown => "shutdown",
            Self::BlockingInDispatch => "blocking_in_dispatch",
        }
    }
}

/// Single-attempt failure reported by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport deadline elapsed")]
    Timeout,
    #[error("transport error: {0}")]
    Other(String),
}

/// Invalid route construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("placeholder `{0}` has no bound value")]
    Unbound(String),
    #[error("parameter `{0}` does not appear in the template")]
    UnknownParameter(String),
    #[error("template `{0}` has an unterminated placeholder")]
    Malformed(String),
}

/// Invalid dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("request timeout must be greater than zero")]
    ZeroTimeout,
    #[error("global limit must allow at least one request per non-zero window")]
    InvalidGlobalLimit,
    #[error("reason header name must not be empty")]
    EmptyReasonHeader,
    #[error(transparent)]
    Retry(#[from] crate::policy::BuildError),
    #[error(transparent)]
    Backoff(#[from] crate::backoff::BackoffError),
}
