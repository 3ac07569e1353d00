#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratewarden
//!
//! Rate-limit aware request dispatching for HTTP APIs that publish per-route buckets.
//!
//! ## Features
//!
//! - **Per-bucket FIFO queues** driven by one loop each, learning limits from response headers
//! - **Bucket discovery** that migrates and merges queues when the server names a bucket hash
//! - **Global limiter** shared by all buckets, closed by global 429s
//! - **Bounded retries** with backoff for 5xx and transport failures; 429s only ever delay
//! - **Composable requests** with `map`, `and_then`, hooks, cancellation and timeouts
//! - **Ambient call context** carrying an audit reason into every request and continuation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ratewarden::{Dispatcher, DispatcherConfig, Method, Route};
//! # use ratewarden::{HttpRequest, Response, Transport, TransportError};
//! # struct Http;
//! # #[async_trait::async_trait]
//! # impl Transport for Http {
//! #     async fn send(&self, _: HttpRequest) -> Result<Response, TransportError> { Ok(Response::new(200)) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::new(DispatcherConfig::builder("https://api.example.com").build()?, Http);
//!     let route = Route::builder(Method::Get, "/channels/{channel_id}")
//!         .major("channel_id", 7)
//!         .build()?;
//!
//!     let name = dispatcher
//!         .request(route)
//!         .reason("nightly audit")
//!         .map(|response| response.text())
//!         .complete()
//!         .await?;
//!     println!("{name}");
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bucket;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod global;
pub mod headers;
pub mod jitter;
pub mod policy;
pub mod prelude;
pub mod request;
pub mod route;
pub mod telemetry;
pub mod transport;
mod util;

// Re-exports
pub use backoff::Backoff;
pub use bucket::{BucketId, BucketSnapshot};
pub use config::{DispatcherConfig, DispatcherConfigBuilder, DispatcherSettings};
pub use context::{with_reason, with_reason_sync, CallContext, ReasonPrecedence};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, RequestError, RouteError, TransportError};
pub use global::{GlobalLimit, GlobalLimiter, GlobalSnapshot};
pub use jitter::Jitter;
pub use policy::{RetryPolicy, RetryPolicyBuilder};
pub use request::{AsyncRequest, RequestHandle, RequestState};
pub use route::{Method, Route, RouteKey};
pub use telemetry::{DispatchEvent, LogSink, MemorySink, NullSink};
pub use transport::{Headers, HttpRequest, Response, Transport};
