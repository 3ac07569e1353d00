#![allow(dead_code)]

use async_trait::async_trait;
use ratewarden::{
    Dispatcher, DispatcherConfig, DispatcherConfigBuilder, Headers, HttpRequest, Method, Response, Transport,
    TransportError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::time::Instant;

pub const BASE: &str = "http://api.test";

/// One scripted transport outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Respond(Response),
    /// Respond after the given latency.
    Slow(Duration, Response),
    Fail(TransportError),
}

/// A send as the transport saw it.
#[derive(Debug, Clone)]
pub struct Sent {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub at: Instant,
}

#[derive(Default)]
struct Script {
    steps: HashMap<String, VecDeque<Step>>,
    otherwise: Option<Response>,
    sent: Vec<Sent>,
}

/// Transport playing back scripted outcomes per path. Unscripted sends get `otherwise`, which
/// defaults to an empty 200.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self, path: &str, step: Step) -> &Self {
        self.script.lock().unwrap().steps.entry(path.to_owned()).or_default().push_back(step);
        self
    }

    pub fn respond(&self, path: &str, response: Response) -> &Self {
        self.step(path, Step::Respond(response))
    }

    pub fn slow(&self, path: &str, latency: Duration, response: Response) -> &Self {
        self.step(path, Step::Slow(latency, response))
    }

    pub fn fail(&self, path: &str, error: TransportError) -> &Self {
        self.step(path, Step::Fail(error))
    }

    pub fn otherwise(&self, response: Response) -> &Self {
        self.script.lock().unwrap().otherwise = Some(response);
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.script.lock().unwrap().sent.clone()
    }

    pub fn sent_to(&self, path: &str) -> Vec<Sent> {
        self.sent().into_iter().filter(|sent| sent.path == path).collect()
    }

    pub fn paths(&self) -> Vec<String> {
        self.sent().into_iter().map(|sent| sent.path).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<Response, TransportError> {
        let path = request.url.strip_prefix(BASE).unwrap_or(&request.url).to_owned();
        let step = {
            let mut script = self.script.lock().unwrap();
            script.sent.push(Sent {
                method: request.method,
                path: path.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
                at: Instant::now(),
            });
            let scripted = script.steps.get_mut(&path).and_then(VecDeque::pop_front);
            scripted.unwrap_or_else(|| Step::Respond(script.otherwise.clone().unwrap_or_else(|| Response::new(200))))
        };
        match step {
            Step::Respond(response) => Ok(response),
            Step::Slow(latency, response) => {
                tokio::time::sleep(latency).await;
                Ok(response)
            }
            Step::Fail(error) => Err(error),
        }
    }
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
    });
}

pub fn config() -> DispatcherConfigBuilder {
    DispatcherConfig::builder(BASE).global_limit(None)
}

pub fn dispatcher(transport: &ScriptedTransport) -> Dispatcher {
    dispatcher_with(transport, config())
}

pub fn dispatcher_with(transport: &ScriptedTransport, config: DispatcherConfigBuilder) -> Dispatcher {
    init_tracing();
    Dispatcher::new(config.build().unwrap(), transport.clone())
}

pub fn ok() -> Response {
    Response::new(200)
}

/// Successful response carrying bucket headers.
pub fn limited(hash: &str, limit: u32, remaining: u32, reset_after: f64) -> Response {
    Response::new(200)
        .with_header("X-RateLimit-Limit", limit.to_string())
        .with_header("X-RateLimit-Remaining", remaining.to_string())
        .with_header("X-RateLimit-Reset-After", reset_after.to_string())
        .with_header("X-RateLimit-Bucket", hash)
}

/// A 429 with a JSON body, as the API sends it.
pub fn throttled(retry_after: f64, global: bool) -> Response {
    let body = serde_json::json!({
        "message": "You are being rate limited.",
        "retry_after": retry_after,
        "global": global,
    });
    let response = Response::new(429)
        .with_header("Retry-After", retry_after.ceil().to_string())
        .with_body(body.to_string());
    if global {
        response.with_header("X-RateLimit-Global", "true").with_header("X-RateLimit-Scope", "global")
    } else {
        response.with_header("X-RateLimit-Scope", "user")
    }
}

pub fn since(start: Instant, sent: &Sent) -> Duration {
    sent.at.duration_since(start)
}

/// `actual` lies in `[expected, expected + 20ms)`.
pub fn assert_around(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(20),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

/// Let spawned tasks run without advancing paused time meaningfully.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
