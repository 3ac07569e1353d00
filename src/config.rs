//! Dispatcher configuration.
//!
//! Build a [`DispatcherConfig`] in code with [`DispatcherConfig::builder`], or deserialize a
//! [`DispatcherSettings`] from the application's own config file and convert it with
//! `TryFrom`.

use crate::backoff::Backoff;
use crate::context::ReasonPrecedence;
use crate::error::ConfigError;
use crate::global::GlobalLimit;
use crate::jitter::Jitter;
use crate::policy::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_REASON_HEADER: &str = "X-Audit-Log-Reason";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_BUCKET_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Validated dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub(crate) base_url: String,
    pub(crate) user_agent: Option<String>,
    pub(crate) default_headers: Vec<(String, String)>,
    pub(crate) reason_header: String,
    pub(crate) encode_reason: bool,
    pub(crate) reason_precedence: ReasonPrecedence,
    pub(crate) global_limit: Option<GlobalLimit>,
    pub(crate) retry: RetryPolicy,
    pub(crate) request_timeout: Duration,
    pub(crate) bucket_idle_timeout: Duration,
    pub(crate) default_retry_after: Duration,
}

impl DispatcherConfig {
    pub fn builder(base_url: impl Into<String>) -> DispatcherConfigBuilder {
        DispatcherConfigBuilder {
            config: DispatcherConfig {
                base_url: base_url.into(),
                user_agent: None,
                default_headers: Vec::new(),
                reason_header: DEFAULT_REASON_HEADER.to_owned(),
                encode_reason: true,
                reason_precedence: ReasonPrecedence::default(),
                global_limit: Some(GlobalLimit::default()),
                retry: RetryPolicy::default(),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                bucket_idle_timeout: DEFAULT_BUCKET_IDLE_TIMEOUT,
                default_retry_after: DEFAULT_RETRY_AFTER,
            },
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn reason_header(&self) -> &str {
        &self.reason_header
    }

    pub fn global_limit(&self) -> Option<GlobalLimit> {
        self.global_limit
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn bucket_idle_timeout(&self) -> Duration {
        self.bucket_idle_timeout
    }

    pub(crate) fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

pub struct DispatcherConfigBuilder {
    config: DispatcherConfig,
}

impl DispatcherConfigBuilder {
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(agent.into());
        self
    }

    /// Header attached to every send (e.g. authorization).
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn reason_header(mut self, name: impl Into<String>) -> Self {
        self.config.reason_header = name.into();
        self
    }

    /// Percent-encode reasons before attaching them (on by default).
    pub fn encode_reason(mut self, encode: bool) -> Self {
        self.config.encode_reason = encode;
        self
    }

    pub fn reason_precedence(mut self, precedence: ReasonPrecedence) -> Self {
        self.config.reason_precedence = precedence;
        self
    }

    /// Account-wide budget; `None` leaves only server-signalled global throttles.
    pub fn global_limit(mut self, limit: Option<GlobalLimit>) -> Self {
        self.config.global_limit = limit;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn bucket_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.bucket_idle_timeout = timeout;
        self
    }

    pub fn default_retry_after(mut self, retry_after: Duration) -> Self {
        self.config.default_retry_after = retry_after;
        self
    }

    pub fn build(self) -> Result<DispatcherConfig, ConfigError> {
        let config = self.config;
        if config.base_url.trim().is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }
        if config.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if config.reason_header.trim().is_empty() {
            return Err(ConfigError::EmptyReasonHeader);
        }
        if let Some(limit) = config.global_limit {
            if limit.requests == 0 || limit.per.is_zero() {
                return Err(ConfigError::InvalidGlobalLimit);
            }
        }
        Ok(config)
    }
}

/// Serializable settings; durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub base_url: String,
    pub user_agent: Option<String>,
    pub default_headers: Vec<(String, String)>,
    pub reason_header: String,
    pub encode_reason: bool,
    pub reason_precedence: ReasonPrecedence,
    /// `None` disables the local account budget.
    pub global_requests: Option<u32>,
    pub global_window_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter: JitterSetting,
    pub request_timeout_ms: u64,
    pub bucket_idle_timeout_ms: u64,
    pub default_retry_after_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterSetting {
    #[default]
    None,
    Full,
    Equal,
}

impl From<JitterSetting> for Jitter {
    fn from(setting: JitterSetting) -> Self {
        match setting {
            JitterSetting::None => Jitter::None,
            JitterSetting::Full => Jitter::Full,
            JitterSetting::Equal => Jitter::Equal,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let global = GlobalLimit::default();
        Self {
            base_url: String::new(),
            user_agent: None,
            default_headers: Vec::new(),
            reason_header: DEFAULT_REASON_HEADER.to_owned(),
            encode_reason: true,
            reason_precedence: ReasonPrecedence::default(),
            global_requests: Some(global.requests),
            global_window_ms: millis(global.per),
            retry_max_attempts: 4,
            retry_base_ms: 500,
            retry_max_ms: 8_000,
            retry_jitter: JitterSetting::None,
            request_timeout_ms: millis(DEFAULT_REQUEST_TIMEOUT),
            bucket_idle_timeout_ms: millis(DEFAULT_BUCKET_IDLE_TIMEOUT),
            default_retry_after_ms: millis(DEFAULT_RETRY_AFTER),
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}

impl TryFrom<DispatcherSettings> for DispatcherConfig {
    type Error = ConfigError;

    fn try_from(s: DispatcherSettings) -> Result<Self, Self::Error> {
        let backoff = Backoff::exponential(Duration::from_millis(s.retry_base_ms))
            .with_max(Duration::from_millis(s.retry_max_ms))?;
        let retry = RetryPolicy::builder()
            .max_attempts(s.retry_max_attempts)
            .backoff(backoff)
            .with_jitter(s.retry_jitter.into())
            .build()?;

        let mut builder = DispatcherConfig::builder(s.base_url)
            .reason_header(s.reason_header)
            .encode_reason(s.encode_reason)
            .reason_precedence(s.reason_precedence)
            .global_limit(
                s.global_requests
                    .map(|requests| GlobalLimit::new(requests, Duration::from_millis(s.global_window_ms))),
            )
            .retry(retry)
            .request_timeout(Duration::from_millis(s.request_timeout_ms))
            .bucket_idle_timeout(Duration::from_millis(s.bucket_idle_timeout_ms))
            .default_retry_after(Duration::from_millis(s.default_retry_after_ms));
        if let Some(agent) = s.user_agent {
            builder = builder.user_agent(agent);
        }
        for (name, value) in s.default_headers {
            builder = builder.default_header(name, value);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DispatcherConfig::builder("https://api.example.com/v10").build().unwrap();
        assert_eq!(config.reason_header(), "X-Audit-Log-Reason");
        assert_eq!(config.global_limit(), Some(GlobalLimit::new(50, Duration::from_secs(1))));
        assert_eq!(config.retry().max_attempts(), 4);
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn url_joins_without_double_slash() {
        let config = DispatcherConfig::builder("https://api.example.com/v10/").build().unwrap();
        assert_eq!(config.url_for("/users/@me"), "https://api.example.com/v10/users/@me");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_eq!(DispatcherConfig::builder(" ").build().unwrap_err(), ConfigError::EmptyBaseUrl);
        assert_eq!(
            DispatcherConfig::builder("http://x").request_timeout(Duration::ZERO).build().unwrap_err(),
            ConfigError::ZeroTimeout
        );
        assert_eq!(
            DispatcherConfig::builder("http://x")
                .global_limit(Some(GlobalLimit::new(0, Duration::from_secs(1))))
                .build()
                .unwrap_err(),
            ConfigError::InvalidGlobalLimit
        );
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: DispatcherSettings = serde_json::from_str(
            r#"{
                "base_url": "https://api.example.com/v10",
                "global_requests": null,
                "retry_max_attempts": 2,
                "retry_jitter": "equal",
                "reason_precedence": "ambient_first"
            }"#,
        )
        .unwrap();
        let config = DispatcherConfig::try_from(settings).unwrap();
        assert_eq!(config.global_limit(), None);
        assert_eq!(config.retry().max_attempts(), 2);
        assert_eq!(config.reason_precedence, ReasonPrecedence::AmbientFirst);
        assert_eq!(config.bucket_idle_timeout(), DEFAULT_BUCKET_IDLE_TIMEOUT);
    }

    #[test]
    fn settings_propagate_backoff_errors() {
        let settings = DispatcherSettings {
            base_url: "http://x".into(),
            retry_base_ms: 1_000,
            retry_max_ms: 10,
            ..DispatcherSettings::default()
        };
        assert!(matches!(DispatcherConfig::try_from(settings), Err(ConfigError::Backoff(_))));
    }
}
