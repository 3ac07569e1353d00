//! Parsing of rate-limit metadata from responses.
//!
//! Header names are matched case-insensitively. Missing or unparsable values are reported as
//! absent, which the bucket treats as "unconstrained until learned".

use crate::transport::Headers;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";

/// Which limit a 429 was charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleScope {
    /// Per-bucket limit of this account.
    User,
    /// Account-wide limit.
    Global,
    /// Per-resource limit shared with other accounts; does not count against us.
    Shared,
}

impl ThrottleScope {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "global" => Some(Self::Global),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Global => "global",
            Self::Shared => "shared",
        }
    }
}

/// Rate-limit headers of one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Window length left, relative to the response.
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<ThrottleScope>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &Headers) -> Self {
        let reset_after = headers
            .get(RESET_AFTER)
            .and_then(parse_seconds)
            .or_else(|| headers.get(RESET).and_then(parse_epoch_reset));

        Self {
            limit: headers.get(LIMIT).and_then(|v| v.trim().parse().ok()),
            remaining: headers.get(REMAINING).and_then(|v| v.trim().parse().ok()),
            reset_after,
            bucket: headers
                .get(BUCKET)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_owned),
            global: headers.get(GLOBAL).is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            scope: headers.get(SCOPE).and_then(ThrottleScope::parse),
            retry_after: headers.get(RETRY_AFTER).and_then(parse_seconds),
        }
    }

    /// Whether any bucket accounting header was present.
    pub fn has_bucket_state(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some() || self.reset_after.is_some()
    }
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ThrottleBody {
    /// Seconds to wait before retrying.
    pub retry_after: f64,
    #[serde(default)]
    pub global: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl ThrottleBody {
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        seconds(self.retry_after)
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value.trim().parse::<f64>().ok().and_then(seconds)
}

fn seconds(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs.min(86_400.0)))
}

/// Converts an absolute epoch reset into a relative window using the local clock.
fn parse_epoch_reset(value: &str) -> Option<Duration> {
    let reset = value.trim().parse::<f64>().ok()?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
    seconds((reset - now).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn parses_full_header_set() {
        let parsed = RateLimitHeaders::parse(&headers(&[
            ("X-RateLimit-Limit", "5"),
            ("X-RateLimit-Remaining", "4"),
            ("X-RateLimit-Reset-After", "2.5"),
            ("X-RateLimit-Bucket", "abcd1234"),
        ]));
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(4));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(2500)));
        assert_eq!(parsed.bucket.as_deref(), Some("abcd1234"));
        assert!(!parsed.global);
        assert!(parsed.has_bucket_state());
    }

    #[test]
    fn missing_headers_mean_unknown() {
        let parsed = RateLimitHeaders::parse(&Headers::new());
        assert_eq!(parsed, RateLimitHeaders::default());
        assert!(!parsed.has_bucket_state());
    }

    #[test]
    fn garbage_values_are_ignored() {
        let parsed = RateLimitHeaders::parse(&headers(&[
            ("x-ratelimit-limit", "many"),
            ("x-ratelimit-reset-after", "-3"),
            ("x-ratelimit-bucket", "  "),
        ]));
        assert_eq!(parsed.limit, None);
        assert_eq!(parsed.reset_after, None);
        assert_eq!(parsed.bucket, None);
    }

    #[test]
    fn epoch_reset_is_used_without_reset_after() {
        let future = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64() + 30.0;
        let value = future.to_string();
        let parsed = RateLimitHeaders::parse(&headers(&[("x-ratelimit-reset", value.as_str())]));
        let reset_after = parsed.reset_after.expect("reset");
        assert!(reset_after > Duration::from_secs(28) && reset_after <= Duration::from_secs(30));
    }

    #[test]
    fn global_and_scope_flags() {
        let parsed = RateLimitHeaders::parse(&headers(&[
            ("X-RateLimit-Global", "true"),
            ("X-RateLimit-Scope", "shared"),
            ("Retry-After", "3"),
        ]));
        assert!(parsed.global);
        assert_eq!(parsed.scope, Some(ThrottleScope::Shared));
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(3)));
    }

    #[test]
    fn throttle_body_parses_retry_after_and_global() {
        let body = ThrottleBody::parse(br#"{"message":"You are being rate limited.","retry_after":0.75,"global":true}"#)
            .expect("body");
        assert!(body.global);
        assert_eq!(body.retry_after(), Some(Duration::from_millis(750)));
        assert!(ThrottleBody::parse(b"<html>banned</html>").is_none());
    }
}
