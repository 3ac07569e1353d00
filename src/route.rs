//! Route descriptors.
//!
//! A [`Route`] is the method, the path template, and the values bound to its placeholders.
//! Only *major* parameters take part in rate-limit identity: two routes with the same method,
//! template and major values share a [`RouteKey`] and therefore a bucket until the server says
//! otherwise. Minor parameters only affect the compiled path.
//!
//! ```rust
//! use ratewarden::{Method, Route};
//!
//! let route = Route::builder(Method::Delete, "/channels/{channel_id}/messages/{message_id}")
//!     .major("channel_id", 41771983423143937u64)
//!     .param("message_id", 1)
//!     .build()
//!     .unwrap();
//! assert_eq!(route.compiled_path(), "/channels/41771983423143937/messages/1");
//! ```

use crate::error::RouteError;
use std::fmt;
use std::sync::Arc;

/// HTTP methods the API accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate-limit identity of a route, used until a bucket hash is learned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    method: Method,
    template: Arc<str>,
    major: Vec<(Arc<str>, String)>,
}

impl RouteKey {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn major_params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.major.iter().map(|(k, v)| (k.as_ref(), v.as_str()))
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)?;
        for (i, (name, value)) in self.major.iter().enumerate() {
            let sep = if i == 0 { '[' } else { ',' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        if !self.major.is_empty() {
            f.write_str("]")?;
        }
        Ok(())
    }
}

/// Immutable endpoint descriptor. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    key: Arc<RouteKey>,
    path: Arc<str>,
}

impl Route {
    pub fn builder(method: Method, template: impl Into<String>) -> RouteBuilder {
        RouteBuilder { method, template: template.into(), major: Vec::new(), minor: Vec::new() }
    }

    /// Route without placeholders.
    pub fn fixed(method: Method, path: impl Into<String>) -> Result<Self, RouteError> {
        Self::builder(method, path).build()
    }

    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    pub fn method(&self) -> Method {
        self.key.method
    }

    pub fn template(&self) -> &str {
        &self.key.template
    }

    /// The template with every placeholder substituted.
    pub fn compiled_path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key.method, self.path)
    }
}

pub struct RouteBuilder {
    method: Method,
    template: String,
    major: Vec<(String, String)>,
    minor: Vec<(String, String)>,
}

impl RouteBuilder {
    /// Bind a rate-limit-significant parameter.
    pub fn major(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.major.push((name.into(), value.to_string()));
        self
    }

    /// Bind a parameter that only affects the compiled path.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.minor.push((name.into(), value.to_string()));
        self
    }

    pub fn build(self) -> Result<Route, RouteError> {
        let slots = placeholders(&self.template)?;
        for (name, _) in self.major.iter().chain(self.minor.iter()) {
            if !slots.iter().any(|s| s == name) {
                return Err(RouteError::UnknownParameter(name.clone()));
            }
        }

        let lookup = |slot: &str| {
            self.major
                .iter()
                .chain(self.minor.iter())
                .find(|(name, _)| name == slot)
                .map(|(_, value)| value.as_str())
        };

        let mut path = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            path.push_str(&rest[..open]);
            let Some(len) = rest[open..].find('}') else {
                return Err(RouteError::Malformed(self.template.clone()));
            };
            let close = open + len;
            let slot = &rest[open + 1..close];
            let value = lookup(slot).ok_or_else(|| RouteError::Unbound(slot.to_owned()))?;
            path.push_str(value);
            rest = &rest[close + 1..];
        }
        path.push_str(rest);

        // Major params are ordered by their position in the template so binding order is
        // irrelevant to identity.
        let mut major: Vec<(Arc<str>, String)> = Vec::with_capacity(self.major.len());
        for slot in &slots {
            if let Some((name, value)) = self.major.iter().find(|(name, _)| name == slot) {
                major.push((Arc::from(name.as_str()), value.clone()));
            }
        }

        Ok(Route {
            key: Arc::new(RouteKey { method: self.method, template: Arc::from(self.template), major }),
            path: Arc::from(path),
        })
    }
}

fn placeholders(template: &str) -> Result<Vec<String>, RouteError> {
    let mut slots = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(len) = rest[open..].find('}') else {
            return Err(RouteError::Malformed(template.to_owned()));
        };
        slots.push(rest[open + 1..open + len].to_owned());
        rest = &rest[open + len + 1..];
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(channel: u64, message: u64) -> Route {
        Route::builder(Method::Patch, "/channels/{channel_id}/messages/{message_id}")
            .major("channel_id", channel)
            .param("message_id", message)
            .build()
            .unwrap()
    }

    #[test]
    fn minor_params_do_not_change_identity() {
        assert_eq!(messages(1, 10).key(), messages(1, 11).key());
        assert_ne!(messages(1, 10).compiled_path(), messages(1, 11).compiled_path());
    }

    #[test]
    fn major_params_partition_identity() {
        assert_ne!(messages(1, 10).key(), messages(2, 10).key());
    }

    #[test]
    fn method_is_part_of_identity() {
        let get = Route::fixed(Method::Get, "/gateway").unwrap();
        let post = Route::fixed(Method::Post, "/gateway").unwrap();
        assert_ne!(get.key(), post.key());
    }

    #[test]
    fn binding_order_does_not_matter() {
        let a = Route::builder(Method::Put, "/guilds/{guild_id}/members/{user_id}/roles/{role_id}")
            .major("guild_id", 1)
            .param("role_id", 3)
            .param("user_id", 2)
            .build()
            .unwrap();
        let b = Route::builder(Method::Put, "/guilds/{guild_id}/members/{user_id}/roles/{role_id}")
            .param("user_id", 2)
            .param("role_id", 3)
            .major("guild_id", 1)
            .build()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.compiled_path(), "/guilds/1/members/2/roles/3");
    }

    #[test]
    fn unbound_placeholder_is_rejected() {
        let err = Route::builder(Method::Get, "/guilds/{guild_id}").build().unwrap_err();
        assert_eq!(err, RouteError::Unbound("guild_id".into()));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let err = Route::builder(Method::Get, "/users/@me").major("guild_id", 1).build().unwrap_err();
        assert_eq!(err, RouteError::UnknownParameter("guild_id".into()));
    }

    #[test]
    fn unterminated_placeholder_is_rejected() {
        let err = Route::fixed(Method::Get, "/guilds/{guild_id").unwrap_err();
        assert!(matches!(err, RouteError::Malformed(_)));
    }

    #[test]
    fn key_display_lists_major_values() {
        let route = messages(7, 8);
        assert_eq!(
            route.key().to_string(),
            "PATCH /channels/{channel_id}/messages/{message_id}[channel_id=7]"
        );
    }
}
