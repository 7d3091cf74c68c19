//! Generic request/response transport.
//!
//! The sync engine and the event notifier only see [`RestTransport`]; the
//! reqwest implementation lives in [`crate::http`] behind the `http` feature,
//! and hosts may plug in their own (e.g. the platform's HTTP stack).

use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;

use crate::Result;

/// HTTP verb of a [`RestRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Basic-auth credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A single call against the server, relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub path: String,
    pub method: HttpMethod,
    /// Query parameters, in order
    pub params: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Value>,
    pub basic_auth: Option<BasicAuth>,
}

impl RestRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: HttpMethod::Get,
            params: Vec::new(),
            body: None,
            basic_auth: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            path: path.into(),
            method: HttpMethod::Post,
            params: Vec::new(),
            body: Some(body),
            basic_auth: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_basic_auth(mut self, auth: Option<BasicAuth>) -> Self {
        self.basic_auth = auth;
        self
    }

    /// Value of the first query parameter named `key`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Asynchronous request/response collaborator.
///
/// Implementations resolve to the parsed JSON body (`Value::Null` for an empty
/// body). Transport failures, timeouts and non-success statuses resolve to
/// [`GeofenceError::Network`](crate::GeofenceError::Network); an unparseable
/// body to [`GeofenceError::Parse`](crate::GeofenceError::Parse).
pub trait RestTransport: Send + Sync {
    fn execute(&self, request: RestRequest) -> BoxFuture<'_, Result<Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builders() {
        let request = RestRequest::get("tenants/t/organizations/o/geofences")
            .with_param("lastSyncDate", "2024-01-01")
            .with_param("startIndex", 0);
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.param("lastSyncDate"), Some("2024-01-01"));
        assert_eq!(request.param("startIndex"), Some("0"));
        assert_eq!(request.param("missing"), None);

        let request = RestRequest::post("events", json!({"a": 1}));
        assert_eq!(request.method.as_str(), "POST");
        assert!(request.body.is_some());
    }

    #[test]
    fn test_basic_auth_debug_redacts() {
        let auth = BasicAuth {
            username: "device".to_string(),
            password: "secret".to_string(),
        };
        let debug = format!("{:?}", auth);
        assert!(debug.contains("device"));
        assert!(!debug.contains("secret"));
    }
}
