//! reqwest-backed [`RestTransport`].
//!
//! - One pooled client per transport, 30 s request timeout
//! - Basic auth header built from the request's credentials
//! - Bounded retry with exponential backoff on 429 and connect failures
//!
//! Any other failure is returned immediately; the next scheduled sync is the
//! retry.

use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::transport::{BasicAuth, HttpMethod, RestRequest, RestTransport};
use crate::{GeofenceError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 2;
const BACKOFF_BASE_MS: u64 = 500;

/// Longest slice of an error body kept in the error message.
const ERROR_BODY_PREVIEW: usize = 200;

pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl ReqwestTransport {
    /// Transport rooted at `base_url` with the default 30 s timeout.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeofenceError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Override the retry budget for 429 and connect failures.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn build(&self, request: &RestRequest) -> RequestBuilder {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, self.url(&request.path))
            .header(ACCEPT, "application/json");
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(auth) = &request.basic_auth {
            builder = builder.header(AUTHORIZATION, basic_auth_header(auth));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    async fn send(&self, request: RestRequest) -> Result<Value> {
        let mut retries = 0;

        loop {
            debug!(
                "[ReqwestTransport] {} {}",
                request.method.as_str(),
                request.path
            );

            match self.build(&request).send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status == StatusCode::TOO_MANY_REQUESTS && retries < self.max_retries {
                        retries += 1;
                        let backoff = backoff(retries);
                        warn!(
                            "[ReqwestTransport] 429 for {}, retry {} after {:?}",
                            request.path, retries, backoff
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    let body = resp.bytes().await.map_err(|e| GeofenceError::Network {
                        message: format!("failed to read response body: {}", e),
                        status_code: Some(status.as_u16()),
                    })?;

                    if !status.is_success() {
                        let preview: String = String::from_utf8_lossy(&body)
                            .chars()
                            .take(ERROR_BODY_PREVIEW)
                            .collect();
                        return Err(GeofenceError::Network {
                            message: format!("HTTP {} for {}: {}", status, request.path, preview),
                            status_code: Some(status.as_u16()),
                        });
                    }

                    if body.iter().all(u8::is_ascii_whitespace) {
                        return Ok(Value::Null);
                    }
                    return serde_json::from_slice(&body).map_err(|e| {
                        GeofenceError::parse(format!("invalid JSON from {}: {}", request.path, e))
                    });
                }
                Err(e) => {
                    if e.is_connect() && retries < self.max_retries {
                        retries += 1;
                        let backoff = backoff(retries);
                        warn!(
                            "[ReqwestTransport] Connect error for {}: {}, retry {} after {:?}",
                            request.path, e, retries, backoff
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    let message = if e.is_timeout() {
                        format!("request to {} timed out", request.path)
                    } else {
                        format!("request to {} failed: {}", request.path, e)
                    };
                    return Err(GeofenceError::Network {
                        message,
                        status_code: e.status().map(|s| s.as_u16()),
                    });
                }
            }
        }
    }
}

impl RestTransport for ReqwestTransport {
    fn execute(&self, request: RestRequest) -> BoxFuture<'_, Result<Value>> {
        self.send(request).boxed()
    }
}

fn basic_auth_header(auth: &BasicAuth) -> String {
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", auth.username, auth.password));
    format!("Basic {}", encoded)
}

fn backoff(attempt: u32) -> Duration {
    // 1s, 2s, 4s...
    Duration::from_millis(BACKOFF_BASE_MS << attempt.min(4))
}
