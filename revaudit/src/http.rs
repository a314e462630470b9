//! HTTP client abstraction for making requests.
//!
//! This module defines the `HttpClient` trait to abstract HTTP request execution,
//! enabling testability with mock implementations. Implementations only move bytes; status
//! classification, rate limiting, and retries live in [`crate::transport`].

use crate::config::ApiConfig;
use crate::errors::{Error, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// A request against the platform API, relative to the configured base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, e.g. `metrics/`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Key used by [`MockHttpClient`] and in logs, e.g. `POST metric-aggregates/`
    pub fn route(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Response from an HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
    /// Parsed `Retry-After` header, in seconds
    pub retry_after: Option<f64>,
}

impl HttpResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            body: body.to_string(),
            retry_after: None,
        }
    }

    pub fn throttled(retry_after_seconds: f64) -> Self {
        Self {
            status: 429,
            body: r#"{"errors":[{"code":"throttled","detail":"Request was throttled."}]}"#.to_string(),
            retry_after: Some(retry_after_seconds),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for executing HTTP requests.
///
/// This abstraction allows for different implementations (production vs. testing)
/// and makes the extraction logic testable without making real HTTP calls.
#[async_trait]
pub trait HttpClient: Send + Sync + Clone {
    /// Execute an HTTP request.
    ///
    /// # Errors
    /// Returns an error if the request fails due to network issues or times out. Non-2xx
    /// statuses are returned as responses, not errors.
    async fn execute(&self, request: &ApiRequest, timeout: Duration) -> Result<HttpResponse>;
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    base_url: Url,
    auth_header_name: String,
    auth_value: Option<String>,
    revision: Option<String>,
}

impl ReqwestHttpClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Other(anyhow::anyhow!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: ensure_slash(&config.base_url),
            auth_header_name: config.auth_header_name.clone(),
            auth_value: config
                .api_key
                .as_ref()
                .map(|key| format!("{}{}", config.auth_header_prefix, key)),
            revision: config.revision.clone(),
        })
    }
}

/// Join a request's path and query onto the base URL.
fn build_url(base_url: &Url, request: &ApiRequest) -> Result<Url> {
    let mut url = base_url
        .join(request.path.trim_start_matches('/'))
        .map_err(|e| Error::BadRequest {
            message: format!("Invalid API path '{}': {e}", request.path),
        })?;
    if !request.query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &request.query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// Makes sure a url has a trailing slash.
///
/// Joining `/api` with `metrics/` gives `/metrics/`, but `/api/` with `metrics/` gives
/// `/api/metrics/`. Call this before calling .join
fn ensure_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        url.clone()
    } else {
        let mut new_url = url.clone();
        let mut path = new_url.path().to_string();
        path.push('/');
        new_url.set_path(&path);
        new_url
    }
}

/// Parse a `Retry-After` value given in (possibly fractional) seconds.
fn parse_retry_after(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|s| s.is_finite() && *s >= 0.0)
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(route = %request.route()))]
    async fn execute(&self, request: &ApiRequest, timeout: Duration) -> Result<HttpResponse> {
        let url = build_url(&self.base_url, request)?;

        tracing::debug!(url = %url, timeout_ms = timeout.as_millis() as u64, "Executing HTTP request");

        let mut req = self
            .client
            .request(request.method.clone(), url.clone())
            .timeout(timeout)
            .header("Accept", "application/json");

        if let Some(auth) = &self.auth_value {
            req = req.header(self.auth_header_name.as_str(), auth);
        }
        if let Some(revision) = &self.revision {
            req = req.header("revision", revision);
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| {
            tracing::error!(url = %url, error = %e, "HTTP request failed");
            e
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await?;

        tracing::debug!(status, response_len = body.len(), "HTTP request completed");

        Ok(HttpResponse {
            status,
            body,
            retry_after,
        })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock HTTP client for testing.
///
/// Responses are queued per route (`"{METHOD} {path}"`) and returned in FIFO order. A queued
/// response may also require a needle to appear in the request's query or body, which lets
/// concurrent aggregate queries against the same route receive their own responses.
///
/// # Example
/// ```ignore
/// let mock = MockHttpClient::new();
/// mock.add_response("GET metrics/", Ok(HttpResponse::json(200, &catalog)));
/// mock.add_response_when("POST metric-aggregates/", "$attributed_flow", Ok(flow_response));
/// ```
#[derive(Clone, Default)]
pub struct MockHttpClient {
    queued: Arc<Mutex<Vec<QueuedResponse>>>,
    fallbacks: Arc<Mutex<HashMap<String, HttpResponse>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

struct QueuedResponse {
    route: String,
    needle: Option<String>,
    response: Result<HttpResponse>,
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub route: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl MockHttpClient {
    /// Create a new mock HTTP client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a route.
    pub fn add_response(&self, route: &str, response: Result<HttpResponse>) {
        self.queued.lock().push(QueuedResponse {
            route: route.to_string(),
            needle: None,
            response,
        });
    }

    /// Queue a response returned only to requests whose query or body contains `needle`.
    pub fn add_response_when(&self, route: &str, needle: &str, response: Result<HttpResponse>) {
        self.queued.lock().push(QueuedResponse {
            route: route.to_string(),
            needle: Some(needle.to_string()),
            response,
        });
    }

    /// Response returned for a route whenever nothing is queued for it.
    pub fn set_fallback(&self, route: &str, response: HttpResponse) {
        self.fallbacks.lock().insert(route.to_string(), response);
    }

    /// Get all calls that have been made to this mock client.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of calls made to one route.
    pub fn calls_to(&self, route: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.route == route).count()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: &ApiRequest, timeout: Duration) -> Result<HttpResponse> {
        let route = request.route();

        // Record this call
        self.calls.lock().push(MockCall {
            route: route.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            timeout,
        });

        let haystack = format!(
            "{:?} {}",
            request.query,
            request.body.as_ref().map(Value::to_string).unwrap_or_default()
        );

        {
            let mut queued = self.queued.lock();
            let position = queued.iter().position(|q| {
                q.route == route && q.needle.as_ref().is_none_or(|needle| haystack.contains(needle.as_str()))
            });
            if let Some(position) = position {
                return queued.remove(position).response;
            }
        }

        if let Some(fallback) = self.fallbacks.lock().get(&route) {
            return Ok(fallback.clone());
        }

        // No response configured - return a default error
        Err(Error::Other(anyhow::anyhow!("No mock response configured for {route}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_client_basic() {
        let mock = MockHttpClient::new();
        mock.add_response("GET metrics/", Ok(HttpResponse::json(200, &json!({"data": []}))));

        let request = ApiRequest::get("metrics/");
        let response = mock.execute(&request, Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, r#"{"data":[]}"#);

        // Verify call was recorded
        let calls = mock.get_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].route, "GET metrics/");
        assert_eq!(calls[0].timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_mock_client_multiple_responses() {
        let mock = MockHttpClient::new();
        mock.add_response("GET flows/", Ok(HttpResponse::json(200, &json!("first"))));
        mock.add_response("GET flows/", Ok(HttpResponse::json(200, &json!("second"))));

        let request = ApiRequest::get("flows/");
        let first = mock.execute(&request, Duration::from_secs(1)).await.unwrap();
        let second = mock.execute(&request, Duration::from_secs(1)).await.unwrap();

        assert_eq!(first.body, r#""first""#);
        assert_eq!(second.body, r#""second""#);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_client_matches_needle() {
        let mock = MockHttpClient::new();
        mock.add_response_when("POST metric-aggregates/", "flow", Ok(HttpResponse::json(200, &json!("flow"))));
        mock.add_response_when(
            "POST metric-aggregates/",
            "campaign",
            Ok(HttpResponse::json(200, &json!("campaign"))),
        );

        let campaign = ApiRequest::post("metric-aggregates/", json!({"by": ["campaign"]}));
        let response = mock.execute(&campaign, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.body, r#""campaign""#);
    }

    #[tokio::test]
    async fn test_mock_client_no_response() {
        let mock = MockHttpClient::new();
        let result = mock.execute(&ApiRequest::get("unknown/"), Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_url_building() {
        let base = ensure_slash(&Url::parse("https://analytics.example.com/api").unwrap());
        let request = ApiRequest::get("campaigns/").with_query("filter", "equals(messages.channel,'email')");

        let url = build_url(&base, &request).unwrap();
        assert_eq!(url.path(), "/api/campaigns/");
        assert_eq!(
            url.query_pairs().next().map(|(k, v)| (k.into_owned(), v.into_owned())),
            Some(("filter".to_string(), "equals(messages.channel,'email')".to_string()))
        );
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("2"), Some(2.0));
        assert_eq!(parse_retry_after(" 0.5 "), Some(0.5));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
