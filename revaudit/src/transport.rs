//! Rate-limited, retrying transport over an [`HttpClient`].
//!
//! Every attempt first takes a slot from the shared [`RateLimiter`]. Upstream statuses are
//! classified into the crate's error taxonomy; throttled and transient failures are retried with
//! bounded, jittered backoff, everything else surfaces immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::prelude::RngExt;
use rand::rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::errors::{Error, Result};
use crate::http::{ApiRequest, HttpClient, HttpResponse};
use crate::limits::RateLimiter;

/// Counters describing the traffic a transport produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCounters {
    /// HTTP attempts issued, retries included
    pub calls: u64,
    /// Attempts rejected with a throttling status
    pub throttled: u64,
    /// Attempts that were retries of an earlier one
    pub retries: u64,
}

impl TransportCounters {
    /// Traffic produced since an earlier reading.
    pub fn since(self, earlier: TransportCounters) -> TransportCounters {
        TransportCounters {
            calls: self.calls.saturating_sub(earlier.calls),
            throttled: self.throttled.saturating_sub(earlier.throttled),
            retries: self.retries.saturating_sub(earlier.retries),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    throttled: AtomicU64,
    retries: AtomicU64,
}

pub struct Transport<H: HttpClient> {
    client: H,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    request_timeout: Duration,
    counters: Counters,
}

impl<H: HttpClient> Transport<H> {
    pub fn new(client: H, limiter: Arc<RateLimiter>, retry: RetryConfig, request_timeout: Duration) -> Self {
        Self {
            client,
            limiter,
            retry,
            request_timeout,
            counters: Counters::default(),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn counters(&self) -> TransportCounters {
        TransportCounters {
            calls: self.counters.calls.load(Ordering::Relaxed),
            throttled: self.counters.throttled.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    /// Send a request, retrying throttled and transient failures.
    ///
    /// Returns only successful (2xx) responses.
    #[tracing::instrument(skip(self, request), fields(route = %request.route()))]
    pub async fn send(&self, request: &ApiRequest) -> Result<HttpResponse> {
        let mut throttle_attempt = 0u32;
        let mut failure_attempt = 0u32;

        loop {
            let error = match self.send_once(request).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            let wait = match &error {
                Error::Throttled { retry_after_seconds } if throttle_attempt < self.retry.max_throttle_retries => {
                    let wait = hint_duration(*retry_after_seconds).max(self.backoff(throttle_attempt));
                    throttle_attempt += 1;
                    wait
                }
                Error::Transport { .. } | Error::Timeout { .. } if failure_attempt < self.retry.max_transport_retries => {
                    let wait = self.backoff(failure_attempt);
                    failure_attempt += 1;
                    wait
                }
                _ => {
                    if error.is_retryable() {
                        tracing::warn!(
                            error = %error,
                            throttle_attempt,
                            failure_attempt,
                            "Request failed permanently (no retries remaining)"
                        );
                    }
                    return Err(error);
                }
            };

            let wait = wait + self.jitter();
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                error = %error,
                wait_ms = wait.as_millis() as u64,
                throttle_attempt,
                failure_attempt,
                "Retrying request"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Send a request and deserialize its JSON body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        serde_json::from_str(&response.body).map_err(|e| {
            tracing::error!(route = %request.route(), error = %e, "Failed to decode response body");
            Error::malformed(format!("{}: {e}", request.route()))
        })
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<HttpResponse> {
        self.limiter.acquire().await;
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let response = self.client.execute(request, self.request_timeout).await?;
        let classified = classify(request, response);
        if matches!(classified, Err(Error::Throttled { .. })) {
            self.counters.throttled.fetch_add(1, Ordering::Relaxed);
        }
        classified
    }

    /// Exponential backoff: backoff_ms * (backoff_factor ^ attempt), capped at max_backoff_ms
    fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .retry
            .backoff_ms
            .saturating_mul(self.retry.backoff_factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.retry.max_backoff_ms))
    }

    fn jitter(&self) -> Duration {
        if self.retry.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng().random_range(0..=self.retry.jitter_ms))
    }
}

/// Longest server hint honored; anything above is treated as a misbehaving header.
const MAX_RETRY_AFTER_SECONDS: f64 = 3600.0;

fn hint_duration(seconds: f64) -> Duration {
    if seconds.is_finite() {
        Duration::from_secs_f64(seconds.clamp(0.0, MAX_RETRY_AFTER_SECONDS))
    } else {
        Duration::ZERO
    }
}

/// Map an upstream status onto the error taxonomy.
fn classify(request: &ApiRequest, response: HttpResponse) -> Result<HttpResponse> {
    match response.status {
        200..=299 => Ok(response),
        429 => Err(Error::Throttled {
            retry_after_seconds: response.retry_after.unwrap_or(0.0),
        }),
        401 | 403 => Err(Error::Unauthorized { status: response.status }),
        404 => Err(Error::NotFound {
            resource: "endpoint".to_string(),
            id: request.path.clone(),
        }),
        status @ 400..=499 => Err(Error::InvalidRequest {
            status,
            message: error_detail(&response.body),
        }),
        status => Err(Error::Transport {
            message: format!("upstream returned {status}: {}", error_detail(&response.body)),
        }),
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    errors: Vec<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    detail: Option<String>,
    title: Option<String>,
}

/// First error detail from a JSON:API error body, or the raw body truncated.
fn error_detail(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body)
        && let Some(first) = parsed.errors.into_iter().next()
        && let Some(detail) = first.detail.or(first.title)
    {
        return detail;
    }
    body.chars().take(200).collect()
}
