//! Retryable HTTP adapter (specification §4.5).
//!
//! Wraps a pooled `reqwest::Client` with the retry policy from
//! [`crate::resilience::retry`]: network errors, 503, 429 (honouring
//! `Retry-After`), and read timeouts are retried; 4xx is not. Metrics are
//! accumulated process-wide per client instance, the same way the
//! teacher crate keeps a single shared client per downstream service.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::HttpClientConfig;
use crate::error::{OmniError, OmniResult};
use crate::resilience::retry::{classify_http_status, Retryability, RetryPolicy};

/// HTTP methods the adapter exposes typed helpers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Cumulative metrics for a single [`RetryingHttpClient`] instance (§4.5).
#[derive(Debug, Default)]
pub struct HttpClientMetrics {
    total_requests: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    timeout_errors: AtomicU64,
    retries_attempted: AtomicU64,
    cumulative_duration_ms: AtomicU64,
}

/// A point-in-time snapshot of [`HttpClientMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpClientMetricsSnapshot {
    /// Total logical requests issued (one per caller invocation, regardless
    /// of retry count).
    pub total_requests: u64,
    /// Requests that ultimately succeeded.
    pub successful: u64,
    /// Requests that ultimately failed after exhausting retries.
    pub failed: u64,
    /// Attempts that failed specifically due to a timeout.
    pub timeout_errors: u64,
    /// Total retry attempts issued across all requests.
    pub retries_attempted: u64,
    /// Cumulative wall-clock duration spent across all attempts, in
    /// milliseconds.
    pub cumulative_duration_ms: u64,
}

impl HttpClientMetrics {
    fn snapshot(&self) -> HttpClientMetricsSnapshot {
        HttpClientMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
            retries_attempted: self.retries_attempted.load(Ordering::Relaxed),
            cumulative_duration_ms: self.cumulative_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// A retryable, connection-pooled HTTP client (§4.5).
pub struct RetryingHttpClient {
    client: reqwest::Client,
    retry_policy: RetryPolicy,
    metrics: HttpClientMetrics,
}

impl RetryingHttpClient {
    /// Build a client from configuration, constructing a pooled
    /// `reqwest::Client` with the configured connection and timeout bounds.
    ///
    /// # Errors
    /// Returns [`OmniError::Internal`] if the underlying `reqwest` client
    /// cannot be constructed.
    pub fn new(config: &HttpClientConfig) -> OmniResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_keepalive_connections)
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()
            .map_err(|e| OmniError::Internal(format!("building http client: {e}")))?;
        Ok(Self { client, retry_policy: RetryPolicy::from_config(config), metrics: HttpClientMetrics::default() })
    }

    /// Metrics snapshot (§4.5).
    #[must_use]
    pub fn metrics(&self) -> HttpClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Typed `GET`, decoding the response body as JSON.
    ///
    /// # Errors
    /// Returns [`OmniError::Http`] or [`OmniError::Transient`] once every
    /// retry attempt is exhausted.
    pub async fn get<R: DeserializeOwned>(&self, url: &str) -> OmniResult<R> {
        self.execute(Method::Get, url, None::<&()>).await
    }

    /// Typed `POST` with a JSON body.
    ///
    /// # Errors
    /// Returns [`OmniError::Http`] or [`OmniError::Transient`] once every
    /// retry attempt is exhausted.
    pub async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, url: &str, body: &B) -> OmniResult<R> {
        self.execute(Method::Post, url, Some(body)).await
    }

    /// Typed `PUT` with a JSON body.
    ///
    /// # Errors
    /// Returns [`OmniError::Http`] or [`OmniError::Transient`] once every
    /// retry attempt is exhausted.
    pub async fn put<B: Serialize + Sync, R: DeserializeOwned>(&self, url: &str, body: &B) -> OmniResult<R> {
        self.execute(Method::Put, url, Some(body)).await
    }

    /// Typed `DELETE`.
    ///
    /// # Errors
    /// Returns [`OmniError::Http`] or [`OmniError::Transient`] once every
    /// retry attempt is exhausted.
    pub async fn delete<R: DeserializeOwned>(&self, url: &str) -> OmniResult<R> {
        self.execute(Method::Delete, url, None::<&()>).await
    }

    async fn execute<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> OmniResult<R> {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let result = self
            .retry_policy
            .run(
                |attempt| {
                    if attempt > 1 {
                        self.metrics.retries_attempted.fetch_add(1, Ordering::Relaxed);
                    }
                    self.attempt(method, url, body)
                },
                |err: &OmniError| self.classify(err),
            )
            .await;

        self.metrics
            .cumulative_duration_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        match result {
            Ok(value) => {
                self.metrics.successful.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn attempt<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> OmniResult<R> {
        let mut request = self.client.request(method.as_reqwest(), url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                self.metrics.timeout_errors.fetch_add(1, Ordering::Relaxed);
            }
            OmniError::Transient(format!("http request to {url} failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            if let (Retryability::Retryable, Some(secs)) =
                (classify_http_status(status.as_u16()), retry_after)
            {
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            return Err(OmniError::Transient(format!(
                "http request to {url} returned status {status}"
            )));
        }

        response.json::<R>().await.map_err(OmniError::Http)
    }

    fn classify(&self, err: &OmniError) -> Retryability {
        match err {
            OmniError::Transient(msg) => {
                if let Some(status) = extract_status(msg) {
                    classify_http_status(status)
                } else {
                    Retryability::Retryable
                }
            }
            _ => Retryability::Fatal,
        }
    }
}

fn extract_status(message: &str) -> Option<u16> {
    message
        .rsplit("status ")
        .next()
        .and_then(|tail| tail.split_whitespace().next())
        .and_then(|token| token.parse::<u16>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_extraction_reads_trailing_status_code() {
        assert_eq!(extract_status("http request to x returned status 503"), Some(503));
        assert_eq!(extract_status("connection reset"), None);
    }

    #[tokio::test]
    async fn metrics_start_at_zero() {
        let client = RetryingHttpClient::new(&HttpClientConfig::default()).expect("client");
        let snapshot = client.metrics();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.successful, 0);
        assert_eq!(snapshot.failed, 0);
    }
}
