//! Cached, retrying HTTP accessor.
//!
//! `fetch` answers from the cache while an entry is within the freshness
//! window. Past that window it tries the network and, if the live call
//! fails after retries, hands back the expired entry flagged as stale. With
//! nothing cached there is nothing to fall back on and failures propagate.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{CacheEntry, CacheKey, FetchOutcome, ResponseCache, ResponseSnapshot, RetryConfig};
use crate::api::ApiError;

/// Default freshness window for cached responses.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(5);

/// A request with its method resolved, body encoded and key computed.
#[derive(Debug, Clone)]
struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    key: CacheKey,
}

/// Clone is cheap - clones share the reqwest connection pool and the cache.
#[derive(Clone)]
pub struct CachedAccessor {
    client: Client,
    cache: Arc<ResponseCache>,
    retry: RetryConfig,
    freshness: Duration,
}

impl CachedAccessor {
    pub fn new(client: Client, cache: Arc<ResponseCache>, retry: RetryConfig) -> Self {
        Self {
            client,
            cache,
            retry,
            freshness: DEFAULT_FRESHNESS,
        }
    }

    #[must_use]
    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn prepare(
        url: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
        method: Option<Method>,
    ) -> Result<PreparedRequest, ApiError> {
        let method = method.unwrap_or(if body.is_some() { Method::POST } else { Method::GET });
        let url = Url::parse(url).map_err(|e| ApiError::InvalidRequest(format!("{}: {}", url, e)))?;

        let mut headers = headers.clone();
        let body = match body {
            Some(value) => {
                headers
                    .entry(header::CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static("application/json"));
                Some(serde_json::to_vec(value).map_err(|e| ApiError::InvalidRequest(e.to_string()))?)
            }
            None => None,
        };

        let key = CacheKey::for_request(&method, &url, &headers, body.as_deref());
        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
            key,
        })
    }

    /// Fetch through the cache.
    ///
    /// A JSON `body` without an explicit `method` is sent as `POST`.
    pub async fn fetch(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
        method: Option<Method>,
    ) -> Result<FetchOutcome, ApiError> {
        let request = Self::prepare(url, headers, body, method)?;

        let Some(cached) = self.cache.get(&request.key).await else {
            debug!(url = %request.url, "Cache miss");
            let response = self.live(&request).await?;
            self.store(&request, &response).await;
            return Ok(FetchOutcome::fresh(response));
        };

        if cached.is_fresh(self.freshness) {
            debug!(url = %request.url, age = %cached.age_display(), "Cache hit");
            return Ok(FetchOutcome::fresh(cached.response));
        }

        match self.live(&request).await {
            Ok(response) if response.status.is_server_error() => {
                warn!(
                    url = %request.url,
                    status = %response.status,
                    cached = %cached.age_display(),
                    "Upstream error, serving stale cache"
                );
                Ok(FetchOutcome::stale(cached.response))
            }
            Ok(response) => {
                self.store(&request, &response).await;
                Ok(FetchOutcome::fresh(response))
            }
            Err(e) => {
                warn!(
                    url = %request.url,
                    error = %e,
                    cached = %cached.age_display(),
                    "Refresh failed, serving stale cache"
                );
                Ok(FetchOutcome::stale(cached.response))
            }
        }
    }

    /// Live call that bypasses the cache entirely, for mutations.
    pub async fn send(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
        method: Option<Method>,
    ) -> Result<ResponseSnapshot, ApiError> {
        let request = Self::prepare(url, headers, body, method)?;
        self.live(&request).await
    }

    /// Keep 2xx responses. Credentialed responses stay in memory only.
    async fn store(&self, request: &PreparedRequest, response: &ResponseSnapshot) {
        if !response.is_success() {
            return;
        }
        let entry = CacheEntry::new(response.clone());
        if request.headers.contains_key(header::AUTHORIZATION) {
            self.cache.insert_in_memory(request.key.clone(), entry).await;
        } else {
            self.cache.insert(request.key.clone(), entry).await;
        }
    }

    /// Network call bounded by the total timeout.
    async fn live(&self, request: &PreparedRequest) -> Result<ResponseSnapshot, ApiError> {
        match tokio::time::timeout(self.retry.timeout(), self.send_with_retry(request)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(format!(
                "{} {} exceeded {:?}",
                request.method,
                request.url,
                self.retry.timeout()
            ))),
        }
    }

    async fn send_with_retry(&self, request: &PreparedRequest) -> Result<ResponseSnapshot, ApiError> {
        let mut retries = 0;

        loop {
            let mut builder = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone());
            if let Some(ref body) = request.body {
                builder = builder.body(body.clone());
            }

            let failure = match builder.send().await {
                Ok(response) if self.retry.is_retryable(response.status()) => {
                    ApiError::Unavailable(format!("{} returned {}", request.url, response.status()))
                }
                Ok(response) => return Ok(ResponseSnapshot::read(response).await?),
                Err(e) if e.is_timeout() => ApiError::Timeout(format!("{}: {}", request.url, e)),
                Err(e) if e.is_connect() => ApiError::Unavailable(format!("{}: {}", request.url, e)),
                Err(e) => return Err(e.into()),
            };

            retries += 1;
            if retries > self.retry.max_retries {
                return Err(failure);
            }

            let delay = self.retry.delay_for(retries);
            warn!(
                url = %request.url,
                retry = retries,
                backoff_ms = delay.as_millis() as u64,
                error = %failure,
                "Transient upstream failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
