//! Typed client for the snap store.
//!
//! Public catalogue reads go through the cached accessor and report whether
//! the data was served stale. Publisher calls additionally carry the
//! session's macaroons and drive the refresh-and-retry cycle, capped at
//! `Config::max_refresh_attempts` refreshes per call.

use std::sync::Arc;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use super::ApiError;
use crate::auth::{caveat_id, empty_session, needs_refresh, AuthBroker, AuthError, Session, VerificationOutcome};
use crate::cache::{CachedAccessor, FetchOutcome, ResponseCache, ResponseSnapshot};
use crate::config::Config;
use crate::models::{Account, MetricsQuery, MetricsResponse, SearchResults, SnapDetails, SnapSummary, StoreError};

/// Search results are limited to these confinements.
const CONFINEMENT: &str = "strict,classic";

/// Error code the dashboard uses for accounts that cannot publish yet.
const USER_NOT_READY: &str = "user-not-ready";

/// Metadata fields a publisher may update from the listing form.
pub const METADATA_FIELDS: &[&str] = &[
    "title",
    "summary",
    "description",
    "contact_url",
    "keywords",
    "license",
    "price",
    "blacklist_countries",
    "whitelist_countries",
];

/// Decoded data plus whether it came from an expired cache entry.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub data: T,
    pub is_stale_due_to_error: bool,
}

impl<T> Fetched<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        Fetched {
            data: f(self.data),
            is_stale_due_to_error: self.is_stale_due_to_error,
        }
    }
}

/// Page window for search, expressed the way the frontend receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchPage {
    pub size: u32,
    pub offset: u32,
}

impl Default for SearchPage {
    fn default() -> Self {
        Self { size: 10, offset: 0 }
    }
}

impl SearchPage {
    /// 1-based page number the search service expects.
    pub fn page(&self) -> u32 {
        self.offset / self.size.max(1) + 1
    }
}

/// Clone is cheap - clones share the connection pool and the cache.
#[derive(Clone)]
pub struct StoreClient {
    accessor: CachedAccessor,
    broker: AuthBroker,
    config: Config,
}

impl StoreClient {
    /// Create a client with a process-local cache.
    pub fn new(config: Config) -> Result<Self, ApiError> {
        Self::with_cache(config, Arc::new(ResponseCache::in_memory()))
    }

    pub fn with_cache(config: Config, cache: Arc<ResponseCache>) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.retry.timeout()).build()?;
        let accessor = CachedAccessor::new(client.clone(), cache, config.retry.clone())
            .with_freshness(config.freshness_window());
        let broker = AuthBroker::new(client, config.auth_endpoints());
        Ok(Self {
            accessor,
            broker,
            config,
        })
    }

    pub fn accessor(&self) -> &CachedAccessor {
        &self.accessor
    }

    pub fn broker(&self) -> &AuthBroker {
        &self.broker
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn endpoint(base: &str, segments: &[&str], query: &[(&str, &str)]) -> Result<String, ApiError> {
        let mut url = Url::parse(base).map_err(|e| ApiError::InvalidRequest(format!("{}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidRequest(format!("{} cannot be a base URL", base)))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url.into())
    }

    fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
        HeaderValue::from_str(value)
            .map_err(|_| ApiError::InvalidRequest(format!("invalid header value {:?}", value)))
    }

    fn device_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ubuntu-series", Self::header_value(&self.config.series)?);
        headers.insert("x-ubuntu-architecture", Self::header_value(&self.config.architecture)?);
        Ok(headers)
    }

    fn search_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ubuntu-frameworks", HeaderValue::from_static("*"));
        headers.insert("x-ubuntu-architecture", Self::header_value(&self.config.architecture)?);
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/hal+json"));
        Ok(headers)
    }

    fn publisher_headers(&self, authorization: &str) -> Result<HeaderMap, ApiError> {
        let mut headers = self.device_headers()?;
        headers.insert(header::AUTHORIZATION, Self::header_value(authorization)?);
        Ok(headers)
    }

    // ===== Public catalogue =====

    async fn get_public<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &HeaderMap,
        body: Option<&Value>,
    ) -> Result<Fetched<T>, ApiError> {
        let outcome = self.accessor.fetch(url, headers, body, None).await?;
        let response = &outcome.response;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status.as_u16(), &response.text()));
        }
        Ok(Fetched {
            data: response.json()?,
            is_stale_due_to_error: outcome.is_stale_due_to_error,
        })
    }

    /// Stable-channel details for a snap.
    pub async fn snap_details(&self, snap_name: &str) -> Result<Fetched<SnapDetails>, ApiError> {
        let url = Self::endpoint(
            &self.config.api_url,
            &["api", "v1", "snaps", "details", snap_name],
            &[("channel", "stable")],
        )?;
        self.get_public(&url, &self.device_headers()?, None)
            .await
            .map_err(|e| match e {
                ApiError::NotFound(_) => ApiError::NotFound(format!("Snap not found: {}", snap_name)),
                ApiError::Rejected { status, .. } => ApiError::Rejected {
                    status,
                    body: format!("Failed to get snap details for {}", snap_name),
                },
                other => other,
            })
    }

    pub async fn snap_id(&self, snap_name: &str) -> Result<String, ApiError> {
        Ok(self.snap_details(snap_name).await?.data.snap_id)
    }

    pub async fn search(&self, query: &str, page: SearchPage) -> Result<Fetched<SearchResults>, ApiError> {
        if page.size == 0 {
            return Err(ApiError::InvalidRequest("search page size must be positive".to_string()));
        }
        let page_number = page.page().to_string();
        let size = page.size.to_string();
        let url = Self::endpoint(
            &self.config.search_url,
            &["api", "v1", "snaps", "search"],
            &[
                ("q", query),
                ("page", page_number.as_str()),
                ("size", size.as_str()),
                ("confinement", CONFINEMENT),
            ],
        )?;
        self.get_public(&url, &self.search_headers()?, None).await
    }

    pub async fn featured_snaps(&self) -> Result<Fetched<Vec<SnapSummary>>, ApiError> {
        let url = Self::endpoint(
            &self.config.api_url,
            &["api", "v1", "snaps", "search"],
            &[("confinement", CONFINEMENT), ("q", ""), ("section", "featured")],
        )?;
        let results: Fetched<SearchResults> = self.get_public(&url, &self.search_headers()?, None).await?;
        Ok(results.map(SearchResults::into_snaps))
    }

    pub async fn promoted_snaps(&self) -> Result<Fetched<Vec<SnapSummary>>, ApiError> {
        let url = Self::endpoint(
            &self.config.api_url,
            &["api", "v1", "snaps", "search"],
            &[("promoted", "true"), ("confinement", CONFINEMENT)],
        )?;
        let mut headers = HeaderMap::new();
        headers.insert("x-ubuntu-series", Self::header_value(&self.config.series)?);
        let results: Fetched<SearchResults> = self.get_public(&url, &headers, None).await?;
        Ok(results.map(SearchResults::into_snaps))
    }

    pub async fn metrics(&self, queries: &[MetricsQuery]) -> Result<Fetched<Vec<MetricsResponse>>, ApiError> {
        let url = Self::endpoint(&self.config.api_url, &["api", "v1", "snaps", "metrics"], &[])?;
        let body = serde_json::to_value(queries).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.get_public(&url, &HeaderMap::new(), Some(&body)).await
    }

    // ===== Publisher =====

    /// Issue an authenticated request, refreshing the discharge when the
    /// store asks for it.
    async fn authed(
        &self,
        session: &mut Session,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<FetchOutcome, ApiError> {
        let mut refreshes = 0;

        loop {
            let authorization = match session.authorization_header() {
                Ok(authorization) => authorization,
                Err(AuthError::InvalidCredential(e)) => {
                    warn!(error = %e, "Session macaroons are unreadable, logging out");
                    empty_session(session);
                    return Err(AuthError::InvalidCredential(e).into());
                }
                Err(e) => return Err(e.into()),
            };
            let headers = self.publisher_headers(&authorization)?;

            let outcome = if method == Method::GET {
                self.accessor.fetch(url, &headers, body, Some(method.clone())).await?
            } else {
                FetchOutcome::fresh(self.accessor.send(url, &headers, body, Some(method.clone())).await?)
            };

            let response = &outcome.response;
            let refresh = needs_refresh(&response.headers);
            if !refresh && response.status.as_u16() < 400 {
                return Ok(outcome);
            }
            if refresh && refreshes >= self.config.max_refresh_attempts {
                warn!(url, refreshes, "Discharge still stale after refresh, giving up");
                return Err(ApiError::MacaroonRefreshRequired(refreshes));
            }
            if !refresh && error_list(response).is_some() {
                return Ok(outcome);
            }

            match self.broker.verify_response(response, session, url).await? {
                VerificationOutcome::NeedsRefresh => {
                    refreshes += 1;
                    info!(url, attempt = refreshes, "Re-issuing request with refreshed discharge");
                }
                VerificationOutcome::NeedsLogin => return Err(AuthError::NotAuthenticated.into()),
                VerificationOutcome::Forbidden => return Err(ApiError::Forbidden(url.to_string())),
                VerificationOutcome::NotFound => return Err(ApiError::NotFound(url.to_string())),
                VerificationOutcome::Ok | VerificationOutcome::Rejected(_) => return Ok(outcome),
            }
        }
    }

    async fn publisher_call(
        &self,
        session: &mut Session,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Fetched<Value>, ApiError> {
        let outcome = self.authed(session, method, url, body).await?;
        Ok(Fetched {
            data: process_response(&outcome.response)?,
            is_stale_due_to_error: outcome.is_stale_due_to_error,
        })
    }

    fn dashboard(&self, segments: &[&str]) -> Result<String, ApiError> {
        let mut path = vec!["dev", "api"];
        path.extend_from_slice(segments);
        Self::endpoint(&self.config.dashboard_url, &path, &[])
    }

    pub async fn account(&self, session: &mut Session) -> Result<Fetched<Account>, ApiError> {
        let url = self.dashboard(&["account"])?;
        let fetched = self.publisher_call(session, Method::GET, &url, None).await?;
        let account = serde_json::from_value(fetched.data)
            .map_err(|e| ApiError::InvalidResponse(format!("account: {}", e)))?;
        Ok(Fetched {
            data: account,
            is_stale_due_to_error: fetched.is_stale_due_to_error,
        })
    }

    pub async fn set_username(&self, session: &mut Session, username: &str) -> Result<(), ApiError> {
        let url = self.dashboard(&["account"])?;
        let body = serde_json::json!({ "short_namespace": username });
        self.publisher_call(session, Method::PATCH, &url, Some(&body)).await?;
        Ok(())
    }

    pub async fn accept_agreement(&self, session: &mut Session) -> Result<(), ApiError> {
        let url = self.dashboard(&["agreement", ""])?;
        let body = serde_json::json!({ "latest_tos_accepted": true });
        self.publisher_call(session, Method::POST, &url, Some(&body)).await?;
        Ok(())
    }

    pub async fn snap_metadata(&self, session: &mut Session, snap_id: &str) -> Result<Fetched<Value>, ApiError> {
        let url = self.dashboard(&["snaps", snap_id, "metadata"])?;
        self.publisher_call(session, Method::GET, &url, None).await
    }

    /// Update listing metadata. Fields outside `METADATA_FIELDS` are dropped.
    pub async fn update_snap_metadata(
        &self,
        session: &mut Session,
        snap_id: &str,
        changes: &Map<String, Value>,
    ) -> Result<Value, ApiError> {
        let url = self.dashboard(&["snaps", snap_id, "metadata"])?;
        let body = Value::Object(filter_metadata(changes));
        Ok(self.publisher_call(session, Method::PUT, &url, Some(&body)).await?.data)
    }

    pub async fn snap_status(&self, session: &mut Session, snap_id: &str) -> Result<Fetched<Value>, ApiError> {
        let url = self.dashboard(&["snaps", snap_id, "status"])?;
        self.publisher_call(session, Method::GET, &url, None).await
    }

    /// First login step: obtain a root macaroon, keep it in the session and
    /// return the caveat id the SSO has to discharge.
    pub async fn begin_login(&self, session: &mut Session) -> Result<String, ApiError> {
        let root = self.broker.request_root_macaroon().await?;
        let login_host = self
            .config
            .login_host()
            .ok_or_else(|| ApiError::InvalidRequest(format!("bad login URL {}", self.config.login_url)))?;
        let caveat = caveat_id(&root, &login_host)?.ok_or_else(|| {
            ApiError::InvalidResponse(format!("root macaroon has no caveat for {}", login_host))
        })?;
        debug!(login_host = %login_host, "Root macaroon obtained");
        session.set_root(root);
        Ok(caveat)
    }
}

pub fn filter_metadata(changes: &Map<String, Value>) -> Map<String, Value> {
    changes
        .iter()
        .filter(|(key, _)| METADATA_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn error_list(response: &ResponseSnapshot) -> Option<Vec<StoreError>> {
    let body: Value = serde_json::from_slice(&response.body).ok()?;
    serde_json::from_value(body.get("error_list")?.clone()).ok()
}

/// Decode a publisher response, turning store error payloads into errors.
pub fn process_response(response: &ResponseSnapshot) -> Result<Value, ApiError> {
    if response.is_success() {
        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        return response.json();
    }

    let status = response.status.as_u16();
    match error_list(response) {
        Some(errors) => {
            for error in &errors {
                if error.code == USER_NOT_READY {
                    if error.message.contains("has not signed agreement") {
                        return Err(ApiError::AgreementNotSigned);
                    }
                    if error.message.contains("missing namespace") {
                        return Err(ApiError::MissingUsername);
                    }
                }
            }
            Err(ApiError::ErrorList { status, errors })
        }
        None => Err(ApiError::from_status(status, &response.text())),
    }
}
