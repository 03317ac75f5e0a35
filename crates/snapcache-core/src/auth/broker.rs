//! Macaroon auth broker.
//!
//! Builds the `Authorization` header from a session's credential pair,
//! recognises the store's refresh signal, and talks to the SSO and ACL
//! services to refresh discharges and classify failed responses.

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::macaroon::Macaroon;
use super::{AuthError, Session};
use crate::api::error::truncate_body;
use crate::cache::ResponseSnapshot;

/// Value of `WWW-Authenticate` the store sends when the discharge is stale.
pub const REFRESH_SENTINEL: &str = "Macaroon needs_refresh=1";

/// Permissions requested for a publisher root macaroon.
const ROOT_PERMISSIONS: &[&str] = &[
    "edit_account",
    "package_access",
    "package_manage",
    "package_upload",
    "package_upload_request",
    "package_purchase",
    "modify_account_key",
];

/// Bind `discharge` to `root` and format the header value.
pub fn build_header(root: &str, discharge: &str) -> Result<String, AuthError> {
    let root_macaroon = Macaroon::deserialize(root)?;
    let discharge_macaroon = Macaroon::deserialize(discharge)?;
    let bound = root_macaroon.prepare_for_request(&discharge_macaroon);
    Ok(format!("Macaroon root={}, discharge={}", root, bound.serialize()))
}

/// Id of the third-party caveat in `root` that `location` must discharge.
pub fn caveat_id(root: &str, location: &str) -> Result<Option<String>, AuthError> {
    Ok(Macaroon::deserialize(root)?.caveat_id_for(location))
}

pub fn is_authenticated(session: &Session) -> bool {
    session.is_authenticated()
}

/// Logout. Idempotent.
pub fn empty_session(session: &mut Session) {
    session.clear();
}

pub fn needs_refresh(headers: &HeaderMap) -> bool {
    headers
        .get(header::WWW_AUTHENTICATE)
        .map(|value| value == REFRESH_SENTINEL)
        .unwrap_or(false)
}

/// How the caller should react to a store response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Ok,
    /// The discharge was refreshed and stored; re-issue the request.
    NeedsRefresh,
    /// Credentials are no longer valid and have been cleared.
    NeedsLogin,
    Forbidden,
    NotFound,
    /// Valid account, failure not tied to credentials.
    Rejected(u16),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MacaroonVerification {
    #[serde(default)]
    pub account: Option<Value>,
    #[serde(default)]
    pub allowed: bool,
}

#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    /// SSO discharge refresh endpoint
    pub refresh_url: String,
    /// Store ACL verification endpoint
    pub verify_url: String,
    /// Store ACL endpoint issuing root macaroons
    pub acl_url: String,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    discharge_macaroon: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    discharge_macaroon: String,
}

#[derive(Deserialize)]
struct AclResponse {
    macaroon: String,
}

/// Clone is cheap - the reqwest client is shared.
#[derive(Clone)]
pub struct AuthBroker {
    client: Client,
    endpoints: AuthEndpoints,
}

impl AuthBroker {
    pub fn new(client: Client, endpoints: AuthEndpoints) -> Self {
        Self { client, endpoints }
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    fn service_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, application/hal+json"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, AuthError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::AuthService(format!(
                "{} returned {}: {}",
                url,
                status,
                truncate_body(&body)
            )))
        }
    }

    /// Exchange a stale discharge for a fresh one. No retry.
    pub async fn refresh(&self, discharge: &str) -> Result<String, AuthError> {
        debug!(url = %self.endpoints.refresh_url, "Refreshing discharge macaroon");
        let response = self
            .client
            .post(&self.endpoints.refresh_url)
            .headers(Self::service_headers())
            .json(&RefreshRequest {
                discharge_macaroon: discharge,
            })
            .send()
            .await?;

        let body: RefreshResponse = Self::check_response(response).await?.json().await?;
        Ok(body.discharge_macaroon)
    }

    /// Ask the store whether the credentials grant access to `url`.
    pub async fn verify_macaroon(
        &self,
        root: &str,
        discharge: &str,
        url: &str,
    ) -> Result<MacaroonVerification, AuthError> {
        let authorization = build_header(root, discharge)?;
        let body = serde_json::json!({
            "auth_data": {
                "authorization": authorization,
                "http_uri": url,
                "http_method": "GET",
            }
        });

        let response = self
            .client
            .post(&self.endpoints.verify_url)
            .headers(Self::service_headers())
            .json(&body)
            .send()
            .await?;

        Ok(Self::check_response(response).await?.json().await?)
    }

    /// Request a root macaroon carrying the publisher permissions. Login
    /// then asks the SSO to discharge its third-party caveat.
    pub async fn request_root_macaroon(&self) -> Result<String, AuthError> {
        let response = self
            .client
            .post(&self.endpoints.acl_url)
            .headers(Self::service_headers())
            .json(&serde_json::json!({ "permissions": ROOT_PERMISSIONS }))
            .send()
            .await?;

        let body: AclResponse = Self::check_response(response).await?.json().await?;
        Ok(body.macaroon)
    }

    /// Classify a store response for the session that issued it.
    ///
    /// A refresh signal refreshes the discharge in `session` before
    /// returning `NeedsRefresh`. Failed responses are checked against the
    /// ACL service; unusable credentials are cleared from the session.
    pub async fn verify_response(
        &self,
        response: &ResponseSnapshot,
        session: &mut Session,
        url: &str,
    ) -> Result<VerificationOutcome, AuthError> {
        if needs_refresh(&response.headers) {
            let discharge = session
                .macaroon_discharge
                .clone()
                .ok_or(AuthError::NotAuthenticated)?;
            let refreshed = self.refresh(&discharge).await?;
            session.set_discharge(refreshed);
            info!(url, "Macaroon discharge refreshed");
            return Ok(VerificationOutcome::NeedsRefresh);
        }

        let status = response.status.as_u16();
        if status < 400 {
            return Ok(VerificationOutcome::Ok);
        }

        let Some(pair) = session.credentials() else {
            empty_session(session);
            return Ok(VerificationOutcome::NeedsLogin);
        };

        let verification = match self.verify_macaroon(&pair.root, &pair.discharge, url).await {
            Ok(verification) => verification,
            Err(AuthError::InvalidCredential(e)) => {
                warn!(error = %e, "Stored macaroons are unreadable, clearing session");
                empty_session(session);
                return Ok(VerificationOutcome::NeedsLogin);
            }
            Err(e) => return Err(e),
        };

        if verification.account.is_none() {
            empty_session(session);
            return Ok(VerificationOutcome::NeedsLogin);
        }
        if status == 401 && !verification.allowed {
            return Ok(VerificationOutcome::Forbidden);
        }
        if status == 404 {
            return Ok(VerificationOutcome::NotFound);
        }
        Ok(VerificationOutcome::Rejected(status))
    }
}
