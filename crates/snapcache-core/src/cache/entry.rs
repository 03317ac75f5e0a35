use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::api::ApiError;

/// Status, headers and body of a store response, detached from the
/// connection so it can be cached and handed out repeatedly.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSnapshot {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ResponseSnapshot {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self { status, headers, body }
    }

    /// Read a live response to the end.
    pub async fn read(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(Self { status, headers, body })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("JSON decoding failed: {}", e)))
    }
}

/// Result of a cached fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub response: ResponseSnapshot,
    /// The live refresh failed and `response` is an expired cache entry.
    pub is_stale_due_to_error: bool,
}

impl FetchOutcome {
    pub fn fresh(response: ResponseSnapshot) -> Self {
        Self {
            response,
            is_stale_due_to_error: false,
        }
    }

    pub fn stale(response: ResponseSnapshot) -> Self {
        Self {
            response,
            is_stale_due_to_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub response: ResponseSnapshot,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(response: ResponseSnapshot) -> Self {
        Self {
            response,
            stored_at: Utc::now(),
        }
    }

    /// Age of the entry; zero if the clock went backwards.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.stored_at).to_std().unwrap_or_default()
    }

    pub fn is_fresh(&self, window: Duration) -> bool {
        self.age() <= window
    }

    pub fn age_display(&self) -> String {
        let secs = self.age().as_secs();
        if secs < 1 {
            "just now".to_string()
        } else if secs < 60 {
            format!("{}s ago", secs)
        } else if secs < 3600 {
            format!("{}m ago", secs / 60)
        } else if secs < 86400 {
            format!("{}h ago", secs / 3600)
        } else {
            format!("{}d ago", secs / 86400)
        }
    }
}

/// On-disk form of a `CacheEntry`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    stored_at: DateTime<Utc>,
}

impl From<&CacheEntry> for StoredEntry {
    fn from(entry: &CacheEntry) -> Self {
        let headers = entry
            .response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            status: entry.response.status.as_u16(),
            headers,
            body: STANDARD.encode(&entry.response.body),
            stored_at: entry.stored_at,
        }
    }
}

impl TryFrom<StoredEntry> for CacheEntry {
    type Error = anyhow::Error;

    fn try_from(stored: StoredEntry) -> Result<Self, Self::Error> {
        let mut headers = HeaderMap::new();
        for (name, value) in stored.headers {
            headers.append(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(&value)?,
            );
        }
        Ok(Self {
            response: ResponseSnapshot {
                status: StatusCode::from_u16(stored.status)?,
                headers,
                body: STANDARD.decode(stored.body)?,
            },
            stored_at: stored.stored_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(body: &str) -> ResponseSnapshot {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        ResponseSnapshot::new(StatusCode::OK, headers, body.as_bytes().to_vec())
    }

    #[test]
    fn test_entry_freshness() {
        let entry = CacheEntry::new(snapshot("{}"));
        assert!(entry.is_fresh(Duration::from_secs(5)));

        let mut old = CacheEntry::new(snapshot("{}"));
        old.stored_at = Utc::now() - chrono::Duration::seconds(10);
        assert!(!old.is_fresh(Duration::from_secs(5)));
        assert!(old.age() >= Duration::from_secs(10));
    }

    #[test]
    fn test_age_display() {
        let mut entry = CacheEntry::new(snapshot("{}"));
        assert_eq!(entry.age_display(), "just now");

        entry.stored_at = Utc::now() - chrono::Duration::seconds(42);
        assert_eq!(entry.age_display(), "42s ago");

        entry.stored_at = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(entry.age_display(), "5m ago");

        // Clock skew
        entry.stored_at = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(entry.age_display(), "just now");
    }

    #[test]
    fn test_snapshot_json() {
        let value: serde_json::Value = snapshot(r#"{"snap_id": "abc"}"#).json().unwrap();
        assert_eq!(value["snap_id"], "abc");
        assert!(snapshot("not json").json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_stored_entry_conversion() {
        let entry = CacheEntry::new(snapshot(r#"{"a": 1}"#));
        let stored = StoredEntry::from(&entry);
        let json = serde_json::to_string(&stored).unwrap();
        let restored = CacheEntry::try_from(serde_json::from_str::<StoredEntry>(&json).unwrap()).unwrap();
        assert_eq!(restored, entry);
    }
}
