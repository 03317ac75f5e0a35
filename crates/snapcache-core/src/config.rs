//! Application configuration management.
//!
//! This module handles loading and saving the configuration: store endpoint
//! base URLs, the device headers sent with catalogue requests, and the
//! caching, retry and refresh policies.
//!
//! Configuration is stored at `~/.config/snapcache/config.json`. Missing
//! fields fall back to defaults, and `SNAPCACHE_*_URL` environment
//! variables override the endpoints after loading. Endpoint URLs are kept
//! without a trailing slash wherever they come from.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::AuthEndpoints;
use crate::cache::RetryConfig;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "snapcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment overrides for the endpoint base URLs.
const ENV_API_URL: &str = "SNAPCACHE_API_URL";
const ENV_SEARCH_URL: &str = "SNAPCACHE_SEARCH_URL";
const ENV_DASHBOARD_URL: &str = "SNAPCACHE_DASHBOARD_URL";
const ENV_LOGIN_URL: &str = "SNAPCACHE_LOGIN_URL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public store API (details, metrics, featured and promoted listings)
    pub api_url: String,
    /// Search service
    pub search_url: String,
    /// Publisher dashboard API (account, metadata, ACL)
    pub dashboard_url: String,
    /// SSO (discharge refresh)
    pub login_url: String,
    pub series: String,
    pub architecture: String,
    pub freshness_window_secs: u64,
    pub retry: RetryConfig,
    /// Refreshes allowed per original request before giving up.
    pub max_refresh_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "https://api.snapcraft.io".to_string(),
            search_url: "https://search.apps.ubuntu.com".to_string(),
            dashboard_url: "https://dashboard.snapcraft.io".to_string(),
            login_url: "https://login.ubuntu.com".to_string(),
            series: "16".to_string(),
            architecture: "amd64".to_string(),
            freshness_window_secs: 5,
            retry: RetryConfig::default(),
            max_refresh_attempts: 1,
        }
    }
}

impl Config {
    /// Load from disk and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::parse(&std::fs::read_to_string(&path)?)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse(contents: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(contents)?;
        config.trim_urls();
        Ok(config)
    }

    fn trim_urls(&mut self) {
        for url in [
            &mut self.api_url,
            &mut self.search_url,
            &mut self.dashboard_url,
            &mut self.login_url,
        ] {
            let trimmed = url.trim_end_matches('/').len();
            url.truncate(trimmed);
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let targets = [
            (ENV_API_URL, &mut self.api_url),
            (ENV_SEARCH_URL, &mut self.search_url),
            (ENV_DASHBOARD_URL, &mut self.dashboard_url),
            (ENV_LOGIN_URL, &mut self.login_url),
        ];
        for (name, target) in targets {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                debug!(var = name, url = %value, "Endpoint overridden from environment");
                *target = value;
            }
        }
        self.trim_urls();
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn auth_endpoints(&self) -> AuthEndpoints {
        AuthEndpoints {
            refresh_url: format!("{}/api/v2/tokens/refresh", self.login_url),
            verify_url: format!("{}/dev/api/acl/verify/", self.dashboard_url),
            acl_url: format!("{}/dev/api/acl/", self.dashboard_url),
        }
    }

    /// Host of the SSO; root macaroons carry a third-party caveat for it.
    pub fn login_host(&self) -> Option<String> {
        url::Url::parse(&self.login_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}
