use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Snap details from the stable channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapDetails {
    pub snap_id: String,
    pub package_name: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    pub version: Option<String>,
    pub revision: Option<i64>,
    pub license: Option<String>,
    pub publisher: Option<String>,
    pub screenshot_urls: Vec<String>,
    pub prices: HashMap<String, Value>,
    pub support_url: Option<String>,
    pub binary_filesize: Option<u64>,
    pub last_updated: Option<String>,
}

impl SnapDetails {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.package_name)
    }

    /// Binary size in decimal units, e.g. "12.3 MB".
    pub fn filesize_display(&self) -> Option<String> {
        const UNITS: [&str; 5] = ["Bytes", "kB", "MB", "GB", "TB"];
        let bytes = self.binary_filesize?;
        if bytes < 1000 {
            return Some(format!("{} Bytes", bytes));
        }
        let mut size = bytes as f64;
        let mut unit = 0;
        while size >= 1000.0 && unit < UNITS.len() - 1 {
            size /= 1000.0;
            unit += 1;
        }
        Some(format!("{:.1} {}", size, UNITS[unit]))
    }
}

/// A snap as it appears in search listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapSummary {
    pub snap_id: Option<String>,
    pub package_name: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub icon_url: Option<String>,
    pub publisher: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Embedded {
    #[serde(rename = "clickindex:package")]
    pub packages: Vec<SnapSummary>,
}

/// HAL search response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchResults {
    #[serde(rename = "_embedded")]
    pub embedded: Option<Embedded>,
    #[serde(rename = "_links")]
    pub links: HashMap<String, Link>,
}

impl SearchResults {
    pub fn snaps(&self) -> &[SnapSummary] {
        self.embedded
            .as_ref()
            .map(|e| e.packages.as_slice())
            .unwrap_or_default()
    }

    pub fn into_snaps(self) -> Vec<SnapSummary> {
        self.embedded.map(|e| e.packages).unwrap_or_default()
    }

    pub fn link(&self, rel: &str) -> Option<&str> {
        self.links.get(rel).map(|l| l.href.as_str())
    }
}
