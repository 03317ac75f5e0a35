use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Publisher account as returned by the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub namespace: Option<String>,
    pub username: Option<String>,
    pub displayname: Option<String>,
    pub email: Option<String>,
    /// Snaps keyed by series, then by snap name.
    pub snaps: HashMap<String, HashMap<String, Value>>,
}

impl Account {
    /// Names of the snaps registered for `series`, sorted.
    pub fn snap_names(&self, series: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .snaps
            .get(series)
            .map(|snaps| snaps.keys().map(String::as_str).collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}

/// One entry of a store `error_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreError {
    pub code: String,
    #[serde(default)]
    pub message: String,
}
