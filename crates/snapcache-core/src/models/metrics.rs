use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Metric used by the snap details map.
pub const INSTALLED_BASE_BY_COUNTRY: &str = "installed_base_by_country_percent";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsQuery {
    pub metric_name: String,
    pub snap_id: String,
    /// `YYYY-MM-DD`
    pub start: String,
    /// `YYYY-MM-DD`
    pub end: String,
}

impl MetricsQuery {
    pub fn new(metric_name: &str, snap_id: &str, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            metric_name: metric_name.to_string(),
            snap_id: snap_id.to_string(),
            start: start.format("%Y-%m-%d").to_string(),
            end: end.format("%Y-%m-%d").to_string(),
        }
    }

    /// Installed base by country over the `days` leading up to `today`.
    ///
    /// `None` when `days` is negative or reaches past the calendar range.
    pub fn installed_base_by_country(snap_id: &str, today: NaiveDate, days: i64) -> Option<Self> {
        if days < 0 {
            return None;
        }
        let start = today.checked_sub_signed(Duration::try_days(days)?)?;
        Some(Self::new(INSTALLED_BASE_BY_COUNTRY, snap_id, start, today))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSeries {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

impl MetricsSeries {
    /// Mean of the reported values; missing days are skipped.
    pub fn average(&self) -> Option<f64> {
        let present: Vec<f64> = self.values.iter().flatten().copied().collect();
        if present.is_empty() {
            None
        } else {
            Some(present.iter().sum::<f64>() / present.len() as f64)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsResponse {
    pub metric_name: String,
    pub snap_id: Option<String>,
    pub status: Option<String>,
    pub buckets: Vec<String>,
    pub series: Vec<MetricsSeries>,
}
