//! Data models for snap store payloads.
//!
//! - `SnapDetails`, `SnapSummary`, `SearchResults`: public catalogue data
//! - `MetricsQuery`, `MetricsResponse`: publisher metrics
//! - `Account`, `StoreError`: publisher account data and error payloads

pub mod account;
pub mod metrics;
pub mod snap;

pub use account::{Account, StoreError};
pub use metrics::{MetricsQuery, MetricsResponse, MetricsSeries};
pub use snap::{Link, SearchResults, SnapDetails, SnapSummary};
