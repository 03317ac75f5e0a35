//! Response caching for outbound store calls.
//!
//! This module provides the `CachedAccessor`, which serves requests from a
//! short-lived response cache or the network, retries transient failures,
//! and falls back to a stale cached response when a refresh fails.
//!
//! Entries are keyed by a fingerprint of the prepared request (method, URL,
//! headers, body) and are considered stale after the freshness window
//! (5 seconds by default). Entries are replaced, never evicted.

pub mod accessor;
pub mod entry;
pub mod key;
pub mod retry;
pub mod store;

pub use accessor::CachedAccessor;
pub use entry::{CacheEntry, FetchOutcome, ResponseSnapshot};
pub use key::CacheKey;
pub use retry::RetryConfig;
pub use store::ResponseCache;
